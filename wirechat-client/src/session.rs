use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use wirechat_core::{
    Ack, CODE_OK, CardContent, ClientFrame, HISTORY_PAGE_SIZE, Message, MessageId, MessageStatus,
    PeerProfile, ProtocolError, RECALL_PLACEHOLDER_RECEIVED, RECALL_PLACEHOLDER_SENT, RequestId,
    ServerFrame, SystemEventKind, UserId, validate_outgoing_text,
};

use crate::api::ChatApi;
use crate::config::{ClientConfig, CredentialStore};
use crate::conversations::{Conversation, ConversationStore};
use crate::notices::{NoticeBook, SystemNotice};
use crate::notify::{Notification, Notifier};
use crate::persist::{self, SavedState};
use crate::transport::{Transport, TransportLink};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is shut down")]
    Closed,
    #[error("not connected")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
    #[error("unknown conversation: {0}")]
    UnknownConversation(String),
    #[error("invalid message: {0}")]
    Invalid(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Authenticating,
    /// Handshake was rejected. The transport stays open but unusable; only
    /// a fresh connect cycle retries authentication.
    AuthFailed,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Success,
    Error,
}

/// What the embedding UI observes. State itself is pulled via
/// [`SessionHandle::snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(ConnectionStatus),
    AuthFailed { code: u16, msg: String },
    Toast { level: ToastLevel, text: String },
    ChatListUpdated,
    ConversationUpdated { key: String },
    NoticeAdded { id: u64 },
    NoticeCount { unread: u32 },
}

/// Reconnect delay as a step function of the cumulative attempt count.
pub fn reconnect_delay(attempts: u32) -> Duration {
    if attempts <= 50 {
        Duration::from_millis(1_000)
    } else if attempts <= 100 {
        Duration::from_millis(5_000)
    } else if attempts <= 500 {
        Duration::from_millis(10_000)
    } else {
        Duration::from_millis(20_000)
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub active: Option<String>,
    pub conversations: Vec<Conversation>,
    pub notices: Vec<SystemNotice>,
    pub notice_count: u32,
    pub history_exhausted: bool,
}

enum Command {
    Connect,
    Disconnect,
    Send {
        to_user_id: UserId,
        content: String,
        card: Option<CardContent>,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    Recall {
        message_id: MessageId,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    SelectChat {
        key: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    LoadOlder {
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    MarkNoticeRead {
        id: u64,
    },
    MarkAllNoticesRead,
    ClearNotices,
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// What an in-flight request id resolves into when its ack arrives.
enum PendingRequest {
    Auth,
    Send {
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    Recall {
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    MarkRead {
        message_id: MessageId,
    },
    MarkAllRead {
        from_user_id: UserId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Reconnect,
    AuthDeadline,
}

enum Tick {
    Command(Option<Command>),
    Frame(Option<ServerFrame>),
    Heartbeat,
    Timer,
}

/// Cloneable front door to the session actor. All calls are serialized
/// through the actor's command channel; request-shaped ones carry a
/// caller-side deadline so an unresponsive server yields a typed timeout
/// instead of an indefinite wait.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    op_deadline: Duration,
}

impl SessionHandle {
    pub fn connect(&self) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::Connect)
            .map_err(|_| SessionError::Closed)
    }

    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::Disconnect)
            .map_err(|_| SessionError::Closed)
    }

    pub async fn send_text(
        &self,
        to_user_id: UserId,
        content: impl Into<String>,
    ) -> Result<bool, SessionError> {
        self.send_message(to_user_id, content.into(), None).await
    }

    pub async fn send_card(
        &self,
        to_user_id: UserId,
        content: impl Into<String>,
        card: CardContent,
    ) -> Result<bool, SessionError> {
        self.send_message(to_user_id, content.into(), Some(card)).await
    }

    async fn send_message(
        &self,
        to_user_id: UserId,
        content: String,
        card: Option<CardContent>,
    ) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                to_user_id,
                content,
                card,
                reply,
            })
            .map_err(|_| SessionError::Closed)?;
        self.await_reply(rx).await
    }

    pub async fn recall(&self, message_id: MessageId) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Recall { message_id, reply })
            .map_err(|_| SessionError::Closed)?;
        self.await_reply(rx).await
    }

    pub async fn select_chat(&self, key: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SelectChat {
                key: key.into(),
                reply,
            })
            .map_err(|_| SessionError::Closed)?;
        self.await_reply(rx).await
    }

    pub async fn load_older(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::LoadOlder { reply })
            .map_err(|_| SessionError::Closed)?;
        self.await_reply(rx).await
    }

    pub fn mark_notice_read(&self, id: u64) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::MarkNoticeRead { id })
            .map_err(|_| SessionError::Closed)
    }

    pub fn mark_all_notices_read(&self) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::MarkAllNoticesRead)
            .map_err(|_| SessionError::Closed)
    }

    pub fn clear_notices(&self) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::ClearNotices)
            .map_err(|_| SessionError::Closed)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot { reply })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    async fn await_reply<T>(
        &self,
        rx: oneshot::Receiver<Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        match timeout(self.op_deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::Timeout),
        }
    }
}

pub struct ChatSession {
    config: ClientConfig,
    credentials: Arc<dyn CredentialStore>,
    api: Arc<dyn ChatApi>,
    notifier: Arc<dyn Notifier>,
    transport: Arc<dyn Transport>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    store: ConversationStore,
    notices: NoticeBook,
    status: ConnectionStatus,
    link: Option<TransportLink>,
    pending: HashMap<RequestId, PendingRequest>,
    next_request_id: RequestId,
    reconnect_attempts: u32,
    outstanding_pings: u32,
    timer: Option<(Instant, TimerKind)>,
    self_id: Option<UserId>,
}

impl ChatSession {
    /// Builds the actor without spawning it, handing the caller the run
    /// future. Persisted state is loaded eagerly here.
    pub fn new(
        config: ClientConfig,
        credentials: Arc<dyn CredentialStore>,
        api: Arc<dyn ChatApi>,
        notifier: Arc<dyn Notifier>,
        transport: Arc<dyn Transport>,
    ) -> (
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
        ChatSession,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let saved = persist::load_state_or_default(&persist::state_path(&config.data_dir));
        let handle = SessionHandle {
            cmd_tx,
            op_deadline: config.connect_timeout + config.request_timeout,
        };
        let session = ChatSession {
            config,
            credentials,
            api,
            notifier,
            transport,
            cmd_rx,
            event_tx,
            store: ConversationStore::from_saved(saved.conversations),
            notices: NoticeBook::from_saved(saved.notices),
            status: ConnectionStatus::Disconnected,
            link: None,
            pending: HashMap::new(),
            next_request_id: 0,
            reconnect_attempts: 0,
            outstanding_pings: 0,
            timer: None,
            self_id: None,
        };
        (handle, event_rx, session)
    }

    pub fn spawn(
        config: ClientConfig,
        credentials: Arc<dyn CredentialStore>,
        api: Arc<dyn ChatApi>,
        notifier: Arc<dyn Notifier>,
        transport: Arc<dyn Transport>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (handle, event_rx, session) =
            Self::new(config, credentials, api, notifier, transport);
        tokio::spawn(session.run());
        (handle, event_rx)
    }

    pub async fn run(mut self) {
        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let connected = self.status == ConnectionStatus::Connected;
            let timer_armed = self.timer.is_some();
            let timer_deadline = self
                .timer
                .map(|(deadline, _)| deadline)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3_600));

            let tick = tokio::select! {
                command = self.cmd_rx.recv() => Tick::Command(command),
                frame = next_frame(&mut self.link) => Tick::Frame(frame),
                _ = heartbeat.tick(), if connected => Tick::Heartbeat,
                _ = time::sleep_until(timer_deadline), if timer_armed => Tick::Timer,
            };

            match tick {
                Tick::Command(None) => {
                    self.teardown();
                    break;
                }
                Tick::Command(Some(command)) => self.handle_command(command).await,
                Tick::Frame(None) => self.on_link_lost("server closed the connection"),
                Tick::Frame(Some(frame)) => self.handle_frame(frame).await,
                Tick::Heartbeat => self.on_heartbeat(),
                Tick::Timer => self.on_timer().await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.try_connect().await,
            Command::Disconnect => self.teardown(),
            Command::Send {
                to_user_id,
                content,
                card,
                reply,
            } => self.handle_send(to_user_id, content, card, reply).await,
            Command::Recall { message_id, reply } => self.handle_recall(message_id, reply),
            Command::SelectChat { key, reply } => {
                let result = self.handle_select(key).await;
                let _ = reply.send(result);
            }
            Command::LoadOlder { reply } => {
                let result = self.handle_load_older().await;
                let _ = reply.send(result);
            }
            Command::MarkNoticeRead { id } => {
                if self.notices.mark_read(id) {
                    self.persist();
                    self.emit(SessionEvent::NoticeCount {
                        unread: self.notices.unread_count(),
                    });
                }
            }
            Command::MarkAllNoticesRead => {
                self.notices.mark_all_read();
                self.persist();
                self.emit(SessionEvent::NoticeCount { unread: 0 });
                self.toast(ToastLevel::Success, "all notices marked as read");
            }
            Command::ClearNotices => {
                self.notices.clear();
                self.persist();
                self.emit(SessionEvent::NoticeCount { unread: 0 });
                self.toast(ToastLevel::Success, "notices cleared");
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Opens the transport and starts the handshake. No-op while a link is
    /// alive; silently stays disconnected without credentials.
    async fn try_connect(&mut self) {
        if self.link.is_some() {
            return;
        }
        let Some(credentials) = self.credentials.load() else {
            debug!("no stored credentials, not connecting");
            self.clear_timer();
            self.reconnect_attempts = 0;
            self.set_status(ConnectionStatus::Disconnected);
            return;
        };

        self.set_status(ConnectionStatus::Connecting);
        let dialed = timeout(
            self.config.connect_timeout,
            self.transport.connect(&self.config.server_url),
        )
        .await;

        match dialed {
            Ok(Ok(link)) => {
                self.link = Some(link);
                self.outstanding_pings = 0;
                self.self_id = Some(credentials.user_id);
                self.set_status(ConnectionStatus::Authenticating);
                let id = self.allocate_request(PendingRequest::Auth);
                self.send_frame(ClientFrame::CreateSession {
                    id,
                    user_id: credentials.user_id,
                    platform: self.config.platform.clone(),
                    token: credentials.token,
                });
                // An unacknowledged handshake counts as a dead link.
                self.arm_timer(self.config.request_timeout, TimerKind::AuthDeadline);
            }
            Ok(Err(err)) => {
                warn!("connect failed: {}", err);
                self.set_status(ConnectionStatus::Disconnected);
                self.schedule_reconnect();
            }
            Err(_) => {
                warn!("connect timed out after {:?}", self.config.connect_timeout);
                self.set_status(ConnectionStatus::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    async fn handle_send(
        &mut self,
        to_user_id: UserId,
        content: String,
        card: Option<CardContent>,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    ) {
        if let Err(err) = validate_outgoing_text(&content) {
            let _ = reply.send(Err(SessionError::Invalid(err)));
            return;
        }

        if self.status != ConnectionStatus::Connected {
            // One synchronous reconnect attempt; authentication completes
            // asynchronously, so the send itself still fails and the
            // caller keeps its input.
            self.try_connect().await;
            if self.status != ConnectionStatus::Connected {
                self.toast(ToastLevel::Error, "network unavailable, try again shortly");
                let _ = reply.send(Ok(false));
                return;
            }
        }

        let id = self.allocate_request(PendingRequest::Send { reply });
        let frame = match card {
            Some(card) => ClientFrame::SendCard {
                id,
                to_user_id,
                content,
                card,
            },
            None => ClientFrame::SendText {
                id,
                to_user_id,
                content,
            },
        };
        self.send_frame(frame);
    }

    fn handle_recall(
        &mut self,
        message_id: MessageId,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    ) {
        if self.status != ConnectionStatus::Connected || self.link.is_none() {
            self.toast(ToastLevel::Error, "connection is down");
            let _ = reply.send(Ok(false));
            return;
        }
        let id = self.allocate_request(PendingRequest::Recall { reply });
        self.send_frame(ClientFrame::RecallMessage { id, message_id });
    }

    async fn handle_select(&mut self, key: String) -> Result<(), SessionError> {
        if !self.store.select(&key) {
            return Err(SessionError::UnknownConversation(key));
        }

        self.fetch_history_page(1).await;
        self.store.reset_unread_active();

        // Acknowledge everything still unread from the peer.
        let ack_target = self.store.active_conversation().and_then(|conversation| {
            if conversation.is_group {
                return None;
            }
            let peer_id = conversation.peer.id;
            let pending_unread = conversation.messages.iter().any(|message| {
                message.sender_id == peer_id
                    && message.status != MessageStatus::Read
                    && message.status != MessageStatus::Recalled
            });
            pending_unread.then_some(peer_id)
        });
        if let Some(from_user_id) = ack_target
            && self.status == ConnectionStatus::Connected
        {
            let id = self.allocate_request(PendingRequest::MarkAllRead { from_user_id });
            self.send_frame(ClientFrame::MarkAllRead { id, from_user_id });
        }

        self.persist();
        self.emit(SessionEvent::ConversationUpdated { key });
        Ok(())
    }

    async fn handle_load_older(&mut self) -> Result<bool, SessionError> {
        if self.store.active().is_none() {
            return Err(SessionError::UnknownConversation(
                "no conversation selected".to_owned(),
            ));
        }
        if self.store.history_exhausted() {
            return Ok(false);
        }
        let next_page = self.store.history_page() + 1;
        let applied = self.fetch_history_page(next_page).await;
        if applied {
            self.persist();
            if let Some(key) = self.store.active() {
                let key = key.to_owned();
                self.emit(SessionEvent::ConversationUpdated { key });
            }
        }
        Ok(applied)
    }

    /// Fetches one backward page for the focused conversation and feeds it
    /// into the store. Fetch failures surface a toast and leave the
    /// exhausted flag untouched so a later retry stays possible.
    async fn fetch_history_page(&mut self, page: u32) -> bool {
        let Some(conversation) = self.store.active_conversation() else {
            return false;
        };
        let is_group = conversation.is_group;
        let group_id = conversation.group_id;
        let peer_id = conversation.peer.id;

        let Some(self_id) = self
            .self_id
            .or_else(|| self.credentials.load().map(|credentials| credentials.user_id))
        else {
            self.toast(ToastLevel::Error, "no stored credentials");
            return false;
        };

        let fetched = if is_group {
            self.api
                .group_history(group_id.unwrap_or_default(), page, HISTORY_PAGE_SIZE)
                .await
        } else {
            self.api
                .history(self_id, peer_id, page, HISTORY_PAGE_SIZE)
                .await
        };

        match fetched {
            Ok(messages) => self.store.apply_history_page(page, messages),
            Err(err) => {
                warn!("history fetch failed: {}", err);
                self.toast(
                    ToastLevel::Error,
                    format!("failed to load message history: {err}"),
                );
                false
            }
        }
    }

    async fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Ack(ack) => self.handle_ack(ack).await,
            ServerFrame::Pong => {
                self.outstanding_pings = 0;
                debug!("heartbeat pong");
            }
            ServerFrame::PrivateMessage { message, sender } => {
                self.handle_private_message(message, sender);
            }
            ServerFrame::MessageRead { message_id, status } => {
                if self.store.apply_read(message_id, status) {
                    self.persist();
                    self.emit_active_updated();
                }
            }
            ServerFrame::AllMessagesRead { status } => {
                if status && self.store.mark_all_read() > 0 {
                    self.persist();
                    self.emit_active_updated();
                }
            }
            ServerFrame::MessageRecalled {
                message_id,
                recalled_at_ms,
                ..
            } => {
                match self
                    .store
                    .apply_recall(message_id, RECALL_PLACEHOLDER_RECEIVED, recalled_at_ms)
                {
                    Some(key) => {
                        self.persist();
                        self.emit(SessionEvent::ConversationUpdated { key });
                    }
                    None => debug!("recall for unknown or already-recalled message {message_id}"),
                }
            }
            ServerFrame::RecallResult {
                code,
                message_id,
                recalled_at_ms,
            } => {
                if code != CODE_OK {
                    debug!(code, "recall result reported failure");
                    return;
                }
                if let Some(key) =
                    self.store
                        .apply_recall(message_id, RECALL_PLACEHOLDER_SENT, recalled_at_ms)
                {
                    self.persist();
                    self.emit(SessionEvent::ConversationUpdated { key });
                }
            }
            ServerFrame::SystemMessage {
                kind,
                from_user_id,
                from_username,
                ..
            } => self.handle_system_message(kind, from_user_id, from_username),
            ServerFrame::SessionRejected { code, msg } => {
                error!(code, "session rejected by server: {}", msg);
                self.toast(ToastLevel::Error, msg);
            }
        }
    }

    async fn handle_ack(&mut self, ack: Ack) {
        let Some(pending) = self.pending.remove(&ack.id) else {
            debug!("ack for unknown request {}", ack.id);
            return;
        };

        match pending {
            PendingRequest::Auth => self.finish_auth(ack).await,
            PendingRequest::Send { reply } => {
                if ack.code != CODE_OK {
                    let msg = ack.msg.unwrap_or_else(|| "message send failed".to_owned());
                    self.toast(ToastLevel::Error, msg);
                    let _ = reply.send(Ok(false));
                    return;
                }
                let canonical = ack
                    .data
                    .and_then(|data| serde_json::from_value::<Message>(data).ok());
                match canonical {
                    Some(message) => {
                        if let Some(key) = self.store.append_sent(message) {
                            self.persist();
                            self.emit(SessionEvent::ConversationUpdated { key });
                        }
                        let _ = reply.send(Ok(true));
                    }
                    None => {
                        warn!("send ack is missing the canonical message");
                        self.toast(ToastLevel::Error, "malformed server reply");
                        let _ = reply.send(Ok(false));
                    }
                }
            }
            PendingRequest::Recall { reply } => {
                if ack.code == CODE_OK {
                    let _ = reply.send(Ok(true));
                } else {
                    let msg = ack.msg.unwrap_or_else(|| "message recall failed".to_owned());
                    self.toast(ToastLevel::Error, msg);
                    let _ = reply.send(Ok(false));
                }
            }
            PendingRequest::MarkRead { message_id } => {
                if ack.code == CODE_OK {
                    if self.store.apply_read(message_id, MessageStatus::Read) {
                        self.persist();
                        self.emit_active_updated();
                    }
                } else {
                    let msg = ack
                        .msg
                        .unwrap_or_else(|| "failed to mark message read".to_owned());
                    self.toast(ToastLevel::Error, msg);
                }
            }
            PendingRequest::MarkAllRead { from_user_id } => {
                if ack.code == CODE_OK {
                    if self.store.mark_all_read_from(from_user_id) > 0 {
                        self.persist();
                        self.emit_active_updated();
                    }
                } else {
                    let msg = ack
                        .msg
                        .unwrap_or_else(|| "failed to mark messages read".to_owned());
                    self.toast(ToastLevel::Error, msg);
                }
            }
        }
    }

    async fn finish_auth(&mut self, ack: Ack) {
        self.clear_timer();
        if ack.code != CODE_OK {
            let msg = ack
                .msg
                .unwrap_or_else(|| "authentication rejected".to_owned());
            error!(code = ack.code, "authentication failed: {}", msg);
            self.set_status(ConnectionStatus::AuthFailed);
            self.emit(SessionEvent::AuthFailed {
                code: ack.code,
                msg: msg.clone(),
            });
            self.toast(ToastLevel::Error, msg);
            return;
        }

        info!("session authenticated");
        self.reconnect_attempts = 0;
        self.outstanding_pings = 0;
        self.set_status(ConnectionStatus::Connected);
        self.emit(SessionEvent::NoticeCount {
            unread: self.notices.unread_count(),
        });
        self.refresh_chat_list().await;
    }

    async fn refresh_chat_list(&mut self) {
        match self.api.chat_list().await {
            Ok(entries) => {
                let self_id = self.self_id.unwrap_or_default();
                self.store.rebuild(entries, self_id);
                self.persist();
                self.emit(SessionEvent::ChatListUpdated);
            }
            Err(err) => {
                warn!("chat list refresh failed: {}", err);
                self.toast(ToastLevel::Error, format!("failed to load chat list: {err}"));
            }
        }
    }

    fn handle_private_message(&mut self, message: Message, sender: PeerProfile) {
        self.notifier.notify(Notification {
            title: format!("new message from {}", sender.display_name()),
            body: message.content.clone(),
            sender_id: sender.id,
            sender_name: sender.username.clone(),
            icon_url: sender.avatar.clone(),
        });

        let message_id = message.id;
        let already_read = message.status == MessageStatus::Read;
        let outcome = self.store.apply_inbound(&sender, message);

        if outcome.was_active && self.status == ConnectionStatus::Connected && !already_read {
            let id = self.allocate_request(PendingRequest::MarkRead { message_id });
            self.send_frame(ClientFrame::MarkRead { id, message_id });
        }

        self.persist();
        self.emit(SessionEvent::ConversationUpdated { key: outcome.key });
    }

    fn handle_system_message(
        &mut self,
        kind: SystemEventKind,
        from_user_id: UserId,
        from_username: String,
    ) {
        let (level, text) = match kind {
            SystemEventKind::FriendRequest => (
                ToastLevel::Info,
                format!("friend request from {from_username}"),
            ),
            SystemEventKind::FriendAccepted => (
                ToastLevel::Success,
                format!("{from_username} accepted your friend request"),
            ),
            SystemEventKind::FriendRejected => (
                ToastLevel::Error,
                format!("{from_username} rejected your friend request"),
            ),
        };
        self.toast(level, text);

        let id = self
            .notices
            .record(kind, from_user_id, from_username, now_unix_ms())
            .id;
        self.persist();
        self.emit(SessionEvent::NoticeAdded { id });
        self.emit(SessionEvent::NoticeCount {
            unread: self.notices.unread_count(),
        });
    }

    fn on_heartbeat(&mut self) {
        if self.outstanding_pings >= self.config.max_missed_pongs {
            warn!(
                "no pong after {} pings, forcing reconnect",
                self.outstanding_pings
            );
            self.on_link_lost("heartbeat timed out");
            return;
        }
        self.outstanding_pings += 1;
        self.send_frame(ClientFrame::Ping);
    }

    async fn on_timer(&mut self) {
        let Some((_, kind)) = self.timer.take() else {
            return;
        };
        match kind {
            TimerKind::Reconnect => {
                if self.credentials.load().is_none() {
                    info!("credentials gone, cancelling reconnect");
                    self.reconnect_attempts = 0;
                    return;
                }
                self.reconnect_attempts += 1;
                debug!(attempt = self.reconnect_attempts, "reconnecting");
                self.try_connect().await;
            }
            TimerKind::AuthDeadline => {
                if self.status == ConnectionStatus::Authenticating {
                    warn!("authentication timed out");
                    self.drop_link();
                    self.set_status(ConnectionStatus::Disconnected);
                    self.schedule_reconnect();
                }
            }
        }
    }

    /// An established link died: tear it down and retry immediately (the
    /// backoff schedule governs the attempts after that).
    fn on_link_lost(&mut self, reason: &str) {
        if self.link.is_none() && self.status == ConnectionStatus::Disconnected {
            return;
        }
        warn!("connection lost: {}", reason);
        self.drop_link();
        self.set_status(ConnectionStatus::Disconnected);
        if self.credentials.load().is_some() {
            self.arm_timer(Duration::ZERO, TimerKind::Reconnect);
        } else {
            self.clear_timer();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.credentials.load().is_none() {
            self.clear_timer();
            return;
        }
        let delay = reconnect_delay(self.reconnect_attempts.saturating_add(1));
        self.arm_timer(delay, TimerKind::Reconnect);
    }

    /// Single clean teardown path: stops every timer, fails in-flight
    /// requests and closes the link. Safe to call from any state.
    fn teardown(&mut self) {
        self.clear_timer();
        self.drop_link();
        self.reconnect_attempts = 0;
        self.outstanding_pings = 0;
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn drop_link(&mut self) {
        self.link = None;
        for (_, pending) in self.pending.drain() {
            match pending {
                PendingRequest::Send { reply } | PendingRequest::Recall { reply } => {
                    let _ = reply.send(Err(SessionError::Disconnected));
                }
                PendingRequest::Auth
                | PendingRequest::MarkRead { .. }
                | PendingRequest::MarkAllRead { .. } => {}
            }
        }
    }

    fn allocate_request(&mut self, pending: PendingRequest) -> RequestId {
        self.next_request_id += 1;
        let id = self.next_request_id;
        self.pending.insert(id, pending);
        id
    }

    fn send_frame(&mut self, frame: ClientFrame) {
        let delivered = self
            .link
            .as_ref()
            .is_some_and(|link| link.outbound.send(frame).is_ok());
        if !delivered {
            self.on_link_lost("write channel closed");
        }
    }

    fn arm_timer(&mut self, delay: Duration, kind: TimerKind) {
        self.timer = Some((Instant::now() + delay, kind));
    }

    fn clear_timer(&mut self) {
        self.timer = None;
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.emit(SessionEvent::Status(status));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_active_updated(&self) {
        if let Some(key) = self.store.active() {
            self.emit(SessionEvent::ConversationUpdated {
                key: key.to_owned(),
            });
        }
    }

    fn toast(&self, level: ToastLevel, text: impl Into<String>) {
        self.emit(SessionEvent::Toast {
            level,
            text: text.into(),
        });
    }

    fn persist(&self) {
        let state = SavedState {
            notices: self.notices.to_saved(),
            conversations: self.store.to_saved(),
        };
        let path = persist::state_path(&self.config.data_dir);
        if let Err(err) = persist::save_state_with_retry(&path, &state) {
            warn!("failed to persist session state: {}", err);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            reconnect_attempts: self.reconnect_attempts,
            active: self.store.active().map(str::to_owned),
            conversations: self.store.to_saved(),
            notices: self.notices.to_saved(),
            notice_count: self.notices.unread_count(),
            history_exhausted: self.store.history_exhausted(),
        }
    }
}

async fn next_frame(link: &mut Option<TransportLink>) -> Option<ServerFrame> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}
