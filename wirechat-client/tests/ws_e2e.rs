use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::timeout,
};

use wirechat_client::api::{ApiError, ChatApi};
use wirechat_client::config::{ClientConfig, Credentials, MemoryCredentialStore};
use wirechat_client::notify::{Notification, Notifier};
use wirechat_client::session::{ChatSession, ConnectionStatus, SessionEvent, SessionHandle};
use wirechat_client::transport::WsTransport;
use wirechat_core::{
    Ack, CODE_OK, ChatListEntry, ClientFrame, GroupId, Message, MessageKind, MessageStatus,
    PeerProfile, ServerFrame, UserId, decode_client_frame, encode_server_frame,
};

const SELF_ID: UserId = 99;
const GOOD_TOKEN: &str = "good-token";

/// Minimal scripted chat server: accepts one known token, acks every
/// request, answers heartbeats.
async fn start_server(route: axum::routing::MethodRouter) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral server socket");
    let address = listener.local_addr().expect("server local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let router = Router::new().route("/ws", route);
    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("ws://{address}/ws"), shutdown_tx)
}

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_socket)
}

async fn noisy_ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_noisy_socket)
}

async fn handle_socket(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = decode_client_frame(text.as_str()) else {
            continue;
        };
        for reply in script_reply(frame) {
            let encoded = encode_server_frame(&reply).expect("encode scripted reply");
            if socket.send(WsMessage::Text(encoded.into())).await.is_err() {
                return;
            }
        }
    }
}

/// Same script, but every reply is preceded by frames the client must
/// drop: raw garbage and a well-formed envelope with an unknown tag.
async fn handle_noisy_socket(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = decode_client_frame(text.as_str()) else {
            continue;
        };
        let junk = ["this is not json", "{\"type\":\"mystery\",\"data\":{}}"];
        for noise in junk {
            if socket.send(WsMessage::Text(noise.into())).await.is_err() {
                return;
            }
        }
        for reply in script_reply(frame) {
            let encoded = encode_server_frame(&reply).expect("encode scripted reply");
            if socket.send(WsMessage::Text(encoded.into())).await.is_err() {
                return;
            }
        }
    }
}

fn script_reply(frame: ClientFrame) -> Vec<ServerFrame> {
    match frame {
        ClientFrame::CreateSession { id, token, .. } => {
            if token == GOOD_TOKEN {
                vec![ack(id, CODE_OK, None, None)]
            } else {
                vec![ack(id, 401, Some("invalid token"), None)]
            }
        }
        ClientFrame::SendText {
            id,
            to_user_id,
            content,
        } => {
            let canonical = Message {
                id: 901,
                sender_id: SELF_ID,
                receiver_id: to_user_id,
                group_id: None,
                content,
                kind: MessageKind::Text,
                card: None,
                status: MessageStatus::Delivered,
                created_at_ms: 5_000,
            };
            let data = serde_json::to_value(&canonical).expect("canonical message json");
            vec![ack(id, CODE_OK, None, Some(data))]
        }
        ClientFrame::SendCard { id, .. }
        | ClientFrame::RecallMessage { id, .. }
        | ClientFrame::MarkRead { id, .. }
        | ClientFrame::MarkAllRead { id, .. } => vec![ack(id, CODE_OK, None, None)],
        ClientFrame::Ping => vec![ServerFrame::Pong],
    }
}

fn ack(id: u64, code: u16, msg: Option<&str>, data: Option<serde_json::Value>) -> ServerFrame {
    ServerFrame::Ack(Ack {
        id,
        code,
        msg: msg.map(str::to_owned),
        data,
    })
}

struct StaticApi;

#[async_trait]
impl ChatApi for StaticApi {
    async fn chat_list(&self) -> Result<Vec<ChatListEntry>, ApiError> {
        Ok(vec![ChatListEntry {
            list_id: 10,
            peer: PeerProfile {
                id: 1,
                username: "alice".to_owned(),
                nickname: None,
                avatar: None,
                online: true,
            },
            is_group: false,
            group_id: None,
            last_msg: String::new(),
            last_msg_at_ms: 0,
            unread: 0,
            pinned: false,
            muted: false,
        }])
    }

    async fn history(
        &self,
        _sender_id: UserId,
        _receiver_id: UserId,
        _page: u32,
        _page_size: u32,
    ) -> Result<Vec<Message>, ApiError> {
        Ok(Vec::new())
    }

    async fn group_history(
        &self,
        _group_id: GroupId,
        _page: u32,
        _page_size: u32,
    ) -> Result<Vec<Message>, ApiError> {
        Ok(Vec::new())
    }
}

struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn notify(&self, _notification: Notification) {}
}

struct Client {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    _data_dir: tempfile::TempDir,
}

fn spawn_client(server_url: &str, token: &str) -> Client {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let config = ClientConfig::new(server_url, "http://127.0.0.1:1/api", data_dir.path());
    let credentials = MemoryCredentialStore::with(Credentials {
        user_id: SELF_ID,
        username: "me".to_owned(),
        token: token.to_owned(),
    });
    let (handle, events) = ChatSession::spawn(
        config,
        Arc::new(credentials),
        Arc::new(StaticApi),
        Arc::new(SilentNotifier),
        Arc::new(WsTransport),
    );
    Client {
        handle,
        events,
        _data_dir: data_dir,
    }
}

async fn wait_for_status(client: &mut Client, want: ConnectionStatus) {
    timeout(Duration::from_secs(5), async {
        loop {
            match client.events.recv().await {
                Some(SessionEvent::Status(status)) if status == want => break,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("status within deadline");
}

#[tokio::test]
async fn session_authenticates_over_a_real_websocket() {
    let (server_url, shutdown_tx) = start_server(get(ws_handler)).await;
    let mut client = spawn_client(&server_url, GOOD_TOKEN);

    client.handle.connect().expect("session alive");
    wait_for_status(&mut client, ConnectionStatus::Connected).await;

    let snapshot = client.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert!(
        snapshot
            .conversations
            .iter()
            .any(|conversation| conversation.peer.username == "alice")
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn send_round_trips_over_a_real_websocket() {
    let (server_url, shutdown_tx) = start_server(get(ws_handler)).await;
    let mut client = spawn_client(&server_url, GOOD_TOKEN);

    client.handle.connect().expect("session alive");
    wait_for_status(&mut client, ConnectionStatus::Connected).await;

    client
        .handle
        .select_chat("alice")
        .await
        .expect("select alice");
    let sent = client
        .handle
        .send_text(1, "over the wire")
        .await
        .expect("send completes");
    assert!(sent);

    let snapshot = client.handle.snapshot().await.expect("snapshot");
    let alice = snapshot
        .conversations
        .iter()
        .find(|conversation| conversation.peer.username == "alice")
        .expect("alice conversation");
    assert_eq!(alice.messages.len(), 1);
    assert_eq!(alice.messages[0].id, 901);
    assert_eq!(alice.last_msg, "[delivered] over the wire");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn bad_token_is_rejected_by_the_handshake() {
    let (server_url, shutdown_tx) = start_server(get(ws_handler)).await;
    let mut client = spawn_client(&server_url, "stale-token");

    client.handle.connect().expect("session alive");

    let (code, msg) = timeout(Duration::from_secs(5), async {
        loop {
            match client.events.recv().await {
                Some(SessionEvent::AuthFailed { code, msg }) => return (code, msg),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("auth failure surfaced");
    assert_eq!(code, 401);
    assert_eq!(msg, "invalid token");

    let snapshot = client.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.status, ConnectionStatus::AuthFailed);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn malformed_server_frames_are_dropped_without_breaking_the_session() {
    let (server_url, shutdown_tx) = start_server(get(noisy_ws_handler)).await;
    let mut client = spawn_client(&server_url, GOOD_TOKEN);

    client.handle.connect().expect("session alive");
    wait_for_status(&mut client, ConnectionStatus::Connected).await;

    client
        .handle
        .select_chat("alice")
        .await
        .expect("select alice");
    let sent = client
        .handle
        .send_text(1, "still alive")
        .await
        .expect("send completes");
    assert!(sent);

    let snapshot = client.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    let alice = snapshot
        .conversations
        .iter()
        .find(|conversation| conversation.peer.username == "alice")
        .expect("alice conversation");
    assert_eq!(alice.messages.len(), 1);

    let _ = shutdown_tx.send(());
}
