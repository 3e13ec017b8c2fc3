use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 64 * 1024;
pub const MAX_MESSAGE_TEXT_BYTES: usize = 16 * 1024;
pub const HISTORY_PAGE_SIZE: u32 = 20;
pub const CODE_OK: u16 = 200;
pub const DELIVERED_PREVIEW_PREFIX: &str = "[delivered] ";
pub const RECALL_PLACEHOLDER_SENT: &str = "[recalled] a message";
pub const RECALL_PLACEHOLDER_RECEIVED: &str = "[recalled by sender] a message";

pub type UserId = u64;
pub type GroupId = u64;
pub type MessageId = u64;
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Card,
    Recall,
}

/// Delivery state of a message. Moves forward only; `Recalled` is terminal
/// and reachable from any prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Unsent,
    Delivered,
    Read,
    Recalled,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Unsent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
            MessageStatus::Recalled => 3,
        }
    }

    pub fn can_become(self, next: MessageStatus) -> bool {
        if self == MessageStatus::Recalled {
            return false;
        }
        if next == MessageStatus::Recalled {
            return true;
        }
        next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub online: bool,
}

impl PeerProfile {
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.username)
    }
}

/// Quoted-reply payload carried by card messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardContent {
    pub sender_name: String,
    pub content: String,
    pub kind: MessageKind,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub card: Option<CardContent>,
    pub status: MessageStatus,
    pub created_at_ms: u64,
}

impl Message {
    /// Replaces the visible content with a recall placeholder. Rejects a
    /// second recall so callers can treat it as an idempotent no-op.
    pub fn apply_recall(&mut self, placeholder: &str) -> Result<(), ProtocolError> {
        if self.status == MessageStatus::Recalled {
            return Err(ProtocolError::AlreadyRecalled(self.id));
        }
        self.content = placeholder.to_owned();
        self.kind = MessageKind::Recall;
        self.status = MessageStatus::Recalled;
        Ok(())
    }
}

/// One row of the server-side conversation roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatListEntry {
    pub list_id: u64,
    pub peer: PeerProfile,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub last_msg: String,
    #[serde(default)]
    pub last_msg_at_ms: u64,
    #[serde(default)]
    pub unread: u32,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub muted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SystemEventKind {
    FriendRequest,
    FriendAccepted,
    FriendRejected,
}

/// Client-to-server frames. Every request carries a client-allocated `id`
/// that the matching `Ack` echoes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    CreateSession {
        id: RequestId,
        user_id: UserId,
        platform: String,
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    SendText {
        id: RequestId,
        to_user_id: UserId,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    SendCard {
        id: RequestId,
        to_user_id: UserId,
        content: String,
        card: CardContent,
    },
    #[serde(rename_all = "camelCase")]
    RecallMessage { id: RequestId, message_id: MessageId },
    #[serde(rename_all = "camelCase")]
    MarkRead { id: RequestId, message_id: MessageId },
    #[serde(rename_all = "camelCase")]
    MarkAllRead { id: RequestId, from_user_id: UserId },
    Ping,
}

/// Request-scoped server response. `data` carries the request-specific
/// payload, e.g. the canonical message for sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub id: RequestId,
    pub code: u16,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerFrame {
    Ack(Ack),
    #[serde(rename_all = "camelCase")]
    PrivateMessage { message: Message, sender: PeerProfile },
    #[serde(rename_all = "camelCase")]
    MessageRead {
        message_id: MessageId,
        status: MessageStatus,
    },
    #[serde(rename_all = "camelCase")]
    AllMessagesRead { status: bool },
    #[serde(rename_all = "camelCase")]
    MessageRecalled {
        message_id: MessageId,
        sender_id: UserId,
        receiver_id: UserId,
        recalled_at_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    RecallResult {
        code: u16,
        message_id: MessageId,
        recalled_at_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    SystemMessage {
        kind: SystemEventKind,
        target_user_id: UserId,
        from_user_id: UserId,
        from_username: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionRejected { code: u16, msg: String },
    Pong,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("message content exceeds {MAX_MESSAGE_TEXT_BYTES} bytes")]
    ContentTooLarge,
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    FrameTooLarge,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("message {0} is already recalled")]
    AlreadyRecalled(MessageId),
}

pub fn validate_outgoing_text(content: &str) -> Result<(), ProtocolError> {
    if content.trim().is_empty() {
        return Err(ProtocolError::EmptyContent);
    }
    if content.len() > MAX_MESSAGE_TEXT_BYTES {
        return Err(ProtocolError::ContentTooLarge);
    }
    Ok(())
}

pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, ProtocolError> {
    encode_frame(frame)
}

pub fn decode_client_frame(text: &str) -> Result<ClientFrame, ProtocolError> {
    decode_frame(text)
}

pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, ProtocolError> {
    encode_frame(frame)
}

pub fn decode_server_frame(text: &str) -> Result<ServerFrame, ProtocolError> {
    decode_frame(text)
}

fn encode_frame<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let text =
        serde_json::to_string(frame).map_err(|err| ProtocolError::Serialization(err.to_string()))?;
    if text.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge);
    }
    Ok(text)
}

fn decode_frame<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge);
    }
    serde_json::from_str(text).map_err(|err| ProtocolError::Serialization(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(id: MessageId, created_at_ms: u64) -> Message {
        Message {
            id,
            sender_id: 1,
            receiver_id: 2,
            group_id: None,
            content: "hello wirechat".to_owned(),
            kind: MessageKind::Text,
            card: None,
            status: MessageStatus::Delivered,
            created_at_ms,
        }
    }

    #[test]
    fn status_only_moves_forward() {
        assert!(MessageStatus::Unsent.can_become(MessageStatus::Delivered));
        assert!(MessageStatus::Delivered.can_become(MessageStatus::Read));
        assert!(!MessageStatus::Read.can_become(MessageStatus::Delivered));
        assert!(!MessageStatus::Delivered.can_become(MessageStatus::Unsent));
    }

    #[test]
    fn recall_is_reachable_from_any_state_and_terminal() {
        assert!(MessageStatus::Unsent.can_become(MessageStatus::Recalled));
        assert!(MessageStatus::Read.can_become(MessageStatus::Recalled));
        assert!(!MessageStatus::Recalled.can_become(MessageStatus::Read));
        assert!(!MessageStatus::Recalled.can_become(MessageStatus::Recalled));
    }

    #[test]
    fn second_recall_is_rejected() {
        let mut message = sample_message(9, 1_000);
        message.apply_recall(RECALL_PLACEHOLDER_SENT).unwrap();
        assert_eq!(message.content, RECALL_PLACEHOLDER_SENT);
        assert_eq!(message.kind, MessageKind::Recall);
        assert_eq!(message.status, MessageStatus::Recalled);

        let err = message.apply_recall(RECALL_PLACEHOLDER_SENT).unwrap_err();
        assert!(matches!(err, ProtocolError::AlreadyRecalled(9)));
    }

    #[test]
    fn client_frame_roundtrip() {
        let frame = ClientFrame::SendText {
            id: 7,
            to_user_id: 42,
            content: "hi".to_owned(),
        };
        let text = encode_client_frame(&frame).unwrap();
        assert!(text.contains("\"sendText\""));
        assert!(text.contains("\"toUserId\":42"));
        let decoded = decode_client_frame(&text).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn server_frame_roundtrip() {
        let frame = ServerFrame::PrivateMessage {
            message: sample_message(11, 5_000),
            sender: PeerProfile {
                id: 1,
                username: "alice".to_owned(),
                nickname: Some("Alice".to_owned()),
                avatar: None,
                online: true,
            },
        };
        let text = encode_server_frame(&frame).unwrap();
        assert!(text.contains("\"privateMessage\""));
        let decoded = decode_server_frame(&text).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn ping_and_pong_serialize_as_bare_tags() {
        let text = encode_client_frame(&ClientFrame::Ping).unwrap();
        assert_eq!(text, "{\"type\":\"ping\"}");
        let decoded = decode_server_frame("{\"type\":\"pong\"}").unwrap();
        assert_eq!(decoded, ServerFrame::Pong);
    }

    #[test]
    fn ack_tolerates_missing_optional_fields() {
        let decoded =
            decode_server_frame("{\"type\":\"ack\",\"data\":{\"id\":3,\"code\":200}}").unwrap();
        match decoded {
            ServerFrame::Ack(ack) => {
                assert_eq!(ack.id, 3);
                assert_eq!(ack.code, CODE_OK);
                assert!(ack.msg.is_none());
                assert!(ack.data.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(decode_server_frame("not json").is_err());
        assert!(decode_server_frame("{\"type\":\"launchMissiles\"}").is_err());
        assert!(decode_client_frame("{\"type\":\"sendText\",\"data\":{}}").is_err());
    }

    #[test]
    fn outgoing_text_bounds() {
        assert!(validate_outgoing_text("hello").is_ok());
        assert!(matches!(
            validate_outgoing_text("   "),
            Err(ProtocolError::EmptyContent)
        ));
        let oversized = "x".repeat(MAX_MESSAGE_TEXT_BYTES + 1);
        assert!(matches!(
            validate_outgoing_text(&oversized),
            Err(ProtocolError::ContentTooLarge)
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = ClientFrame::SendText {
            id: 1,
            to_user_id: 2,
            content: "y".repeat(MAX_FRAME_BYTES),
        };
        assert!(matches!(
            encode_client_frame(&frame),
            Err(ProtocolError::FrameTooLarge)
        ));
    }
}
