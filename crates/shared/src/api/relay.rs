use crate::ids::UserId;
use crate::signal::Signal;
use serde::{Deserialize, Serialize};

/// Frames sent from a client to the relay over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    Send { to: UserId, signal: Signal },
    Ping { ts: u64 },
}

/// Frames sent from the relay to a client over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    Ready { user_id: UserId },
    Deliver { from: UserId, signal: Signal },
    /// The recipient had no live connection. The sender should rely on the
    /// durable-store fallback for this signal.
    Undeliverable { to: UserId, signal: Signal },
    Pong { ts: u64 },
    Error { code: u32, message: String },
}

/// Presence answer served by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

/// Relay error codes.
pub mod error_codes {
    pub const INVALID_FRAME: u32 = 4004;
    pub const FRAME_TOO_LARGE: u32 = 4005;
    pub const LAGGED: u32 = 4006;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ChatId, KeyRecordId};

    #[test]
    fn client_send_round_trip() {
        let to = UserId::new();
        let signal = Signal::KeyNotify {
            chat_id: ChatId::new(),
            record_id: KeyRecordId::new(),
        };
        let json = serde_json::to_string(&ClientFrame::Send { to, signal }).unwrap();
        assert!(json.contains(r#""type":"Send""#));
        match serde_json::from_str::<ClientFrame>(&json).unwrap() {
            ClientFrame::Send { to: t, signal: s } => {
                assert_eq!(t, to);
                assert_eq!(s, signal);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_deliver_round_trip() {
        let from = UserId::new();
        let signal = Signal::RotateRequest {
            chat_id: ChatId::new(),
        };
        let json = serde_json::to_string(&ServerFrame::Deliver { from, signal }).unwrap();
        match serde_json::from_str::<ServerFrame>(&json).unwrap() {
            ServerFrame::Deliver { from: f, signal: s } => {
                assert_eq!(f, from);
                assert_eq!(s, signal);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_client_frame_type_fails_deserialization() {
        let json = r#"{"type": "Broadcast"}"#;
        assert!(serde_json::from_str::<ClientFrame>(json).is_err());
    }

    #[test]
    fn presence_response_serializes_null_last_seen() {
        let resp = PresenceResponse {
            user_id: UserId::new(),
            online: false,
            last_seen: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["online"], false);
        assert!(json["last_seen"].is_null());
    }
}
