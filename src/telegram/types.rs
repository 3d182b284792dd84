// telegram-sip-bridge/src/telegram/types.rs
//
// Serde models for the slice of the TDLib JSON object tree the gateway
// consumes. Field names follow the wire format.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub usernames: Option<Usernames>,
    #[serde(default)]
    pub phone_number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usernames {
    #[serde(default)]
    pub editable_username: String,
    #[serde(default)]
    pub active_usernames: Vec<String>,
}

impl User {
    /// The user's primary username: the editable one when present, else the
    /// first active one, else empty.
    pub fn primary_username(&self) -> &str {
        match &self.usernames {
            Some(u) if !u.editable_username.is_empty() => &u.editable_username,
            Some(u) => u.active_usernames.first().map(String::as_str).unwrap_or(""),
            None => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub is_outgoing: bool,
    pub state: CallState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum CallState {
    #[serde(rename = "callStatePending")]
    Pending {},
    #[serde(rename = "callStateExchangingKeys")]
    ExchangingKeys {},
    #[serde(rename = "callStateReady")]
    Ready {},
    #[serde(rename = "callStateHangingUp")]
    HangingUp {},
    #[serde(rename = "callStateDiscarded")]
    Discarded {},
    #[serde(rename = "callStateError")]
    Error {},
}

/// Fixed signaling protocol envelope for call creation and acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallProtocol {
    pub udp_p2p: bool,
    pub udp_reflector: bool,
    pub min_layer: i32,
    pub max_layer: i32,
    #[serde(default)]
    pub library_versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: i64,
    pub sender_id: MessageSender,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum MessageSender {
    #[serde(rename = "messageSenderUser")]
    User { user_id: i64 },
    #[serde(rename = "messageSenderChat")]
    Chat { chat_id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum MessageContent {
    #[serde(rename = "messageText")]
    Text { text: FormattedText },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormattedText {
    #[serde(default)]
    pub text: String,
}

/// The updates the gateway reacts to; everything else is dropped by the
/// adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum Update {
    #[serde(rename = "updateCall")]
    Call { call: Call },
    #[serde(rename = "updateUser")]
    User { user: User },
    #[serde(rename = "updateNewMessage")]
    NewMessage { message: Message },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with(editable: &str, active: &[&str]) -> User {
        User {
            id: 1,
            usernames: Some(Usernames {
                editable_username: editable.to_string(),
                active_usernames: active.iter().map(|s| s.to_string()).collect(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn primary_username_prefers_editable() {
        assert_eq!(user_with("alice", &["bob"]).primary_username(), "alice");
        assert_eq!(user_with("", &["bob", "carol"]).primary_username(), "bob");
        assert_eq!(user_with("", &[]).primary_username(), "");
        assert_eq!(User::default().primary_username(), "");
    }

    #[test]
    fn update_call_parses_from_wire_json() {
        let raw = r#"{
            "@type": "updateCall",
            "call": {
                "id": 7,
                "user_id": 42,
                "is_outgoing": false,
                "state": { "@type": "callStatePending", "is_created": true, "is_received": false }
            }
        }"#;
        let update: Update = serde_json::from_str(raw).unwrap();
        match update {
            Update::Call { call } => {
                assert_eq!(call.id, 7);
                assert_eq!(call.user_id, 42);
                assert!(!call.is_outgoing);
                assert_eq!(call.state, CallState::Pending {});
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn text_message_parses_and_unknown_content_is_tolerated() {
        let raw = r#"{
            "@type": "updateNewMessage",
            "message": {
                "id": 10,
                "sender_id": { "@type": "messageSenderUser", "user_id": 7 },
                "content": { "@type": "messageText", "text": { "@type": "formattedText", "text": "*73" } }
            }
        }"#;
        let update: Update = serde_json::from_str(raw).unwrap();
        let Update::NewMessage { message } = update else {
            panic!("expected new message");
        };
        match message.content {
            MessageContent::Text { text } => assert_eq!(text.text, "*73"),
            other => panic!("unexpected content: {:?}", other),
        }

        let raw = r#"{
            "@type": "updateNewMessage",
            "message": {
                "id": 11,
                "sender_id": { "@type": "messageSenderUser", "user_id": 7 },
                "content": { "@type": "messagePhoto" }
            }
        }"#;
        let update: Update = serde_json::from_str(raw).unwrap();
        let Update::NewMessage { message } = update else {
            panic!("expected new message");
        };
        assert!(matches!(message.content, MessageContent::Other));
    }
}
