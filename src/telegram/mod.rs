// telegram-sip-bridge/src/telegram/mod.rs
//
// Port to the Telegram client. The gateway only ever talks to the
// `TelegramApi` trait; the production adapter (`tdjson`) drives TDLib's
// JSON interface, tests use the in-memory mock.

use async_trait::async_trait;
use thiserror::Error;

pub mod calls;
pub mod tdjson;
pub mod types;

#[cfg(test)]
pub mod mock;

pub use types::{Call, CallProtocol, CallState, Update, User};

/// Structured TDLib error, kept verbatim for flood-control classification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("TDLib error {code}: {message}")]
pub struct TgError {
    pub code: i32,
    pub message: String,
}

impl TgError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait TelegramApi: Send + Sync {
    /// Ids of the account's contact list.
    async fn get_contacts(&self) -> Result<Vec<i64>, TgError>;

    /// Server-side contact search. An empty query matches all contacts.
    async fn search_contacts(&self, query: &str, limit: i32) -> Result<Vec<i64>, TgError>;

    async fn get_user(&self, user_id: i64) -> Result<User, TgError>;

    /// Initiates an outgoing call and returns the new call id.
    async fn create_call(&self, user_id: i64, protocol: CallProtocol) -> Result<i64, TgError>;

    async fn accept_call(&self, call_id: i64, protocol: CallProtocol) -> Result<(), TgError>;

    async fn discard_call(
        &self,
        call_id: i64,
        is_disconnected: bool,
        duration: i32,
        is_video: bool,
        connection_id: i64,
    ) -> Result<(), TgError>;
}
