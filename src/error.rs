// telegram-sip-bridge/src/error.rs
use crate::telegram::TgError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("SIP transport error: {0}: {1}")]
    Transport(String, std::io::Error),

    #[error("SIP message error: {0}")]
    SipMessage(#[from] rsip::Error),

    #[error("malformed {0} header: {1}")]
    BadHeader(&'static str, String),

    #[error("call {0} not found")]
    CallNotFound(String),

    #[error("telegram error: {0}")]
    Telegram(#[from] TgError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn transport(op: &str, e: std::io::Error) -> Self {
        Error::Transport(op.to_string(), e)
    }
}
