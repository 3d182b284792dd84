// telegram-sip-bridge/src/gateway/state.rs

use crate::media::MediaController;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Per-call state machine states; also the vocabulary of internal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Incoming,
    Outgoing,
    WaitMedia,
    WaitDtmf,
    Cleanup,
}

/// State of one bridged call.
#[derive(Clone)]
pub struct CallContext {
    /// Stable key: the SIP Call-ID of the leg that created the context.
    pub id: String,
    pub sip_call_id: String,
    /// Telegram call id; 0 when not assigned.
    pub tg_call_id: i64,
    pub user_id: i64,
    pub media: Option<Arc<dyn MediaController>>,
    pub state: CallState,
}

impl CallContext {
    pub fn new(id: impl Into<String>, user_id: i64, state: CallState) -> Self {
        let id = id.into();
        Self {
            sip_call_id: id.clone(),
            id,
            tg_call_id: 0,
            user_id,
            media: None,
            state,
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("id", &self.id)
            .field("sip_call_id", &self.sip_call_id)
            .field("tg_call_id", &self.tg_call_id)
            .field("user_id", &self.user_id)
            .field("media", &self.media.is_some())
            .field("state", &self.state)
            .finish()
    }
}

/// Drives a state transition inside the controller loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalEvent {
    pub ctx_id: String,
    pub kind: CallState,
}

/// Informational events published on the outward bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    CallState { call_id: String, state: &'static str },
    Media { call_id: String, body: String },
}

/// Call map plus the flood deadline, guarded by one lock that is never held
/// across SIP or Telegram I/O.
#[derive(Default)]
pub struct GatewayState {
    pub calls: HashMap<String, CallContext>,
    pub block_until: Option<Instant>,
}
