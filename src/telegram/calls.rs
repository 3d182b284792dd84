// telegram-sip-bridge/src/telegram/calls.rs

use super::{CallProtocol, TelegramApi, TgError};

const MIN_LAYER: i32 = 65;
const MAX_LAYER: i32 = 92;

/// The fixed protocol envelope sent with every createCall/acceptCall.
pub fn call_protocol() -> CallProtocol {
    CallProtocol {
        udp_p2p: true,
        udp_reflector: true,
        min_layer: MIN_LAYER,
        max_layer: MAX_LAYER,
        library_versions: Vec::new(),
    }
}

/// Starts an outgoing Telegram call, returning the call id. Errors are
/// returned verbatim so the caller can classify rate limits.
pub async fn create_call(tg: &dyn TelegramApi, user_id: i64) -> Result<i64, TgError> {
    tg.create_call(user_id, call_protocol()).await
}

/// Accepts an incoming Telegram call.
pub async fn accept_call(tg: &dyn TelegramApi, call_id: i64) -> Result<(), TgError> {
    tg.accept_call(call_id, call_protocol()).await
}

/// Terminates an ongoing Telegram call.
pub async fn discard_call(tg: &dyn TelegramApi, call_id: i64) -> Result<(), TgError> {
    tg.discard_call(call_id, false, 0, false, call_id).await
}
