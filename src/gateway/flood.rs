// telegram-sip-bridge/src/gateway/flood.rs
//
// Classification of Telegram rate-limit errors. The controller turns a
// match into a block-until deadline; everything else passes through.

use crate::telegram::TgError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static RETRY_AFTER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)retry after (\d+)").unwrap());
static PEER_FLOOD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)PEER_FLOOD").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodKind {
    /// Server told us how long to wait.
    RetryAfter(Duration),
    /// Cooldown of unspecified length; the configured wait applies.
    PeerFlood,
}

/// Matches a Telegram error against the known rate-limit shapes.
pub fn classify(err: &TgError) -> Option<FloodKind> {
    if let Some(caps) = RETRY_AFTER_RE.captures(&err.message) {
        if let Ok(secs) = caps[1].parse::<u64>() {
            return Some(FloodKind::RetryAfter(Duration::from_secs(secs)));
        }
    }
    if PEER_FLOOD_RE.is_match(&err.message) {
        return Some(FloodKind::PeerFlood);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_after_seconds() {
        let err = TgError::new(429, "Too Many Requests: retry after 42");
        assert_eq!(
            classify(&err),
            Some(FloodKind::RetryAfter(Duration::from_secs(42)))
        );
        let err = TgError::new(429, "FLOOD_WAIT Retry After 7 please");
        assert_eq!(
            classify(&err),
            Some(FloodKind::RetryAfter(Duration::from_secs(7)))
        );
    }

    #[test]
    fn detects_peer_flood_case_insensitively() {
        assert_eq!(
            classify(&TgError::new(400, "PEER_FLOOD")),
            Some(FloodKind::PeerFlood)
        );
        assert_eq!(
            classify(&TgError::new(400, "error: peer_flood limit")),
            Some(FloodKind::PeerFlood)
        );
    }

    #[test]
    fn other_errors_do_not_match() {
        assert_eq!(classify(&TgError::new(404, "USER_ID_INVALID")), None);
        assert_eq!(classify(&TgError::new(500, "retry after soon")), None);
    }
}
