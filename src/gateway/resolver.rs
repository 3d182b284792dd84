// telegram-sip-bridge/src/gateway/resolver.rs
//
// Maps SIP custom headers and extension syntaxes onto Telegram user ids.
// Cache first, then a server-side contact search.

use crate::contacts::ContactCache;
use crate::error::Error;
use crate::telegram::TelegramApi;
use rsip::{Header, Request};
use std::sync::Arc;

pub const HDR_TG_ID: &str = "X-TG-ID";
pub const HDR_TG_USERNAME: &str = "X-TG-Username";
pub const HDR_TG_PHONE: &str = "X-TG-Phone";

pub struct Resolver {
    contacts: Arc<ContactCache>,
    tg: Arc<dyn TelegramApi>,
}

fn header_value(req: &Request, name: &str) -> Option<String> {
    req.headers.iter().find_map(|h| match h {
        Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.trim().to_string()),
        _ => None,
    })
}

impl Resolver {
    pub fn new(contacts: Arc<ContactCache>, tg: Arc<dyn TelegramApi>) -> Self {
        Self { contacts, tg }
    }

    /// Checks the custom identity headers in priority order. The first
    /// present header decides; a malformed X-TG-ID is an error.
    pub async fn from_headers(&self, req: &Request) -> crate::Result<Option<i64>> {
        if let Some(raw) = header_value(req, HDR_TG_ID) {
            return raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::BadHeader(HDR_TG_ID, raw));
        }
        if let Some(username) = header_value(req, HDR_TG_USERNAME) {
            return self.resolve(&format!("tg#{}", username)).await;
        }
        if let Some(phone) = header_value(req, HDR_TG_PHONE) {
            return self.resolve(&format!("+{}", phone)).await;
        }
        Ok(None)
    }

    /// Resolves an extension: `tg#username`, `+phone`, a numeric id, or a
    /// free-form token searched as username/phone.
    pub async fn resolve(&self, ext: &str) -> crate::Result<Option<i64>> {
        if ext.is_empty() {
            return Ok(None);
        }
        if let Some(name) = ext.strip_prefix("tg#") {
            if let Some(id) = self.contacts.resolve(&name.to_lowercase()) {
                return Ok(Some(id));
            }
            return Ok(self.contacts.search_and_add(self.tg.as_ref(), name).await);
        }
        if let Some(phone) = ext.strip_prefix('+') {
            if let Some(id) = self.contacts.resolve(phone) {
                return Ok(Some(id));
            }
            return Ok(self.contacts.search_and_add(self.tg.as_ref(), phone).await);
        }
        if let Ok(id) = ext.parse::<i64>() {
            return Ok(Some(id));
        }
        if let Some(id) = self.contacts.resolve(ext) {
            return Ok(Some(id));
        }
        Ok(self.contacts.search_and_add(self.tg.as_ref(), ext).await)
    }
}
