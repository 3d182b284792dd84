// telegram-sip-bridge/src/sip/mod.rs

use crate::error::Error;
use rand::distributions::{Alphanumeric, DistString};
use rsip::prelude::UntypedHeader;
use rsip::{Header, Request, Response, StatusCode};
use std::net::SocketAddr;

pub mod client;
pub mod server;
pub mod transport;

pub const SERVER_NAME: &str = "telegram-sip-bridge";

const DEFAULT_SIP_PORT: u16 = 5060;

/// Random alphanumeric dialog tag.
pub(crate) fn generate_tag(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// RFC 3261 magic-cookie Via branch.
pub(crate) fn make_branch() -> String {
    format!(
        "z9hG4bK{}",
        Alphanumeric.sample_string(&mut rand::thread_rng(), 16)
    )
}

/// Builds a response echoing the request's dialog-identifying headers.
pub fn make_response(req: &Request, status: StatusCode, extra: Vec<Header>) -> Response {
    let mut headers: Vec<Header> = Vec::new();
    for header in req.headers.iter() {
        match header {
            Header::Via(v) => headers.push(Header::Via(v.clone())),
            Header::From(f) => headers.push(Header::From(f.clone())),
            Header::To(t) => headers.push(Header::To(t.clone())),
            Header::CallId(c) => headers.push(Header::CallId(c.clone())),
            Header::CSeq(c) => headers.push(Header::CSeq(c.clone())),
            _ => {}
        }
    }
    headers.push(rsip::headers::Server::new(SERVER_NAME).into());
    headers.extend(extra);
    headers.push(Header::ContentLength(0u32.into()));

    Response {
        status_code: status,
        headers: headers.into(),
        version: rsip::Version::V2,
        body: Vec::new(),
    }
}

/// The user part of a SIP URI, when present.
pub(crate) fn uri_user(uri: &rsip::Uri) -> Option<String> {
    uri.auth.as_ref().map(|a| a.user.clone())
}

/// Resolves a SIP URI's host:port to a UDP target (default port 5060).
pub(crate) async fn resolve_uri_target(uri: &rsip::Uri) -> crate::Result<SocketAddr> {
    let mut host_port = uri.host_with_port.to_string();
    if !host_port.contains(':') {
        host_port = format!("{}:{}", host_port, DEFAULT_SIP_PORT);
    }
    let addr = tokio::net::lookup_host(host_port.as_str())
        .await
        .map_err(|e| Error::transport("resolve", e))?
        .next()
        .ok_or_else(|| Error::Other(format!("no address for {}", host_port)));
    addr
}
