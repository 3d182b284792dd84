// telegram-sip-bridge/src/sip/server.rs

use crate::gateway::Gateway;
use crate::sip::client::SipClient;
use crate::sip::make_response;
use crate::sip::transport::SipTransport;
use rsip::{Method, SipMessage, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// SIP datagram loop: parses incoming messages and fans requests out to the
/// gateway's handlers and responses to the dialog client. Each message is
/// handled in its own task so blocking work never stalls the listener.
pub struct SipServer {
    transport: Arc<SipTransport>,
    client: Arc<SipClient>,
    gateway: Arc<Gateway>,
    log_messages: bool,
}

impl SipServer {
    pub fn new(
        transport: Arc<SipTransport>,
        client: Arc<SipClient>,
        gateway: Arc<Gateway>,
        log_messages: bool,
    ) -> Self {
        Self {
            transport,
            client,
            gateway,
            log_messages,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("📡 SIP listener active on {}", self.transport.local_addr());
        let mut buf = vec![0u8; 65535];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SIP listener shutting down");
                    break;
                }
                res = self.transport.recv_from(&mut buf) => {
                    let (len, src) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("UDP receive error: {}", e);
                            continue;
                        }
                    };
                    // keepalives and stray null padding
                    if len < 4 || buf[..len].iter().all(|&b| b == b'\r' || b == b'\n' || b == 0) {
                        continue;
                    }
                    let raw = match std::str::from_utf8(&buf[..len]) {
                        Ok(s) => s,
                        Err(_) => {
                            warn!(%src, "non-UTF8 SIP datagram dropped");
                            continue;
                        }
                    };
                    if self.log_messages {
                        debug!(%src, "received SIP message:\n{}", raw);
                    }
                    match SipMessage::try_from(raw) {
                        Ok(SipMessage::Request(req)) => self.dispatch_request(req, src),
                        Ok(SipMessage::Response(resp)) => {
                            let client = self.client.clone();
                            tokio::spawn(async move {
                                client.handle_response(resp).await;
                            });
                        }
                        Err(e) => warn!(%src, "SIP parse error: {}", e),
                    }
                }
            }
        }
    }

    fn dispatch_request(&self, req: rsip::Request, src: SocketAddr) {
        let gateway = self.gateway.clone();
        match req.method {
            Method::Invite => {
                tokio::spawn(async move { gateway.on_invite(req, src).await });
            }
            Method::Ack => {
                tokio::spawn(async move { gateway.on_ack(req).await });
            }
            Method::Bye => {
                tokio::spawn(async move { gateway.on_bye(req, src).await });
            }
            Method::Info => {
                tokio::spawn(async move { gateway.on_info(req, src).await });
            }
            _ => {
                debug!(method = %req.method, "method not handled");
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let resp = make_response(&req, StatusCode::NotImplemented, vec![]);
                    if let Err(e) = transport.send(&resp.into(), src).await {
                        warn!("failed to send 501: {}", e);
                    }
                });
            }
        }
    }
}
