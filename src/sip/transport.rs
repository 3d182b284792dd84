// telegram-sip-bridge/src/sip/transport.rs

use crate::error::Error;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// UDP datagram transport for SIP signaling.
pub struct SipTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    log_messages: bool,
}

impl SipTransport {
    /// Binds the first free port in `port..=port+port_range`. Failure across
    /// the whole range is fatal for the service.
    pub async fn bind(
        bind_ip: &str,
        port: u16,
        port_range: u16,
        log_messages: bool,
    ) -> crate::Result<Self> {
        let mut last_err: Option<std::io::Error> = None;
        for candidate in port..=port.saturating_add(port_range) {
            match UdpSocket::bind((bind_ip, candidate)).await {
                Ok(socket) => {
                    let local_addr = socket.local_addr()?;
                    info!("📡 SIP transport bound on {}", local_addr);
                    return Ok(Self {
                        socket,
                        local_addr,
                        log_messages,
                    });
                }
                Err(e) => {
                    warn!(port = candidate, "SIP bind failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(Error::transport(
            "bind",
            last_err.unwrap_or_else(|| std::io::Error::other("empty port range")),
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send(&self, msg: &rsip::SipMessage, target: SocketAddr) -> crate::Result<()> {
        let raw = msg.to_string();
        if self.log_messages {
            debug!(%target, "sending SIP message:\n{}", raw);
        }
        self.socket
            .send_to(raw.as_bytes(), target)
            .await
            .map_err(|e| Error::transport("send", e))?;
        Ok(())
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}
