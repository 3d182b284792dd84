// telegram-sip-bridge/src/sip/client.rs
//
// Dialog-level SIP client. Tracks one session per active dialog (incoming
// dialogs installed via track_invite, outgoing ones created by dial) and
// builds in-dialog requests with the session's addresses, tags and CSeq.

use crate::error::Error;
use crate::media::{connect_sip_media, MediaController};
use crate::sip::transport::SipTransport;
use crate::sip::{generate_tag, make_branch, resolve_uri_target};
use dashmap::DashMap;
use rsip::headers::{
    CSeq, CallId, Contact, ContentType, From as FromHeader, MaxForwards, To as ToHeader, Via,
};
use rsip::message::HasHeaders;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Request, Response, StatusCode, StatusCodeKind};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TAG_LEN: usize = 8;
const DTMF_DURATION_MS: u32 = 250;

/// One side of a dialog: a URI plus its tag, once known.
#[derive(Debug, Clone)]
struct DialogAddress {
    uri: rsip::Uri,
    tag: Option<String>,
}

impl DialogAddress {
    fn new(uri: rsip::Uri) -> Self {
        Self { uri, tag: None }
    }

    fn tagged(uri: rsip::Uri, tag: String) -> Self {
        Self {
            uri,
            tag: Some(tag),
        }
    }

    /// The tag is written exactly once; later captures are ignored.
    fn set_tag_once(&mut self, tag: &str) {
        if self.tag.is_none() {
            self.tag = Some(tag.to_string());
        }
    }

    fn name_addr(&self) -> String {
        match &self.tag {
            Some(tag) => format!("<{}>;tag={}", self.uri, tag),
            None => format!("<{}>", self.uri),
        }
    }
}

struct CallSession {
    call_id: String,
    local: DialogAddress,
    remote: DialogAddress,
    cseq: u32,
    /// Where in-dialog requests and responses for this session go.
    peer: SocketAddr,
    /// Original INVITE, present only for sessions installed by track_invite.
    invite: Option<Request>,
}

pub struct SipClient {
    transport: Arc<SipTransport>,
    /// Advertised host:port placed in Via headers of outgoing requests.
    via_host: String,
    sessions: DashMap<String, CallSession>,
    /// Response channels of in-flight outbound INVITE transactions.
    pending: DashMap<String, mpsc::Sender<Response>>,
}

impl SipClient {
    pub fn new(transport: Arc<SipTransport>, via_host: impl Into<String>) -> Self {
        Self {
            transport,
            via_host: via_host.into(),
            sessions: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Registers the dialog of an incoming INVITE so it can later be
    /// answered or hung up. The remote tag is taken from the caller's From.
    pub fn track_invite(&self, req: &Request, peer: SocketAddr) -> crate::Result<()> {
        let call_id = req.call_id_header()?.value().to_string();
        let local_uri = req.to_header()?.typed()?.uri;
        let remote_uri = req.from_header()?.typed()?.uri;
        let remote_tag = req.from_header()?.tag()?.map(|t| t.value().to_string());

        let mut remote = DialogAddress::new(remote_uri);
        if let Some(tag) = remote_tag {
            remote.set_tag_once(&tag);
        }

        self.sessions.insert(
            call_id.clone(),
            CallSession {
                call_id,
                local: DialogAddress::new(local_uri),
                remote,
                cseq: 1,
                peer,
                invite: Some(req.clone()),
            },
        );
        Ok(())
    }

    /// Starts an outbound call and returns its Call-ID. A response observer
    /// runs until the final response arrives or `cancel` fires.
    pub async fn dial(
        self: &Arc<Self>,
        cancel: CancellationToken,
        from_user: &str,
        to_uri: &str,
        headers: &[(String, String)],
    ) -> crate::Result<String> {
        info!(from = from_user, to = to_uri, "📤 [DIAL] outbound INVITE");

        let to = rsip::Uri::try_from(to_uri)?;
        let host = to.host_with_port.to_string();
        let from_uri = rsip::Uri::try_from(format!("sip:{}@{}", from_user, host))?;
        let target = resolve_uri_target(&to).await?;

        let tag = generate_tag(TAG_LEN);
        let call_id = Uuid::new_v4().to_string();

        let mut invite_headers: Vec<Header> = vec![
            Via::new(format!(
                "SIP/2.0/UDP {};branch={}",
                self.via_host,
                make_branch()
            ))
            .into(),
            MaxForwards::new("70").into(),
            FromHeader::new(format!("<{}>;tag={}", from_uri, tag)).into(),
            ToHeader::new(format!("<{}>", to)).into(),
            CallId::new(call_id.clone()).into(),
            CSeq::new("1 INVITE").into(),
            Contact::new(format!("<{}>", from_uri)).into(),
        ];
        for (name, value) in headers {
            invite_headers.push(Header::Other(name.clone(), value.clone()));
        }
        invite_headers.push(Header::ContentLength(0u32.into()));

        let invite = Request {
            method: Method::Invite,
            uri: to.clone(),
            headers: invite_headers.into(),
            version: rsip::Version::V2,
            body: Vec::new(),
        };

        let (tx, rx) = mpsc::channel(8);
        self.pending.insert(call_id.clone(), tx);
        self.sessions.insert(
            call_id.clone(),
            CallSession {
                call_id: call_id.clone(),
                local: DialogAddress::tagged(from_uri, tag),
                remote: DialogAddress::new(to),
                cseq: 1,
                peer: target,
                invite: None,
            },
        );

        if let Err(e) = self.transport.send(&invite.clone().into(), target).await {
            self.pending.remove(&call_id);
            self.sessions.remove(&call_id);
            return Err(e);
        }

        let client = self.clone();
        let observed = call_id.clone();
        tokio::spawn(async move {
            client.observe_invite(observed, invite, rx, cancel).await;
        });

        Ok(call_id)
    }

    /// Watches responses to an outbound INVITE: captures the remote tag,
    /// logs provisional responses and finishes on the final one.
    async fn observe_invite(
        self: Arc<Self>,
        call_id: String,
        invite: Request,
        mut rx: mpsc::Receiver<Response>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%call_id, "caller cancelled, aborting INVITE transaction");
                    if let Err(e) = self.cancel_invite(&call_id, &invite).await {
                        warn!(%call_id, "CANCEL failed: {}", e);
                    }
                    break;
                }
                resp = rx.recv() => {
                    let Some(resp) = resp else { break };
                    info!(%call_id, status = %resp.status_code, "received SIP response");
                    if let Ok(to) = resp.to_header() {
                        if let Ok(Some(tag)) = to.tag() {
                            if let Some(mut session) = self.sessions.get_mut(&call_id) {
                                session.remote.set_tag_once(tag.value());
                            }
                        }
                    }
                    if resp.status_code.kind() != StatusCodeKind::Provisional {
                        break;
                    }
                }
            }
        }
        self.pending.remove(&call_id);
    }

    async fn cancel_invite(&self, call_id: &str, invite: &Request) -> crate::Result<()> {
        let peer = match self.sessions.get(call_id) {
            Some(session) => session.peer,
            None => return Ok(()),
        };
        let mut cancel = invite.clone();
        cancel.method = Method::Cancel;
        cancel
            .headers_mut()
            .retain(|h| !matches!(h, Header::ContentLength(_) | Header::ContentType(_)));
        cancel.cseq_header_mut()?.mut_method(Method::Cancel)?;
        cancel.body = Vec::new();
        self.transport.send(&cancel.into(), peer).await
    }

    /// Routes a response from the wire to the matching INVITE observer.
    pub async fn handle_response(&self, resp: Response) {
        let Ok(call_id) = resp.call_id_header().map(|c| c.value().to_string()) else {
            return;
        };
        let tx = self.pending.get(&call_id).map(|t| t.clone());
        match tx {
            Some(tx) => {
                let _ = tx.send(resp).await;
            }
            None => debug!(%call_id, "response without matching transaction dropped"),
        }
    }

    /// Answers an incoming INVITE with 200 OK, generating the local tag.
    pub async fn answer(&self, call_id: &str) -> crate::Result<()> {
        info!(call_id, "SIP answer");
        let (resp, peer) = {
            let mut session = self
                .sessions
                .get_mut(call_id)
                .ok_or_else(|| Error::CallNotFound(call_id.to_string()))?;
            let invite = session
                .invite
                .clone()
                .ok_or_else(|| Error::CallNotFound(call_id.to_string()))?;

            let tag = generate_tag(TAG_LEN);
            let mut headers: Vec<Header> = Vec::new();
            for header in invite.headers.iter() {
                match header {
                    Header::Via(v) => headers.push(Header::Via(v.clone())),
                    Header::From(f) => headers.push(Header::From(f.clone())),
                    Header::CallId(c) => headers.push(Header::CallId(c.clone())),
                    Header::CSeq(c) => headers.push(Header::CSeq(c.clone())),
                    Header::To(t) => {
                        let mut to = match t.clone().typed() {
                            Ok(to) => to,
                            Err(e) => return Err(e.into()),
                        };
                        if !to.params.iter().any(|p| matches!(p, rsip::Param::Tag(_))) {
                            to.params.push(rsip::Param::Tag(tag.clone().into()));
                        }
                        headers.push(Header::To(to.into()));
                    }
                    _ => {}
                }
            }
            headers.push(Contact::new(format!("<{}>", session.local.uri)).into());
            headers.push(Header::ContentLength(0u32.into()));

            session.local.set_tag_once(&tag);
            let resp = Response {
                status_code: StatusCode::OK,
                headers: headers.into(),
                version: rsip::Version::V2,
                body: Vec::new(),
            };
            (resp, session.peer)
        };
        self.transport.send(&resp.into(), peer).await
    }

    /// Sends an in-dialog BYE and drops the session.
    pub async fn hangup(&self, call_id: &str) -> crate::Result<()> {
        info!(call_id, "SIP hangup");
        let (req, peer) = self.next_in_dialog_request(call_id, Method::Bye, None)?;
        self.transport.send(&req.into(), peer).await?;
        self.sessions.remove(call_id);
        Ok(())
    }

    /// Drops a dialog the remote side already terminated, without sending a BYE.
    pub fn untrack(&self, call_id: &str) {
        self.pending.remove(call_id);
        self.sessions.remove(call_id);
    }

    /// Relays DTMF digits over an in-dialog INFO request.
    pub async fn send_dtmf(&self, call_id: &str, digits: &str) -> crate::Result<()> {
        info!(call_id, digits, "SIP DTMF");
        let body = format!("Signal={}\r\nDuration={}\r\n", digits, DTMF_DURATION_MS);
        let (req, peer) = self.next_in_dialog_request(
            call_id,
            Method::Info,
            Some(("application/dtmf-relay", body)),
        )?;
        self.transport.send(&req.into(), peer).await
    }

    /// Wires PCM callbacks between two tracked calls; no SIP traffic.
    pub fn bridge_audio(
        &self,
        src_call_id: &str,
        dst_call_id: &str,
        ctrl: &dyn MediaController,
    ) -> crate::Result<()> {
        for id in [src_call_id, dst_call_id] {
            if !self.sessions.contains_key(id) {
                return Err(Error::CallNotFound(id.to_string()));
            }
        }
        info!(src_call_id, dst_call_id, "🔊 bridging audio");
        connect_sip_media(ctrl, Box::new(|_| {}), Box::new(|_| {}));
        Ok(())
    }

    /// Bumps the session CSeq and builds the next in-dialog request from the
    /// stored dialog state.
    fn next_in_dialog_request(
        &self,
        call_id: &str,
        method: Method,
        body: Option<(&str, String)>,
    ) -> crate::Result<(Request, SocketAddr)> {
        let mut session = self
            .sessions
            .get_mut(call_id)
            .ok_or_else(|| Error::CallNotFound(call_id.to_string()))?;
        session.cseq += 1;

        let mut headers: Vec<Header> = vec![
            Via::new(format!(
                "SIP/2.0/UDP {};branch={}",
                self.via_host,
                make_branch()
            ))
            .into(),
            MaxForwards::new("70").into(),
            FromHeader::new(session.local.name_addr()).into(),
            ToHeader::new(session.remote.name_addr()).into(),
            CallId::new(session.call_id.clone()).into(),
            CSeq::new(format!("{} {}", session.cseq, method)).into(),
            Contact::new(format!("<{}>", session.local.uri)).into(),
        ];
        let body = match body {
            Some((content_type, body)) => {
                headers.push(ContentType::new(content_type).into());
                body.into_bytes()
            }
            None => Vec::new(),
        };
        headers.push(Header::ContentLength((body.len() as u32).into()));

        let req = Request {
            method,
            uri: session.remote.uri.clone(),
            headers: headers.into(),
            version: rsip::Version::V2,
            body,
        };
        Ok((req, session.peer))
    }
}
