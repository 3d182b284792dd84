// telegram-sip-bridge/src/gateway/mod.rs
//
// Bridging controller. SIP request callbacks and Telegram updates are
// projected onto one internal event stream; the single consumer loop owns
// every per-call state transition, so state evolution needs no locking
// beyond the short map guard.

use crate::config::Settings;
use crate::contacts::ContactCache;
use crate::error::Error;
use crate::media::MediaController;
use crate::sip::client::SipClient;
use crate::sip::transport::SipTransport;
use crate::sip::{make_response, uri_user};
use crate::telegram::types::{Call, CallState as TgCallState, Message, MessageContent, MessageSender};
use crate::telegram::{calls, TelegramApi, Update, User};
use once_cell::sync::Lazy;
use regex::Regex;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Request, StatusCode};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod flood;
pub mod resolver;
pub mod state;


pub use state::{CallContext, CallState, GatewayEvent, InternalEvent};

use flood::FloodKind;
use resolver::Resolver;
use state::GatewayState;

const EVENT_BUFFER: usize = 16;
const MAX_DTMF_LEN: usize = 32;
const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

static DTMF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-D*#]+$").unwrap());

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub callback_uri: Option<String>,
    pub extra_wait: Duration,
    pub peer_flood_wait: Duration,
}

impl GatewayConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            callback_uri: settings.sip.callback_uri.clone(),
            extra_wait: settings.other.extra_wait_time,
            peer_flood_wait: settings.other.peer_flood_time,
        }
    }
}

pub struct Gateway {
    transport: Arc<SipTransport>,
    sip: Arc<SipClient>,
    tg: Arc<dyn TelegramApi>,
    contacts: Arc<ContactCache>,
    resolver: Resolver,
    config: GatewayConfig,
    state: Mutex<GatewayState>,
    events_tx: mpsc::Sender<GatewayEvent>,
    internal_tx: mpsc::Sender<InternalEvent>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<GatewayEvent>>>,
    internal_rx: tokio::sync::Mutex<Option<mpsc::Receiver<InternalEvent>>>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        transport: Arc<SipTransport>,
        sip: Arc<SipClient>,
        tg: Arc<dyn TelegramApi>,
        contacts: Arc<ContactCache>,
        config: GatewayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (internal_tx, internal_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            resolver: Resolver::new(contacts.clone(), tg.clone()),
            transport,
            sip,
            tg,
            contacts,
            config,
            state: Mutex::new(GatewayState::default()),
            events_tx,
            internal_tx,
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
            internal_rx: tokio::sync::Mutex::new(Some(internal_rx)),
            shutdown,
        }
    }

    /// The controller loop. Consumes Telegram updates, the outward event bus
    /// and the internal event bus until the shutdown token fires, then
    /// drains all live calls through cleanup.
    pub async fn run(self: Arc<Self>, mut updates: mpsc::Receiver<Update>) {
        let mut events_rx = self
            .events_rx
            .lock()
            .await
            .take()
            .expect("gateway loop started twice");
        let mut internal_rx = self
            .internal_rx
            .lock()
            .await
            .take()
            .expect("gateway loop started twice");

        info!("🌉 gateway event loop started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("🛑 gateway shutting down");
                    self.shutdown_cleanup().await;
                    return;
                }
                Some(update) = updates.recv() => self.handle_update(update),
                Some(event) = events_rx.recv() => {
                    debug!(?event, "gateway event");
                }
                Some(ev) = internal_rx.recv() => self.process_internal(ev).await,
            }
        }
    }

    /// Hourly contact cache refresh; the first tick fires immediately.
    pub async fn refresh_contacts_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(e) = self.contacts.refresh(self.tg.as_ref()).await {
                        warn!("contact refresh failed: {}", e);
                    }
                }
            }
        }
    }

    // --- SIP request handlers (run on the server's per-request tasks) ---

    pub async fn on_invite(self: &Arc<Self>, req: Request, src: SocketAddr) {
        let call_id = match req.call_id_header() {
            Ok(c) => c.value().to_string(),
            Err(e) => {
                warn!("INVITE without Call-ID dropped: {}", e);
                return;
            }
        };
        let from = req
            .from_header()
            .map(|h| h.value().to_string())
            .unwrap_or_default();
        let to = req
            .to_header()
            .map(|h| h.value().to_string())
            .unwrap_or_default();
        info!("📞 [INVITE] {} -> {} ({})", from, to, call_id);

        if let Some(remaining) = self.flood_block_remaining() {
            warn!(
                "dropping call due to telegram block for {} more seconds",
                remaining.as_secs()
            );
            self.respond_flood(&req, src, remaining).await;
            return;
        }

        let ext = req
            .to_header()
            .ok()
            .and_then(|h| h.typed().ok())
            .and_then(|t| uri_user(&t.uri))
            .map(|u| decode_extension(&u))
            .unwrap_or_default();

        let resolved = match self.resolver.from_headers(&req).await {
            Ok(found) => found,
            Err(e) => return self.reject_invite(&req, src, e).await,
        };
        let resolved = match resolved {
            Some(id) => Some(id),
            None => match self.resolver.resolve(&ext).await {
                Ok(found) => found,
                Err(e) => return self.reject_invite(&req, src, e).await,
            },
        };
        let Some(user_id) = resolved else {
            warn!(%ext, "unknown extension");
            self.respond(&req, src, StatusCode::NotFound, vec![]).await;
            return;
        };

        match calls::create_call(self.tg.as_ref(), user_id).await {
            Ok(tg_call_id) => {
                debug!(user_id, tg_call_id, "telegram call created");
                self.clear_flood_block();
            }
            Err(e) => {
                if let Some(kind) = flood::classify(&e) {
                    let wait = self.set_flood_block(kind);
                    warn!(
                        "telegram flood on createCall, blocking outbound work for {}s",
                        wait.as_secs()
                    );
                    self.respond_flood(&req, src, wait).await;
                    return;
                }
                // keep the context so later SIP events still correlate
                warn!("createCall failed: {}", e);
            }
        }

        if let Err(e) = self.sip.track_invite(&req, src) {
            warn!(%call_id, "failed to track incoming dialog: {}", e);
        }

        {
            let mut state = self.state.lock().unwrap();
            state.calls.insert(
                call_id.clone(),
                CallContext::new(call_id.clone(), user_id, CallState::Incoming),
            );
        }
        self.emit(GatewayEvent::CallState {
            call_id: call_id.clone(),
            state: "incoming",
        })
        .await;
        self.post(InternalEvent {
            ctx_id: call_id,
            kind: CallState::Incoming,
        })
        .await;

        self.respond(&req, src, StatusCode::Trying, vec![]).await;
    }

    pub async fn on_ack(&self, req: Request) {
        let Some(call_id) = request_call_id(&req) else {
            return;
        };
        info!("✅ [ACK] call answered: {}", call_id);
        self.emit(GatewayEvent::CallState {
            call_id: call_id.clone(),
            state: "answered",
        })
        .await;
        self.post(InternalEvent {
            ctx_id: call_id,
            kind: CallState::WaitMedia,
        })
        .await;
    }

    pub async fn on_bye(&self, req: Request, src: SocketAddr) {
        let Some(call_id) = request_call_id(&req) else {
            return;
        };
        info!("🛑 [BYE] call ended: {}", call_id);
        // the remote side terminated this dialog, no BYE goes back
        self.sip.untrack(&call_id);
        self.emit(GatewayEvent::CallState {
            call_id: call_id.clone(),
            state: "ended",
        })
        .await;
        self.post(InternalEvent {
            ctx_id: call_id,
            kind: CallState::Cleanup,
        })
        .await;
        self.respond(&req, src, StatusCode::OK, vec![]).await;
    }

    pub async fn on_info(&self, req: Request, src: SocketAddr) {
        let Some(call_id) = request_call_id(&req) else {
            return;
        };
        let body = String::from_utf8_lossy(&req.body).into_owned();
        info!("ℹ️ [INFO] media event on {}", call_id);
        self.emit(GatewayEvent::Media {
            call_id: call_id.clone(),
            body,
        })
        .await;
        self.post(InternalEvent {
            ctx_id: call_id,
            kind: CallState::WaitDtmf,
        })
        .await;
        self.respond(&req, src, StatusCode::OK, vec![]).await;
    }

    // --- Telegram update handlers ---

    fn handle_update(self: &Arc<Self>, update: Update) {
        match update {
            Update::Call { call } => {
                info!(call_id = call.id, "received telegram call update");
                let gateway = self.clone();
                tokio::spawn(async move { gateway.handle_telegram_call(call).await });
            }
            Update::User { user } => self.contacts.update(&user),
            Update::NewMessage { message } => self.route_dtmf_message(message),
        }
    }

    /// Accepts a pending incoming Telegram call and dials it back out to the
    /// configured SIP callback URI.
    async fn handle_telegram_call(self: Arc<Self>, call: Call) {
        if call.is_outgoing {
            return;
        }
        if !matches!(call.state, TgCallState::Pending {}) {
            return;
        }
        info!(
            "📲 [TG-CALL] incoming telegram call {} from user {}",
            call.id, call.user_id
        );

        if let Err(e) = calls::accept_call(self.tg.as_ref(), call.id).await {
            warn!("acceptCall failed: {}", e);
            return;
        }
        let user = match self.tg.get_user(call.user_id).await {
            Ok(user) => user,
            Err(e) => {
                warn!("getUser failed: {}", e);
                return;
            }
        };
        let Some(callback) = self.config.callback_uri.clone() else {
            warn!("sip.callback_uri not configured, dropping telegram call");
            return;
        };

        let headers = build_user_headers(call.id, &user);
        match self
            .sip
            .dial(self.shutdown.child_token(), "tg", &callback, &headers)
            .await
        {
            Ok(sip_call_id) => {
                let mut ctx =
                    CallContext::new(sip_call_id.clone(), call.user_id, CallState::Outgoing);
                ctx.tg_call_id = call.id;
                self.state
                    .lock()
                    .unwrap()
                    .calls
                    .insert(sip_call_id.clone(), ctx);
                self.emit(GatewayEvent::CallState {
                    call_id: sip_call_id.clone(),
                    state: "outgoing",
                })
                .await;
                self.post(InternalEvent {
                    ctx_id: sip_call_id,
                    kind: CallState::Outgoing,
                })
                .await;
            }
            Err(e) => warn!("SIP dial failed: {}", e),
        }
    }

    /// DTMF over Telegram text: a digit-only message from a user with
    /// exactly one live call in WaitDtmf is relayed as SIP INFO.
    fn route_dtmf_message(&self, message: Message) {
        let MessageContent::Text { text } = message.content else {
            return;
        };
        let mut digits = text.text.trim().to_uppercase();
        if digits.is_empty() || !DTMF_RE.is_match(&digits) {
            return;
        }
        digits.truncate(MAX_DTMF_LEN);
        let MessageSender::User { user_id } = message.sender_id else {
            return;
        };

        let target = {
            let state = self.state.lock().unwrap();
            state
                .calls
                .values()
                .find(|c| c.user_id == user_id && c.state == CallState::WaitDtmf)
                .map(|c| c.sip_call_id.clone())
        };
        let Some(sip_call_id) = target else {
            return;
        };

        info!(user_id, %digits, "📟 relaying DTMF from telegram text");
        let sip = self.sip.clone();
        tokio::spawn(async move {
            if let Err(e) = sip.send_dtmf(&sip_call_id, &digits).await {
                warn!("DTMF INFO failed: {}", e);
            }
        });
    }

    // --- internal state machine ---

    async fn process_internal(&self, ev: InternalEvent) {
        match ev.kind {
            CallState::Cleanup => {
                // removing first makes the teardown exactly-once
                let ctx = {
                    let mut state = self.state.lock().unwrap();
                    state.calls.remove(&ev.ctx_id)
                };
                if let Some(mut ctx) = ctx {
                    ctx.state = CallState::Cleanup;
                    self.clean_up(&ctx).await;
                }
            }
            kind => {
                let mut state = self.state.lock().unwrap();
                if let Some(ctx) = state.calls.get_mut(&ev.ctx_id) {
                    ctx.state = kind;
                }
            }
        }
    }

    /// Stops media, hangs up the SIP leg and discards the Telegram leg.
    /// The three teardowns are independent; failures are only logged.
    async fn clean_up(&self, ctx: &CallContext) {
        info!(ctx_id = %ctx.id, "🧹 cleaning up call");
        if let Some(media) = &ctx.media {
            media.stop();
        }
        if !ctx.sip_call_id.is_empty() {
            if let Err(e) = self.sip.hangup(&ctx.sip_call_id).await {
                debug!("hangup skipped: {}", e);
            }
        }
        if ctx.tg_call_id != 0 {
            if let Err(e) = calls::discard_call(self.tg.as_ref(), ctx.tg_call_id).await {
                warn!("discard telegram call failed: {}", e);
            }
        }
    }

    async fn shutdown_cleanup(&self) {
        let contexts: Vec<CallContext> = {
            let mut state = self.state.lock().unwrap();
            state.calls.drain().map(|(_, ctx)| ctx).collect()
        };
        for ctx in contexts {
            self.clean_up(&ctx).await;
        }
    }

    // --- flood block ---

    /// Remaining block time, clearing an expired deadline on the way.
    fn flood_block_remaining(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        let deadline = state.block_until?;
        let now = Instant::now();
        if now >= deadline {
            state.block_until = None;
            return None;
        }
        Some(deadline - now)
    }

    fn set_flood_block(&self, kind: FloodKind) -> Duration {
        let wait = match kind {
            FloodKind::RetryAfter(wait) => wait,
            FloodKind::PeerFlood => self.config.peer_flood_wait,
        } + self.config.extra_wait;
        self.state.lock().unwrap().block_until = Some(Instant::now() + wait);
        wait
    }

    fn clear_flood_block(&self) {
        self.state.lock().unwrap().block_until = None;
    }

    // --- plumbing ---

    async fn reject_invite(&self, req: &Request, src: SocketAddr, err: Error) {
        if let Error::Telegram(tg_err) = &err {
            if let Some(kind) = flood::classify(tg_err) {
                let wait = self.set_flood_block(kind);
                warn!(
                    "telegram flood while resolving, blocking outbound work for {}s",
                    wait.as_secs()
                );
                self.respond_flood(req, src, wait).await;
                return;
            }
        }
        warn!("INVITE handling failed: {}", err);
        self.respond(req, src, StatusCode::ServerInternalError, vec![])
            .await;
    }

    async fn respond_flood(&self, req: &Request, src: SocketAddr, wait: Duration) {
        let reason = Header::Other("Reason".to_string(), format!("FLOOD_WAIT {}", wait.as_secs()));
        self.respond(req, src, StatusCode::ServiceUnavailable, vec![reason])
            .await;
    }

    async fn respond(
        &self,
        req: &Request,
        src: SocketAddr,
        status: StatusCode,
        extra: Vec<Header>,
    ) {
        let resp = make_response(req, status, extra);
        if let Err(e) = self.transport.send(&resp.into(), src).await {
            warn!("failed to send SIP response: {}", e);
        }
    }

    async fn emit(&self, event: GatewayEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!("outward event bus closed");
        }
    }

    async fn post(&self, ev: InternalEvent) {
        if self.internal_tx.send(ev).await.is_err() {
            debug!("internal event bus closed");
        }
    }

    // --- introspection ---

    /// Attaches a media controller to a live call so cleanup can stop it.
    pub fn attach_media(&self, ctx_id: &str, media: Arc<dyn MediaController>) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.calls.get_mut(ctx_id) {
            Some(ctx) => {
                ctx.media = Some(media);
                Ok(())
            }
            None => Err(Error::CallNotFound(ctx_id.to_string())),
        }
    }

    pub fn call_state(&self, ctx_id: &str) -> Option<CallState> {
        self.state.lock().unwrap().calls.get(ctx_id).map(|c| c.state)
    }

    pub fn active_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }
}

fn request_call_id(req: &Request) -> Option<String> {
    match req.call_id_header() {
        Ok(c) => Some(c.value().to_string()),
        Err(e) => {
            warn!("request without Call-ID dropped: {}", e);
            None
        }
    }
}

/// Outbound identity headers for a Telegram-initiated call; empty fields
/// are omitted.
fn build_user_headers(tg_call_id: i64, user: &User) -> Vec<(String, String)> {
    let mut headers = vec![
        ("X-GW-Context".to_string(), tg_call_id.to_string()),
        ("X-TG-ID".to_string(), user.id.to_string()),
    ];
    if !user.first_name.is_empty() {
        headers.push(("X-TG-FirstName".to_string(), user.first_name.clone()));
    }
    if !user.last_name.is_empty() {
        headers.push(("X-TG-LastName".to_string(), user.last_name.clone()));
    }
    let username = user.primary_username();
    if !username.is_empty() {
        headers.push(("X-TG-Username".to_string(), username.to_string()));
    }
    if !user.phone_number.is_empty() {
        headers.push(("X-TG-Phone".to_string(), user.phone_number.clone()));
    }
    headers
}

/// Percent-decodes the user part of a SIP URI (`tg%23alice` -> `tg#alice`).
fn decode_extension(raw: &str) -> String {
    fn hex(b: u8) -> Option<u8> {
        (b as char).to_digit(16).map(|d| d as u8)
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push(high * 16 + low);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
