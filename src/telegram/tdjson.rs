// telegram-sip-bridge/src/telegram/tdjson.rs
//
// Production adapter speaking TDLib's JSON interface. The tdjson shared
// library is loaded at runtime so the crate builds and tests without it.
// Requests are correlated with responses through the `@extra` field; every
// other object coming out of `td_receive` is an update.

use super::types::{CallProtocol, Update, User};
use super::{TelegramApi, TgError};
use crate::config::{ProxySettings, TelegramSettings};
use crate::error::Error;
use async_trait::async_trait;
use dashmap::DashMap;
use libloading::{Library, Symbol};
use serde_json::{json, Value};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const UPDATE_BUFFER: usize = 64;
const RECEIVE_TIMEOUT_SECS: f64 = 2.0;

pub struct TdJson {
    lib: Library,
    client_id: c_int,
    seq: AtomicU64,
    pending: DashMap<String, oneshot::Sender<Value>>,
    auth_tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    updates_tx: mpsc::Sender<Update>,
}

impl TdJson {
    /// Loads the tdjson shared library, creates a client and starts the
    /// receive thread. Returns the client together with the stream of
    /// gateway-relevant updates.
    pub fn open(verbosity: u8) -> crate::Result<(Arc<Self>, mpsc::Receiver<Update>)> {
        let path = libloading::library_filename("tdjson");
        let lib = unsafe { Library::new(&path) }
            .map_err(|e| Error::Other(format!("failed to load {:?}: {}", path, e)))?;

        let client_id = unsafe {
            let create: Symbol<unsafe extern "C" fn() -> c_int> = lib
                .get(b"td_create_client_id\0")
                .map_err(|e| Error::Other(format!("td_create_client_id: {}", e)))?;
            create()
        };

        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let td = Arc::new(Self {
            lib,
            client_id,
            seq: AtomicU64::new(1),
            pending: DashMap::new(),
            auth_tx: Mutex::new(None),
            updates_tx,
        });

        td.execute(&json!({
            "@type": "setLogVerbosityLevel",
            "new_verbosity_level": verbosity,
        }));
        td.execute(&json!({
            "@type": "setLogStream",
            "log_stream": {
                "@type": "logStreamFile",
                "path": "tdlib.log",
                "max_file_size": 104_857_600,
                "redirect_stderr": true,
            },
        }));

        let receiver = td.clone();
        std::thread::Builder::new()
            .name("tdjson-recv".to_string())
            .spawn(move || receiver.receive_loop())?;

        Ok((td, updates_rx))
    }

    /// Drives the TDLib authorization sequence until the session is ready.
    /// Interactive steps (code, password, missing phone number) are read
    /// from stdin.
    pub async fn authorize(&self, settings: &TelegramSettings) -> crate::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.auth_tx.lock().unwrap() = Some(tx);

        if let Some(proxy) = &settings.proxy {
            self.add_proxy(proxy).await.map_err(Error::Telegram)?;
        }

        let mut state = self
            .request(json!({ "@type": "getAuthorizationState" }))
            .await
            .map_err(Error::Telegram)?;

        loop {
            let kind = state
                .get("@type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            match kind.as_str() {
                "authorizationStateWaitTdlibParameters" => {
                    self.request(tdlib_parameters(settings))
                        .await
                        .map_err(Error::Telegram)?;
                }
                "authorizationStateWaitPhoneNumber" => {
                    let phone = match &settings.phone_number {
                        Some(p) => p.clone(),
                        None => prompt("Enter phone number: ").await?,
                    };
                    self.request(json!({
                        "@type": "setAuthenticationPhoneNumber",
                        "phone_number": phone,
                    }))
                    .await
                    .map_err(Error::Telegram)?;
                }
                "authorizationStateWaitCode" => {
                    let code = prompt("Enter authentication code: ").await?;
                    self.request(json!({ "@type": "checkAuthenticationCode", "code": code }))
                        .await
                        .map_err(Error::Telegram)?;
                }
                "authorizationStateWaitPassword" => {
                    let password = prompt("Enter 2FA password: ").await?;
                    self.request(json!({
                        "@type": "checkAuthenticationPassword",
                        "password": password,
                    }))
                    .await
                    .map_err(Error::Telegram)?;
                }
                "authorizationStateReady" => break,
                "authorizationStateClosed" => {
                    return Err(Error::Other("telegram session closed".to_string()));
                }
                other => debug!(state = other, "ignoring authorization state"),
            }

            state = rx
                .recv()
                .await
                .ok_or_else(|| Error::Other("authorization stream ended".to_string()))?;
        }

        *self.auth_tx.lock().unwrap() = None;
        let me = self.request(json!({ "@type": "getMe" })).await;
        if let Ok(me) = me {
            if let Ok(me) = serde_json::from_value::<User>(me) {
                info!(
                    "🔑 telegram authorized as {} {} (@{})",
                    me.first_name,
                    me.last_name,
                    me.primary_username()
                );
            }
        }
        Ok(())
    }

    async fn add_proxy(&self, proxy: &ProxySettings) -> Result<(), TgError> {
        let mut kind = json!({ "@type": "proxyTypeSocks5" });
        if let Some(user) = &proxy.username {
            kind["username"] = Value::String(user.clone());
        }
        if let Some(password) = &proxy.password {
            kind["password"] = Value::String(password.clone());
        }
        self.request(json!({
            "@type": "addProxy",
            "server": proxy.address,
            "port": proxy.port,
            "enable": true,
            "type": kind,
        }))
        .await
        .map(|_| ())
    }

    /// Sends a request and awaits its `@extra`-correlated response.
    async fn request(&self, mut payload: Value) -> Result<Value, TgError> {
        let extra = self.seq.fetch_add(1, Ordering::Relaxed).to_string();
        payload["@extra"] = Value::String(extra.clone());

        let (tx, rx) = oneshot::channel();
        self.pending.insert(extra.clone(), tx);
        if let Err(e) = self.send(&payload) {
            self.pending.remove(&extra);
            return Err(e);
        }

        let value = rx
            .await
            .map_err(|_| TgError::new(500, "telegram client closed"))?;
        if value.get("@type").and_then(Value::as_str) == Some("error") {
            return Err(TgError::new(
                value.get("code").and_then(Value::as_i64).unwrap_or(500) as i32,
                value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error"),
            ));
        }
        Ok(value)
    }

    fn send(&self, payload: &Value) -> Result<(), TgError> {
        let raw = CString::new(payload.to_string())
            .map_err(|e| TgError::new(500, format!("request encoding failed: {}", e)))?;
        unsafe {
            let send: Symbol<unsafe extern "C" fn(c_int, *const c_char)> = self
                .lib
                .get(b"td_send\0")
                .map_err(|e| TgError::new(500, format!("td_send: {}", e)))?;
            send(self.client_id, raw.as_ptr());
        }
        Ok(())
    }

    /// Synchronous request, usable before the client is started.
    fn execute(&self, payload: &Value) {
        let Ok(raw) = CString::new(payload.to_string()) else {
            return;
        };
        unsafe {
            let execute: Result<Symbol<unsafe extern "C" fn(*const c_char) -> *const c_char>, _> =
                self.lib.get(b"td_execute\0");
            if let Ok(execute) = execute {
                execute(raw.as_ptr());
            }
        }
    }

    /// Runs on a dedicated thread; td_receive blocks up to the timeout.
    fn receive_loop(&self) {
        loop {
            // The returned pointer is only valid until the next td_receive
            // call on this thread, so the string is copied out immediately.
            let raw = unsafe {
                let receive: Symbol<unsafe extern "C" fn(f64) -> *const c_char> =
                    match self.lib.get(b"td_receive\0") {
                        Ok(f) => f,
                        Err(_) => return,
                    };
                let ptr = receive(RECEIVE_TIMEOUT_SECS);
                if ptr.is_null() {
                    continue;
                }
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            };

            let Ok(mut value) = serde_json::from_str::<Value>(&raw) else {
                warn!("unparseable tdjson payload dropped");
                continue;
            };

            if let Some(extra) = value
                .get("@extra")
                .and_then(Value::as_str)
                .map(str::to_string)
            {
                if let Some(obj) = value.as_object_mut() {
                    obj.remove("@extra");
                }
                if let Some((_, tx)) = self.pending.remove(&extra) {
                    let _ = tx.send(value);
                }
                continue;
            }

            match value.get("@type").and_then(Value::as_str) {
                Some("updateAuthorizationState") => {
                    let state = value
                        .get_mut("authorization_state")
                        .map(Value::take)
                        .unwrap_or(Value::Null);
                    if let Some(tx) = self.auth_tx.lock().unwrap().as_ref() {
                        let _ = tx.send(state);
                    }
                }
                Some("updateCall") | Some("updateUser") | Some("updateNewMessage") => {
                    match serde_json::from_value::<Update>(value) {
                        Ok(update) => {
                            if self.updates_tx.blocking_send(update).is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!("dropping unparseable update: {}", e),
                    }
                }
                _ => {}
            }
        }
    }
}

fn tdlib_parameters(settings: &TelegramSettings) -> Value {
    json!({
        "@type": "setTdlibParameters",
        "database_directory": format!("{}/database", settings.database_folder),
        "files_directory": format!("{}/files", settings.database_folder),
        "database_encryption_key": "",
        "use_file_database": true,
        "use_chat_info_database": true,
        "use_message_database": true,
        "use_secret_chats": false,
        "api_id": settings.api_id,
        "api_hash": settings.api_hash,
        "system_language_code": settings.system_language_code,
        "device_model": settings.device_model,
        "system_version": settings.system_version,
        "application_version": settings.application_version,
    })
}

async fn prompt(label: &str) -> crate::Result<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(label.as_bytes()).await?;
    stdout.flush().await?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

fn user_ids(mut value: Value) -> Result<Vec<i64>, TgError> {
    let ids = value
        .get_mut("user_ids")
        .map(Value::take)
        .unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(ids)
        .map_err(|e| TgError::new(500, format!("unexpected user id payload: {}", e)))
}

#[async_trait]
impl TelegramApi for TdJson {
    async fn get_contacts(&self) -> Result<Vec<i64>, TgError> {
        let value = self.request(json!({ "@type": "getContacts" })).await?;
        user_ids(value)
    }

    async fn search_contacts(&self, query: &str, limit: i32) -> Result<Vec<i64>, TgError> {
        let value = self
            .request(json!({
                "@type": "searchContacts",
                "query": query,
                "limit": limit,
            }))
            .await?;
        user_ids(value)
    }

    async fn get_user(&self, user_id: i64) -> Result<User, TgError> {
        let value = self
            .request(json!({ "@type": "getUser", "user_id": user_id }))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| TgError::new(500, format!("unexpected user payload: {}", e)))
    }

    async fn create_call(&self, user_id: i64, protocol: CallProtocol) -> Result<i64, TgError> {
        let value = self
            .request(json!({
                "@type": "createCall",
                "user_id": user_id,
                "protocol": protocol_value(&protocol),
                "is_video": false,
            }))
            .await?;
        Ok(value.get("id").and_then(Value::as_i64).unwrap_or_default())
    }

    async fn accept_call(&self, call_id: i64, protocol: CallProtocol) -> Result<(), TgError> {
        self.request(json!({
            "@type": "acceptCall",
            "call_id": call_id,
            "protocol": protocol_value(&protocol),
        }))
        .await
        .map(|_| ())
    }

    async fn discard_call(
        &self,
        call_id: i64,
        is_disconnected: bool,
        duration: i32,
        is_video: bool,
        connection_id: i64,
    ) -> Result<(), TgError> {
        self.request(json!({
            "@type": "discardCall",
            "call_id": call_id,
            "is_disconnected": is_disconnected,
            "duration": duration,
            "is_video": is_video,
            // int64 fields travel as strings in the JSON interface
            "connection_id": connection_id.to_string(),
        }))
        .await
        .map(|_| ())
    }
}

fn protocol_value(protocol: &CallProtocol) -> Value {
    let mut value = serde_json::to_value(protocol).unwrap_or_else(|_| json!({}));
    value["@type"] = Value::String("callProtocol".to_string());
    value
}
