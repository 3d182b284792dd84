// telegram-sip-bridge/src/telegram/mock.rs
//
// In-memory TelegramApi used by tests.

use super::types::{CallProtocol, User};
use super::{TelegramApi, TgError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOp {
    Create { user_id: i64 },
    Accept { call_id: i64 },
    Discard { call_id: i64, connection_id: i64 },
}

#[derive(Default)]
pub struct MockTelegram {
    pub users: Mutex<HashMap<i64, User>>,
    pub contact_ids: Mutex<Vec<i64>>,
    /// Query -> matching user ids; missing queries resolve to no hits.
    pub search_results: Mutex<HashMap<String, Vec<i64>>>,
    pub ops: Mutex<Vec<CallOp>>,
    pub search_calls: Mutex<Vec<String>>,
    pub create_call_error: Mutex<Option<TgError>>,
    next_call_id: AtomicI64,
}

impl MockTelegram {
    pub fn new() -> Self {
        Self {
            next_call_id: AtomicI64::new(100),
            ..Default::default()
        }
    }

    pub fn with_user(self, user: User) -> Self {
        self.users.lock().unwrap().insert(user.id, user);
        self
    }

    pub fn with_contacts(self, ids: &[i64]) -> Self {
        *self.contact_ids.lock().unwrap() = ids.to_vec();
        self
    }

    pub fn with_search_result(self, query: &str, ids: &[i64]) -> Self {
        self.search_results
            .lock()
            .unwrap()
            .insert(query.to_string(), ids.to_vec());
        self
    }

    pub fn fail_create_call(self, err: TgError) -> Self {
        *self.create_call_error.lock().unwrap() = Some(err);
        self
    }

    pub fn ops(&self) -> Vec<CallOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn search_count(&self) -> usize {
        self.search_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TelegramApi for MockTelegram {
    async fn get_contacts(&self) -> Result<Vec<i64>, TgError> {
        Ok(self.contact_ids.lock().unwrap().clone())
    }

    async fn search_contacts(&self, query: &str, limit: i32) -> Result<Vec<i64>, TgError> {
        self.search_calls.lock().unwrap().push(query.to_string());
        let mut ids = if query.is_empty() {
            self.contact_ids.lock().unwrap().clone()
        } else {
            self.search_results
                .lock()
                .unwrap()
                .get(query)
                .cloned()
                .unwrap_or_default()
        };
        ids.truncate(limit.max(0) as usize);
        Ok(ids)
    }

    async fn get_user(&self, user_id: i64) -> Result<User, TgError> {
        self.users
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or_else(|| TgError::new(404, format!("user {} not found", user_id)))
    }

    async fn create_call(&self, user_id: i64, _protocol: CallProtocol) -> Result<i64, TgError> {
        if let Some(err) = self.create_call_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.ops.lock().unwrap().push(CallOp::Create { user_id });
        Ok(self.next_call_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn accept_call(&self, call_id: i64, _protocol: CallProtocol) -> Result<(), TgError> {
        self.ops.lock().unwrap().push(CallOp::Accept { call_id });
        Ok(())
    }

    async fn discard_call(
        &self,
        call_id: i64,
        _is_disconnected: bool,
        _duration: i32,
        _is_video: bool,
        connection_id: i64,
    ) -> Result<(), TgError> {
        self.ops.lock().unwrap().push(CallOp::Discard {
            call_id,
            connection_id,
        });
        Ok(())
    }
}
