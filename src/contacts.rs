// telegram-sip-bridge/src/contacts.rs
//
// Contact cache: a bidirectional index from lowercase username / phone
// number to Telegram user id. Many readers, single writer.

use crate::telegram::{TelegramApi, TgError, User};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, warn};

const REFRESH_SEARCH_LIMIT: i32 = 100;

#[derive(Default)]
struct Index {
    by_username: HashMap<String, i64>,
    by_phone: HashMap<String, i64>,
}

impl Index {
    fn insert(&mut self, user: &User) {
        let username = user.primary_username();
        if !username.is_empty() {
            self.by_username.insert(username.to_lowercase(), user.id);
        }
        if !user.phone_number.is_empty() {
            // Phone keys are stored exactly as Telegram reports them.
            self.by_phone.insert(user.phone_number.clone(), user.id);
        }
    }
}

#[derive(Default)]
pub struct ContactCache {
    index: RwLock<Index>,
}

impl ContactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces both mappings wholesale.
    pub fn set(&self, users: &[User]) {
        let mut index = self.index.write().unwrap();
        *index = Index::default();
        for user in users {
            index.insert(user);
        }
    }

    /// Inserts or overwrites a single user's entries.
    pub fn update(&self, user: &User) {
        self.index.write().unwrap().insert(user);
    }

    /// Looks up a key as lowercase username first, then as a verbatim phone
    /// number.
    pub fn resolve(&self, key: &str) -> Option<i64> {
        let index = self.index.read().unwrap();
        if let Some(id) = index.by_username.get(&key.to_lowercase()) {
            return Some(*id);
        }
        index.by_phone.get(key).copied()
    }

    /// Rebuilds the cache from the union of the contact list and an
    /// empty-query contact search. Users that fail to fetch are skipped;
    /// only a failing contact list read fails the refresh.
    pub async fn refresh(&self, tg: &dyn TelegramApi) -> Result<(), TgError> {
        let mut ids: HashSet<i64> = tg.get_contacts().await?.into_iter().collect();
        match tg.search_contacts("", REFRESH_SEARCH_LIMIT).await {
            Ok(more) => ids.extend(more),
            Err(e) => debug!("contact search during refresh failed: {}", e),
        }

        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            match tg.get_user(id).await {
                Ok(user) => users.push(user),
                Err(e) => debug!(user_id = id, "skipping contact: {}", e),
            }
        }
        self.set(&users);
        debug!(count = users.len(), "contact cache refreshed");
        Ok(())
    }

    /// Server-side search with limit 1; a hit is fetched, cached and
    /// returned. Any Telegram failure is reported as a miss.
    pub async fn search_and_add(&self, tg: &dyn TelegramApi, query: &str) -> Option<i64> {
        let ids = match tg.search_contacts(query, 1).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(query, "contact search failed: {}", e);
                return None;
            }
        };
        let id = *ids.first()?;
        match tg.get_user(id).await {
            Ok(user) => {
                self.update(&user);
                Some(user.id)
            }
            Err(e) => {
                warn!(user_id = id, "contact fetch failed: {}", e);
                None
            }
        }
    }

    #[cfg(test)]
    fn snapshot(&self) -> (Vec<(String, i64)>, Vec<(String, i64)>) {
        let index = self.index.read().unwrap();
        let mut usernames: Vec<_> = index
            .by_username
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let mut phones: Vec<_> = index.by_phone.iter().map(|(k, v)| (k.clone(), *v)).collect();
        usernames.sort();
        phones.sort();
        (usernames, phones)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::mock::MockTelegram;
    use crate::telegram::types::Usernames;

    fn user(id: i64, username: &str, phone: &str) -> User {
        User {
            id,
            usernames: (!username.is_empty()).then(|| Usernames {
                editable_username: username.to_string(),
                active_usernames: vec![username.to_string()],
            }),
            phone_number: phone.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn resolve_is_case_insensitive_for_usernames_only() {
        let cache = ContactCache::new();
        cache.set(&[user(42, "Alice", "15551234")]);
        assert_eq!(cache.resolve("alice"), Some(42));
        assert_eq!(cache.resolve("ALICE"), Some(42));
        assert_eq!(cache.resolve("15551234"), Some(42));
        assert_eq!(cache.resolve("ghost"), None);
    }

    #[test]
    fn set_replaces_previous_content() {
        let cache = ContactCache::new();
        cache.set(&[user(1, "old", "111")]);
        cache.set(&[user(2, "new", "222")]);
        assert_eq!(cache.resolve("old"), None);
        assert_eq!(cache.resolve("111"), None);
        assert_eq!(cache.resolve("new"), Some(2));
    }

    #[test]
    fn update_overwrites_single_entry() {
        let cache = ContactCache::new();
        cache.set(&[user(1, "alice", "111")]);
        cache.update(&user(2, "alice", "222"));
        assert_eq!(cache.resolve("alice"), Some(2));
        // the stale phone entry of user 1 is untouched by a single update
        assert_eq!(cache.resolve("111"), Some(1));
    }

    #[test]
    fn index_is_order_independent() {
        let users = vec![
            user(1, "alice", "111"),
            user(2, "bob", "222"),
            user(3, "carol", "333"),
        ];
        let mut reversed = users.clone();
        reversed.reverse();

        let a = ContactCache::new();
        a.set(&users);
        let b = ContactCache::new();
        b.set(&reversed);
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[tokio::test]
    async fn refresh_unions_contacts_and_search() {
        let tg = MockTelegram::new()
            .with_user(user(1, "alice", "111"))
            .with_user(user(2, "bob", "222"))
            .with_contacts(&[1, 2, 3]); // user 3 fails to fetch and is skipped

        let cache = ContactCache::new();
        cache.refresh(&tg).await.unwrap();
        assert_eq!(cache.resolve("alice"), Some(1));
        assert_eq!(cache.resolve("bob"), Some(2));
        assert_eq!(cache.resolve("222"), Some(2));
    }

    #[tokio::test]
    async fn search_and_add_caches_hits_and_swallows_errors() {
        let tg = MockTelegram::new()
            .with_user(user(9, "dave", "999"))
            .with_search_result("dave", &[9]);

        let cache = ContactCache::new();
        assert_eq!(cache.search_and_add(&tg, "dave").await, Some(9));
        // now cached
        assert_eq!(cache.resolve("dave"), Some(9));
        // a miss stays a miss
        assert_eq!(cache.search_and_add(&tg, "ghost").await, None);
        // a search hit whose user fetch fails is a miss too
        let tg = MockTelegram::new().with_search_result("gone", &[77]);
        assert_eq!(cache.search_and_add(&tg, "gone").await, None);
    }
}
