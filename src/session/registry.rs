// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::Session;

/// Concurrent registry of live sessions keyed by session id.
///
/// Backed by sharded maps, so unrelated connections never contend on one lock.
/// Cloning is cheap and every clone sees the same sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    devices: Arc<DashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    /// Inserts `session`; putting the same id again keeps a single entry.
    pub fn put(&self, session: Arc<Session>) -> bool {
        let id = session.id().to_string();
        let inserted = self.sessions.insert(id, session).is_none();
        debug!("session totals: {}", self.len());
        inserted
    }

    /// Removes `session` if it is the registered instance for its id.
    pub fn remove(&self, session: &Session) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, registered| {
                std::ptr::eq(registered.as_ref(), session)
            })
            .is_some();
        if let Some(device_id) = session.device_id() {
            self.devices
                .remove_if(device_id, |_, session_id| session_id == session.id());
        }
        if removed {
            info!("removed session {}, session totals: {}", session, self.len());
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Binds `device_id` to `session` and indexes it. A device reconnecting on a
    /// new session takes over the index entry.
    pub fn bind_device(&self, session: &Arc<Session>, device_id: &str) -> bool {
        if device_id.is_empty() || !session.bind_device(device_id) {
            return false;
        }
        if let Some(previous) = self
            .devices
            .insert(device_id.to_string(), session.id().to_string())
        {
            debug!(
                "device {} moved from session {} to {}",
                device_id,
                previous,
                session.id()
            );
        }
        true
    }

    pub fn get_by_device(&self, device_id: &str) -> Option<Arc<Session>> {
        let session_id = self.devices.get(device_id)?.value().clone();
        self.get(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Asks every registered connection to close.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::session::session::tests::test_session;

    #[test]
    fn test_put_is_idempotent_and_remove_twice_is_noop() {
        let registry = SessionRegistry::new();
        let (session, _link) = test_session(Some(9001));

        assert!(registry.put(session.clone()));
        assert!(!registry.put(session.clone()));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(session.id()).is_some());

        assert!(registry.remove(&session));
        assert!(!registry.remove(&session));
        assert!(registry.is_empty());
        assert!(registry.get(session.id()).is_none());
    }

    #[test]
    fn test_device_index_follows_newest_session() {
        let registry = SessionRegistry::new();
        let (old, _old_link) = test_session(None);
        let (new, _new_link) = test_session(None);
        registry.put(old.clone());
        registry.put(new.clone());

        assert!(registry.bind_device(&old, "dev-1"));
        assert!(registry.bind_device(&new, "dev-1"));
        assert_eq!(registry.get_by_device("dev-1").unwrap().id(), new.id());

        // removing the stale session keeps the newer binding
        registry.remove(&old);
        assert_eq!(registry.get_by_device("dev-1").unwrap().id(), new.id());
        registry.remove(&new);
        assert!(registry.get_by_device("dev-1").is_none());
    }

    #[test]
    fn test_concurrent_put_and_remove() {
        let registry = SessionRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let (session, _link) = test_session(None);
                        registry.put(session.clone());
                        assert!(registry.get(session.id()).is_some());
                        registry.remove(&session);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_all_cancels_sessions() {
        let registry = SessionRegistry::new();
        let (session, link) = test_session(None);
        registry.put(session.clone());
        registry.close_all();
        assert!(link.closer.is_cancelled());
    }
}
