use async_trait::async_trait;

use crate::session::Session;
use crate::types::{ClientId, DashMap};

/// Where detached persistent sessions live between connections.
///
/// Only the in-memory implementation ships; the trait is the seam for a
/// durable backend.
#[async_trait]
pub trait SessionStore: Sync + Send {
    async fn load(&self, client_id: &str) -> Option<Session>;
    async fn save(&self, session: Session);
    async fn delete(&self, client_id: &str);
}

#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<ClientId, Session>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, client_id: &str) -> Option<Session> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    async fn save(&self, session: Session) {
        self.sessions.insert(session.id.client_id.clone(), session);
    }

    async fn delete(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Id;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let s = Session::new(Id::new(1, "c1".into(), None, None), false, 16, 8, 8);

        store.save(s.clone()).await;
        let loaded = store.load("c1").await.unwrap();
        assert_eq!(loaded.id, s.id);

        store.delete("c1").await;
        assert!(store.load("c1").await.is_none());
    }
}
