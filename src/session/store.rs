use super::types::{Session, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// Backing store holding sessions at rest
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a copy of the session with `id`, if stored
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Write the session under its current id, replacing any previous copy
    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Delete the session with `id`; deleting a missing id is not an error
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Number of stored sessions
    async fn len(&self) -> Result<usize, StoreError>;

    /// Delete every stored session
    async fn clear(&self) -> Result<(), StoreError>;

    /// Store name for logging
    fn store_type(&self) -> &'static str;
}

/// Process-local store, mostly for tests and simulations
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: DashMap<String, Session>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        debug!("Storing session {} in memory", session.id());
        self.sessions.insert(session.id().to_string(), session.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.remove(id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.sessions.len())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.sessions.clear();
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
