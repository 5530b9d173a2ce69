use super::staleness::{Clock, StalenessPolicy, SystemClock};
use super::store::SessionStore;
use super::types::{Session, SessionId, SharedSession, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Moves sessions between the backing store and the active working set.
///
/// The valve drives `load`/`activate` before a request and
/// `find`/`save`/`detach` after it; downstream stages use `find`,
/// `create_session` and `change_session_id`.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Read a session from the backing store
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Write a session to the backing store
    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Delete a session from the backing store
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Attach a session to the active working set
    fn activate(&self, session: Session) -> SharedSession;

    /// Look up an active session
    fn find(&self, id: &str) -> Option<SharedSession>;

    /// Remove a session from the active working set
    fn detach(&self, id: &str) -> Option<SharedSession>;

    /// Create and activate a brand new session
    fn create_session(&self, max_inactive_interval: i64) -> SharedSession;

    /// Re-key an active session, returning its new id. Any stored copy
    /// under the old id is deleted, so the old id stops resolving.
    async fn change_session_id(&self, old_id: &str) -> Option<SessionId>;

    /// Number of sessions in the active working set
    fn active_count(&self) -> usize;

    /// Drop invalid or stale sessions from the working set, returning how
    /// many were removed. Sessions a request currently has locked are skipped.
    fn process_expires(&self, policy: &dyn StalenessPolicy, now: DateTime<Utc>) -> usize;
}

/// Session manager backed by a [`SessionStore`], holding only sessions that
/// requests are currently using.
pub struct PersistentManager {
    store: Arc<dyn SessionStore>,
    active: DashMap<SessionId, SharedSession>,
    clock: Arc<dyn Clock>,
}

impl PersistentManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        info!("Creating persistent session manager over {} store", store.store_type());
        Self {
            store,
            active: DashMap::new(),
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Ids of all active sessions
    pub fn active_ids(&self) -> Vec<SessionId> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[async_trait]
impl SessionManager for PersistentManager {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.store.load(id).await
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.store.save(session).await
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.store.remove(id).await
    }

    fn activate(&self, session: Session) -> SharedSession {
        let id = session.id().to_string();
        let shared = Arc::new(RwLock::new(session));
        if self.active.insert(id.clone(), Arc::clone(&shared)).is_some() {
            debug!("Replaced active session {}", id);
        }
        shared
    }

    fn find(&self, id: &str) -> Option<SharedSession> {
        self.active.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn detach(&self, id: &str) -> Option<SharedSession> {
        self.active.remove(id).map(|(_, session)| session)
    }

    fn create_session(&self, max_inactive_interval: i64) -> SharedSession {
        let id = uuid::Uuid::new_v4().simple().to_string();
        debug!("Creating session {}", id);
        self.activate(Session::new(id, max_inactive_interval, self.clock.now()))
    }

    async fn change_session_id(&self, old_id: &str) -> Option<SessionId> {
        let (_, shared) = self.active.remove(old_id)?;
        let new_id = uuid::Uuid::new_v4().simple().to_string();

        shared.write().await.set_id(new_id.clone());
        self.active.insert(new_id.clone(), shared);

        if let Err(e) = self.store.remove(old_id).await {
            warn!("Failed to remove stored session under old id {}: {}", old_id, e);
        }

        debug!("Changed session id {} -> {}", old_id, new_id);
        Some(new_id)
    }

    fn active_count(&self) -> usize {
        self.active.len()
    }

    fn process_expires(&self, policy: &dyn StalenessPolicy, now: DateTime<Utc>) -> usize {
        let mut reaped = 0;
        self.active.retain(|id, shared| {
            let Ok(mut session) = shared.try_write() else {
                return true;
            };
            if session.is_valid() && !policy.is_stale(&session, now) {
                return true;
            }

            debug!("Reaping session {} from working set", id);
            session.expire();
            reaped += 1;
            false
        });

        if reaped > 0 {
            info!("Reaped {} expired sessions, {} still active", reaped, self.active.len());
        }
        reaped
    }
}
