use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type SessionId = String;

/// A session attached to the active working set, shared between the valve
/// and downstream stages.
pub type SharedSession = Arc<RwLock<Session>>;

/// Externally persisted per-client state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    valid: bool,
    creation_time: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    /// Seconds of inactivity after which the session is stale; `<= 0` never expires
    max_inactive_interval: i64,
    #[serde(default)]
    attributes: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, max_inactive_interval: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            valid: true,
            creation_time: now,
            last_accessed: now,
            max_inactive_interval,
            attributes: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Change the session identity, keeping its state
    pub fn set_id(&mut self, id: impl Into<SessionId>) {
        self.id = id.into();
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the session as no longer usable
    pub fn expire(&mut self) {
        self.valid = false;
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.last_accessed
    }

    pub fn max_inactive_interval(&self) -> i64 {
        self.max_inactive_interval
    }

    pub fn set_max_inactive_interval(&mut self, seconds: i64) {
        self.max_inactive_interval = seconds;
    }

    /// Record an access at `now`
    pub fn access(&mut self, now: DateTime<Utc>) {
        if now > self.last_accessed {
            self.last_accessed = now;
        }
    }

    /// Time since the last access; never negative
    pub fn idle_time(&self, now: DateTime<Utc>) -> Duration {
        let idle = now.signed_duration_since(self.last_accessed);
        if idle < Duration::zero() {
            Duration::zero()
        } else {
            idle
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(name.into(), value);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<serde_json::Value> {
        self.attributes.remove(name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Clear all state once the session has been written back to its store.
    /// A recycled session is invalid and carries no attributes.
    pub fn recycle(&mut self) {
        self.attributes.clear();
        self.valid = false;
        self.max_inactive_interval = 0;
    }
}

/// Failures talking to the backing session store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The id cannot be used as a storage key
    #[error("Invalid session id: {0:?}")]
    InvalidId(String),

    /// The store cannot serve requests right now
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
