use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle outcomes counted by the valve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveEvent {
    Request,
    Bypassed,
    Rejected,
    Loaded,
    ExpiredOnLoad,
    LoadFailure,
    Persisted,
    PersistSkipped,
    PersistFailure,
    AsyncDeferred,
    DownstreamFailure,
    AsyncCompleted,
    Reaped,
}

/// Counters for operators; all updates are lock-free
#[derive(Debug, Default)]
pub struct ValveStats {
    requests: AtomicU64,
    bypassed: AtomicU64,
    rejected: AtomicU64,
    loaded: AtomicU64,
    expired_on_load: AtomicU64,
    load_failures: AtomicU64,
    persisted: AtomicU64,
    persist_skipped: AtomicU64,
    persist_failures: AtomicU64,
    async_deferred: AtomicU64,
    downstream_failures: AtomicU64,
    async_completed: AtomicU64,
    reaped: AtomicU64,
}

/// Point-in-time copy of [`ValveStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValveStatsSnapshot {
    pub requests: u64,
    pub bypassed: u64,
    pub rejected: u64,
    pub loaded: u64,
    pub expired_on_load: u64,
    pub load_failures: u64,
    pub persisted: u64,
    pub persist_skipped: u64,
    pub persist_failures: u64,
    pub async_deferred: u64,
    pub downstream_failures: u64,
    pub async_completed: u64,
    pub reaped: u64,
}

impl ValveStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: ValveEvent) {
        self.record_many(event, 1);
    }

    /// Count `count` occurrences of `event` at once
    pub fn record_many(&self, event: ValveEvent, count: u64) {
        let counter = match event {
            ValveEvent::Request => &self.requests,
            ValveEvent::Bypassed => &self.bypassed,
            ValveEvent::Rejected => &self.rejected,
            ValveEvent::Loaded => &self.loaded,
            ValveEvent::ExpiredOnLoad => &self.expired_on_load,
            ValveEvent::LoadFailure => &self.load_failures,
            ValveEvent::Persisted => &self.persisted,
            ValveEvent::PersistSkipped => &self.persist_skipped,
            ValveEvent::PersistFailure => &self.persist_failures,
            ValveEvent::AsyncDeferred => &self.async_deferred,
            ValveEvent::DownstreamFailure => &self.downstream_failures,
            ValveEvent::AsyncCompleted => &self.async_completed,
            ValveEvent::Reaped => &self.reaped,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ValveStatsSnapshot {
        ValveStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            loaded: self.loaded.load(Ordering::Relaxed),
            expired_on_load: self.expired_on_load.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_skipped: self.persist_skipped.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            async_deferred: self.async_deferred.load(Ordering::Relaxed),
            downstream_failures: self.downstream_failures.load(Ordering::Relaxed),
            async_completed: self.async_completed.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}
