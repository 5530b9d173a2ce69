use super::config::{BypassFilter, ValveConfig};
use super::rejection::{RejectionHandler, StatusRejection};
use super::stats::{ValveEvent, ValveStats, ValveStatsSnapshot};
use crate::lock::{ContentionPolicy, KeyedLock, LockHandle, LockRegistry, PermitGuard};
use crate::pipeline::{PipelineError, Request, Response, Stage};
use crate::session::{Clock, IdleTimeoutPolicy, SessionManager, StalenessPolicy, SystemClock};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pipeline stage that loads a request's session from the store before the
/// rest of the pipeline runs and writes it back afterwards.
///
/// Requests carrying the same session id are serialized through a per-id
/// lock for the whole load, process, save cycle, so the store never sees two
/// concurrent writers for one session from this process. Nothing coordinates
/// across processes: clients or the load balancer must keep concurrent
/// requests for one session on a single instance.
pub struct PersistentValve {
    config: ValveConfig,
    policy: ContentionPolicy,
    filter: Option<BypassFilter>,
    registry: LockRegistry,
    manager: Arc<dyn SessionManager>,
    next: Arc<dyn Stage>,
    rejection: Arc<dyn RejectionHandler>,
    staleness: Arc<dyn StalenessPolicy>,
    clock: Arc<dyn Clock>,
    stats: ValveStats,
}

/// Builder for [`PersistentValve`] with optional strategy overrides
pub struct PersistentValveBuilder {
    config: ValveConfig,
    manager: Arc<dyn SessionManager>,
    next: Arc<dyn Stage>,
    rejection: Option<Arc<dyn RejectionHandler>>,
    staleness: Arc<dyn StalenessPolicy>,
    clock: Arc<dyn Clock>,
}

impl PersistentValveBuilder {
    /// Replace the default status-code rejection
    pub fn rejection_handler(mut self, handler: Arc<dyn RejectionHandler>) -> Self {
        self.rejection = Some(handler);
        self
    }

    pub fn staleness_policy(mut self, policy: Arc<dyn StalenessPolicy>) -> Self {
        self.staleness = policy;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> PersistentValve {
        let policy = self.config.contention_policy();
        let filter = self.config.bypass_filter();
        let rejection = self
            .rejection
            .unwrap_or_else(|| Arc::new(StatusRejection::new(self.config.rejection_status)));

        info!(
            "Persistent valve ready: policy={:?}, fairness={}, filter={:?}",
            policy,
            self.config.lock_fairness,
            filter.as_ref().map(BypassFilter::as_str)
        );

        PersistentValve {
            registry: LockRegistry::new(self.config.lock_fairness),
            config: self.config,
            policy,
            filter,
            manager: self.manager,
            next: self.next,
            rejection,
            staleness: self.staleness,
            clock: self.clock,
            stats: ValveStats::new(),
        }
    }
}

/// Holds a request's registry handle and, once acquired, its permit.
///
/// Dropping the lease releases both exactly once, whether the request
/// finished, failed, or its future was dropped mid-flight.
struct SessionLease<'a> {
    registry: &'a LockRegistry,
    handle: Option<LockHandle>,
    permit: Option<PermitGuard>,
}

impl<'a> SessionLease<'a> {
    /// Register interest in `key`, returning the lease and the lock to wait on
    fn open(registry: &'a LockRegistry, key: &str) -> (Self, Arc<KeyedLock>) {
        let handle = registry.acquire_handle(key);
        let lock = Arc::clone(handle.lock());
        let lease = Self {
            registry,
            handle: Some(handle),
            permit: None,
        };
        (lease, lock)
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        // Give the permit back before the handle so the entry is never
        // removed while a permit taken through it is outstanding.
        drop(self.permit.take());
        if let Some(handle) = self.handle.take() {
            self.registry.release_handle(handle);
        }
    }
}

impl PersistentValve {
    pub fn new(config: ValveConfig, manager: Arc<dyn SessionManager>, next: Arc<dyn Stage>) -> Self {
        Self::builder(config, manager, next).build()
    }

    pub fn builder(
        config: ValveConfig,
        manager: Arc<dyn SessionManager>,
        next: Arc<dyn Stage>,
    ) -> PersistentValveBuilder {
        PersistentValveBuilder {
            config,
            manager,
            next,
            rejection: None,
            staleness: Arc::new(IdleTimeoutPolicy),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(&self) -> &ValveConfig {
        &self.config
    }

    pub fn contention_policy(&self) -> ContentionPolicy {
        self.policy
    }

    /// The compiled bypass filter, `None` if unset or malformed
    pub fn bypass_filter(&self) -> Option<&BypassFilter> {
        self.filter.as_ref()
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<dyn SessionManager> {
        &self.manager
    }

    pub fn stats(&self) -> ValveStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether `path` matches the bypass filter
    pub fn is_request_without_session(&self, path: &str) -> bool {
        self.filter.as_ref().is_some_and(|filter| filter.matches(path))
    }

    /// Run one request through the session lifecycle.
    ///
    /// Downstream errors are returned unchanged after the session has been
    /// dropped from the working set and its lock released. Store errors are
    /// logged and never returned.
    pub async fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), PipelineError> {
        self.stats.record(ValveEvent::Request);

        if self.is_request_without_session(request.decoded_path()) {
            debug!("Bypassing session handling for {}", request.decoded_path());
            self.stats.record(ValveEvent::Bypassed);
            return self.delegate(request, response).await;
        }

        let Some(session_id) = request.requested_session_id().map(str::to_owned) else {
            return self.invoke_without_session(request, response).await;
        };

        let (mut lease, lock) = SessionLease::open(&self.registry, &session_id);

        match lock.acquire_with(self.policy, request.cancellation()).await {
            Ok(permit) => lease.permit = Some(permit),
            Err(reason) => {
                info!("Session {} not acquired: {}", session_id, reason);
                self.stats.record(ValveEvent::Rejected);
                drop(lease);
                self.rejection.on_not_acquired(request, response, reason);
                return Ok(());
            }
        }

        self.load_session(&session_id).await;
        debug!("Session {} locked, delegating to {}", session_id, self.next.stage_name());

        if let Err(e) = self.delegate(request, response).await {
            self.discard_session(request);
            return Err(e);
        }

        if request.is_async_pending() {
            debug!("Request for session {} still async, not persisting", session_id);
            self.stats.record(ValveEvent::AsyncDeferred);
            return Ok(());
        }

        self.persist_session(request).await;
        Ok(())
    }

    /// Persist the session of a request that returned from [`invoke`] with
    /// asynchronous processing still pending, once that processing is done.
    ///
    /// Takes the session lock again, waiting without regard to cancellation,
    /// since the session would otherwise never leave the working set.
    ///
    /// [`invoke`]: Self::invoke
    pub async fn complete_async(&self, request: &mut Request) {
        if !request.is_async_pending() {
            debug!("Request for {} is not async, nothing to complete", request.decoded_path());
            return;
        }
        request.complete_async();

        let Some(session_id) = request.resolved_session_id().map(str::to_owned) else {
            return;
        };
        let (mut lease, lock) = SessionLease::open(&self.registry, &session_id);
        lease.permit = Some(lock.acquire().await);

        self.stats.record(ValveEvent::AsyncCompleted);
        self.persist_session(request).await;
    }

    /// Drop invalid or stale sessions from the working set
    pub fn process_expires(&self) -> usize {
        let reaped = self
            .manager
            .process_expires(self.staleness.as_ref(), self.clock.now());
        self.stats.record_many(ValveEvent::Reaped, reaped as u64);
        reaped
    }

    /// Run [`process_expires`](Self::process_expires) every `period` until
    /// the returned token is cancelled.
    pub fn spawn_expiry_sweep(valve: Arc<Self>, period: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Session expiry sweep started (every {:?})", period);

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        info!("Session expiry sweep shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        valve.process_expires();
                    }
                }
            }
        });

        cancel
    }

    async fn invoke_without_session(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), PipelineError> {
        self.stats.record(ValveEvent::Bypassed);
        self.delegate(request, response).await?;

        if !self.config.persist_new_sessions {
            return Ok(());
        }
        if request.is_async_pending() {
            self.stats.record(ValveEvent::AsyncDeferred);
            return Ok(());
        }
        // A session created during this request is unknown to any other
        // request, so it can be written without taking its lock.
        if request.resolved_session_id().is_some() {
            self.persist_session(request).await;
        }
        Ok(())
    }

    async fn delegate(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), PipelineError> {
        let result = self.next.process(request, response).await;
        if let Err(e) = &result {
            warn!("Stage {} failed: {}", self.next.stage_name(), e);
            self.stats.record(ValveEvent::DownstreamFailure);
        }
        result
    }

    /// Forget the working-set copy after a failed request; the stored copy
    /// stays as it was before the request.
    fn discard_session(&self, request: &Request) {
        if let Some(session_id) = request.resolved_session_id()
            && self.manager.detach(session_id).is_some()
        {
            debug!("Discarded session {} after failed request", session_id);
        }
    }

    /// Bring the stored session into the working set, or expire it
    async fn load_session(&self, session_id: &str) {
        let loaded = match self.manager.load(session_id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Failed to load session {}: {}", session_id, e);
                self.stats.record(ValveEvent::LoadFailure);
                None
            }
        };

        let Some(mut session) = loaded else {
            debug!("No stored session {}", session_id);
            return;
        };

        let now = self.clock.now();
        if !session.is_valid() || self.staleness.is_stale(&session, now) {
            debug!("Stored session {} is invalid or expired", session_id);
            session.expire();
            if let Err(e) = self.manager.remove(session_id).await {
                warn!("Failed to remove expired session {}: {}", session_id, e);
            }
            self.stats.record(ValveEvent::ExpiredOnLoad);
            return;
        }

        session.access(now);
        self.manager.activate(session);
        self.stats.record(ValveEvent::Loaded);
    }

    /// Write the request's session back to the store and evict it
    async fn persist_session(&self, request: &Request) {
        let Some(session_id) = request.resolved_session_id() else {
            debug!("No session bound to request after processing");
            return;
        };

        let Some(shared) = self.manager.find(session_id) else {
            debug!("Session {} not active after processing, skipping store", session_id);
            self.stats.record(ValveEvent::PersistSkipped);
            return;
        };

        let mut session = shared.write().await;
        let valid = session.is_valid();
        let stale = self.staleness.is_stale(&session, self.clock.now());
        if !valid || stale {
            debug!(
                "Not storing session {} (valid: {}, stale: {})",
                session_id, valid, stale
            );
            self.stats.record(ValveEvent::PersistSkipped);
            return;
        }

        if let Err(e) = self.manager.save(&session).await {
            error!("Failed to store session {}: {}", session_id, e);
            self.stats.record(ValveEvent::PersistFailure);
            return;
        }

        self.manager.detach(session_id);
        session.recycle();
        self.stats.record(ValveEvent::Persisted);
        debug!("Stored and released session {}", session_id);
    }
}

#[async_trait]
impl Stage for PersistentValve {
    async fn process(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), PipelineError> {
        self.invoke(request, response).await
    }

    fn stage_name(&self) -> &'static str {
        "persistent_valve"
    }
}
