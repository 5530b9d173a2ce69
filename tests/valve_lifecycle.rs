use async_trait::async_trait;
use session_valve::lock::NotAcquired;
use session_valve::pipeline::{PipelineError, Request, Response, Stage};
use session_valve::session::{
    Clock, FakeClock, MemoryStore, PersistentManager, Session, SessionManager, SessionStore,
    StoreError,
};
use session_valve::valve::{PersistentValve, RejectionHandler, ValveConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use test_tag::tag;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Memory store that counts calls and can be told to fail loads
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    loads: AtomicUsize,
    saves: AtomicUsize,
    removes: AtomicUsize,
    fail_loads: AtomicBool,
}

impl CountingStore {
    fn calls(&self) -> (usize, usize, usize) {
        (
            self.loads.load(Ordering::SeqCst),
            self.saves.load(Ordering::SeqCst),
            self.removes.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl SessionStore for CountingStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("backend offline".to_string()));
        }
        self.inner.load(id).await
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(session).await
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(id).await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.inner.len().await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear().await
    }

    fn store_type(&self) -> &'static str {
        "counting"
    }
}

/// Stage whose behaviour is chosen per test
#[derive(Default)]
struct ScriptedStage {
    manager: Option<Arc<PersistentManager>>,
    calls: AtomicUsize,
    saw_session: AtomicBool,
    hold: Duration,
    fail: bool,
    go_async: bool,
    bump_hits: bool,
    rekey: bool,
    create_session: bool,
    advance_clock: Option<(FakeClock, chrono::Duration)>,
    spans: Mutex<Vec<(Instant, Instant)>>,
}

#[async_trait]
impl Stage for ScriptedStage {
    async fn process(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(manager) = &self.manager {
            if self.create_session {
                let shared = manager.create_session(1800);
                let id = shared.read().await.id().to_string();
                request.bind_session(id);
            }

            if let Some(id) = request.resolved_session_id().map(str::to_owned) {
                if let Some(shared) = manager.find(&id) {
                    self.saw_session.store(true, Ordering::SeqCst);
                    if self.bump_hits {
                        let mut session = shared.write().await;
                        let hits = session.attribute("hits").and_then(|v| v.as_u64()).unwrap_or(0);
                        session.set_attribute("hits", serde_json::json!(hits + 1));
                    }
                    if self.rekey {
                        let new_id = manager.change_session_id(&id).await.unwrap();
                        request.bind_session(new_id);
                    }
                }
            }
        }

        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        if let Some((clock, by)) = &self.advance_clock {
            clock.advance(*by);
        }
        if self.go_async {
            request.start_async();
        }

        self.spans.lock().unwrap().push((started, Instant::now()));
        if self.fail {
            return Err(PipelineError::Stage("downstream exploded".to_string()));
        }
        response.write("ok");
        Ok(())
    }
}

/// Stage that parks inside the critical section until released
#[derive(Default)]
struct GateStage {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl Stage for GateStage {
    async fn process(&self, _: &mut Request, response: &mut Response) -> Result<(), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        response.write("released");
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRejection {
    reasons: Mutex<Vec<NotAcquired>>,
}

impl RejectionHandler for RecordingRejection {
    fn on_not_acquired(&self, _: &Request, response: &mut Response, reason: NotAcquired) {
        self.reasons.lock().unwrap().push(reason);
        response.send_error(503, "Session busy");
    }
}

fn manager_over(store: &Arc<CountingStore>) -> Arc<PersistentManager> {
    Arc::new(PersistentManager::new(Arc::clone(store) as Arc<dyn SessionStore>))
}

fn build_valve(
    config: ValveConfig,
    manager: &Arc<PersistentManager>,
    stage: Arc<dyn Stage>,
) -> Arc<PersistentValve> {
    Arc::new(PersistentValve::new(
        config,
        Arc::clone(manager) as Arc<dyn SessionManager>,
        stage,
    ))
}

async fn seed(store: &CountingStore, id: &str) {
    let session = Session::new(id, 1800, chrono::Utc::now());
    store.inner.save(&session).await.unwrap();
}

async fn send(valve: &PersistentValve, request: Request) -> (Result<(), PipelineError>, Response) {
    let mut request = request;
    let mut response = Response::new();
    let result = valve.invoke(&mut request, &mut response).await;
    (result, response)
}

#[tokio::test]
async fn test_bypassed_path_touches_neither_registry_nor_store() {
    let store = Arc::new(CountingStore::default());
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage::default());
    let config = ValveConfig {
        bypass_filter: Some(r".*\.(css|png)".to_string()),
        ..Default::default()
    };
    let valve = build_valve(config, &manager, stage.clone());

    let (result, response) = send(&valve, Request::new("/assets/site.css").with_session_id("s1")).await;

    assert!(result.is_ok());
    assert_eq!(response.body(), "ok");
    assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.calls(), (0, 0, 0));
    assert!(valve.registry().is_empty());
    assert_eq!(valve.stats().bypassed, 1);
}

#[tokio::test]
async fn test_request_without_session_id_is_passed_through() {
    let store = Arc::new(CountingStore::default());
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage::default());
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    let (result, _) = send(&valve, Request::new("/login")).await;

    assert!(result.is_ok());
    assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.calls(), (0, 0, 0));
    assert!(valve.registry().is_empty());
}

#[tokio::test]
async fn test_session_is_loaded_persisted_and_evicted() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "s1").await;
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        bump_hits: true,
        ..Default::default()
    });
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    for _ in 0..3 {
        let (result, _) = send(&valve, Request::new("/cart").with_session_id("s1")).await;
        assert!(result.is_ok());
    }

    assert!(stage.saw_session.load(Ordering::SeqCst));
    assert_eq!(manager.active_count(), 0);
    assert!(valve.registry().is_empty());

    let stored = store.inner.load("s1").await.unwrap().unwrap();
    assert_eq!(stored.attribute("hits"), Some(&serde_json::json!(3)));

    let stats = valve.stats();
    assert_eq!(stats.loaded, 3);
    assert_eq!(stats.persisted, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tag(timing)]
async fn test_same_session_requests_do_not_overlap() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "s1").await;
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        hold: Duration::from_millis(100),
        ..Default::default()
    });
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    let started = Instant::now();
    let first = tokio::spawn({
        let valve = Arc::clone(&valve);
        async move { send(&valve, Request::new("/a").with_session_id("s1")).await.0 }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = tokio::spawn({
        let valve = Arc::clone(&valve);
        async move { send(&valve, Request::new("/b").with_session_id("s1")).await.0 }
    });

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert!(started.elapsed() >= Duration::from_millis(200));
    let spans = stage.spans.lock().unwrap().clone();
    assert_eq!(spans.len(), 2);
    assert!(spans[0].1 <= spans[1].0, "second request started inside the first");
    assert!(valve.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tag(timing)]
async fn test_different_sessions_run_concurrently() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "s1").await;
    seed(&store, "s2").await;
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        hold: Duration::from_millis(150),
        ..Default::default()
    });
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    let started = Instant::now();
    let requests = ["s1", "s2"].map(|id| {
        let valve = Arc::clone(&valve);
        tokio::spawn(async move { send(&valve, Request::new("/x").with_session_id(id)).await.0 })
    });
    for request in requests {
        request.await.unwrap().unwrap();
    }

    assert!(started.elapsed() < Duration::from_millis(290));
}

#[tokio::test]
async fn test_non_blocking_rejects_contended_request() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "s1").await;
    let manager = manager_over(&store);
    let stage = Arc::new(GateStage::default());
    let config = ValveConfig {
        block_on_contention: false,
        ..Default::default()
    };
    let valve = build_valve(config, &manager, stage.clone());

    let holder = tokio::spawn({
        let valve = Arc::clone(&valve);
        async move { send(&valve, Request::new("/a").with_session_id("s1")).await }
    });
    stage.entered.notified().await;

    let (result, response) = send(&valve, Request::new("/b").with_session_id("s1")).await;
    assert!(result.is_ok());
    assert_eq!(response.status(), 429);
    assert!(response.is_committed());
    assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
    assert_eq!(valve.registry().usage("s1"), Some(1));

    stage.release.notify_one();
    let (result, response) = holder.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(response.body(), "released");
    assert!(valve.registry().is_empty());
    assert_eq!(valve.stats().rejected, 1);
}

#[tokio::test]
async fn test_custom_rejection_handler_sees_reason() {
    let store = Arc::new(CountingStore::default());
    let manager = manager_over(&store);
    let stage = Arc::new(GateStage::default());
    let rejection = Arc::new(RecordingRejection::default());
    let config = ValveConfig {
        block_on_contention: false,
        ..Default::default()
    };
    let valve = Arc::new(
        PersistentValve::builder(config, Arc::clone(&manager) as Arc<dyn SessionManager>, stage.clone())
            .rejection_handler(rejection.clone())
            .build(),
    );

    let holder = tokio::spawn({
        let valve = Arc::clone(&valve);
        async move { send(&valve, Request::new("/a").with_session_id("s1")).await }
    });
    stage.entered.notified().await;

    let (_, response) = send(&valve, Request::new("/b").with_session_id("s1")).await;
    assert_eq!(response.status(), 503);
    assert_eq!(*rejection.reasons.lock().unwrap(), vec![NotAcquired::Busy]);

    stage.release.notify_one();
    holder.await.unwrap().0.unwrap();
}

#[tokio::test]
async fn test_cancelled_wait_is_rejected() {
    let store = Arc::new(CountingStore::default());
    let manager = manager_over(&store);
    let stage = Arc::new(GateStage::default());
    let rejection = Arc::new(RecordingRejection::default());
    let valve = Arc::new(
        PersistentValve::builder(
            ValveConfig::default(),
            Arc::clone(&manager) as Arc<dyn SessionManager>,
            stage.clone(),
        )
        .rejection_handler(rejection.clone())
        .build(),
    );

    let holder = tokio::spawn({
        let valve = Arc::clone(&valve);
        async move { send(&valve, Request::new("/a").with_session_id("s1")).await }
    });
    stage.entered.notified().await;

    let token = CancellationToken::new();
    let waiter = tokio::spawn({
        let valve = Arc::clone(&valve);
        let token = token.clone();
        async move {
            send(&valve, Request::new("/b").with_session_id("s1").with_cancellation(token)).await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(valve.registry().usage("s1"), Some(2));
    token.cancel();

    let (result, response) = waiter.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(response.status(), 503);
    assert_eq!(*rejection.reasons.lock().unwrap(), vec![NotAcquired::Interrupted]);
    assert_eq!(valve.registry().usage("s1"), Some(1));

    stage.release.notify_one();
    holder.await.unwrap().0.unwrap();
    assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
    assert!(valve.registry().is_empty());
}

#[tokio::test]
async fn test_invalid_stored_session_is_removed() {
    let store = Arc::new(CountingStore::default());
    let mut session = Session::new("s1", 1800, chrono::Utc::now());
    session.expire();
    store.inner.save(&session).await.unwrap();

    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        ..Default::default()
    });
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    let (result, _) = send(&valve, Request::new("/cart").with_session_id("s1")).await;

    assert!(result.is_ok());
    assert!(!stage.saw_session.load(Ordering::SeqCst));
    assert!(!store.inner.contains("s1"));
    assert_eq!(store.calls(), (1, 0, 1));
    assert_eq!(valve.stats().expired_on_load, 1);
}

#[tokio::test]
async fn test_stale_stored_session_is_removed() {
    let start = chrono::Utc::now();
    let clock = FakeClock::new(start);
    let store = Arc::new(CountingStore::default());
    store.inner.save(&Session::new("s1", 30, start)).await.unwrap();
    clock.advance(chrono::Duration::seconds(30));

    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        ..Default::default()
    });
    let valve = PersistentValve::builder(
        ValveConfig::default(),
        Arc::clone(&manager) as Arc<dyn SessionManager>,
        stage.clone(),
    )
    .clock(Arc::new(clock.clone()))
    .build();

    let (result, _) = send(&valve, Request::new("/cart").with_session_id("s1")).await;

    assert!(result.is_ok());
    assert!(!stage.saw_session.load(Ordering::SeqCst));
    assert!(!store.inner.contains("s1"));
}

#[tokio::test]
async fn test_session_gone_stale_during_request_is_not_stored() {
    let start = chrono::Utc::now();
    let clock = FakeClock::new(start);
    let store = Arc::new(CountingStore::default());
    store.inner.save(&Session::new("s1", 30, start)).await.unwrap();

    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        advance_clock: Some((clock.clone(), chrono::Duration::seconds(45))),
        ..Default::default()
    });
    let valve = PersistentValve::builder(
        ValveConfig::default(),
        Arc::clone(&manager) as Arc<dyn SessionManager>,
        stage.clone(),
    )
    .clock(Arc::new(clock.clone()))
    .build();

    let (result, _) = send(&valve, Request::new("/cart").with_session_id("s1")).await;

    assert!(result.is_ok());
    assert!(stage.saw_session.load(Ordering::SeqCst));
    assert_eq!(store.calls().1, 0);
    assert_eq!(valve.stats().persist_skipped, 1);
    assert!(valve.registry().is_empty());
    assert_eq!(clock.now(), start + chrono::Duration::seconds(45));

    // Left in the working set until the next sweep
    assert_eq!(manager.active_count(), 1);
    assert_eq!(valve.process_expires(), 1);
    assert_eq!(manager.active_count(), 0);
    assert_eq!(valve.stats().reaped, 1);
}

#[tokio::test]
async fn test_load_failure_is_treated_as_missing_session() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "s1").await;
    store.fail_loads.store(true, Ordering::SeqCst);

    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        ..Default::default()
    });
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    let (result, response) = send(&valve, Request::new("/cart").with_session_id("s1")).await;

    assert!(result.is_ok());
    assert_eq!(response.body(), "ok");
    assert!(!stage.saw_session.load(Ordering::SeqCst));
    assert_eq!(store.calls(), (1, 0, 0));

    let stats = valve.stats();
    assert_eq!(stats.load_failures, 1);
    assert_eq!(stats.persist_skipped, 1);
    assert!(valve.registry().is_empty());
}

#[tokio::test]
async fn test_async_request_is_not_persisted() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "s1").await;
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        go_async: true,
        ..Default::default()
    });
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    let (result, _) = send(&valve, Request::new("/stream").with_session_id("s1")).await;

    assert!(result.is_ok());
    assert_eq!(store.calls().1, 0);
    assert_eq!(manager.active_count(), 1);
    assert!(valve.registry().is_empty());
    assert_eq!(valve.stats().async_deferred, 1);
}

#[tokio::test]
async fn test_completed_async_request_is_persisted() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "s1").await;
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        go_async: true,
        bump_hits: true,
        ..Default::default()
    });
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    let mut request = Request::new("/stream").with_session_id("s1");
    let mut response = Response::new();
    valve.invoke(&mut request, &mut response).await.unwrap();
    assert!(request.is_async_pending());
    assert_eq!(store.calls().1, 0);

    valve.complete_async(&mut request).await;

    assert!(!request.is_async_pending());
    assert_eq!(store.calls().1, 1);
    assert_eq!(manager.active_count(), 0);
    assert!(valve.registry().is_empty());
    let stored = store.inner.load("s1").await.unwrap().unwrap();
    assert_eq!(stored.attribute("hits"), Some(&serde_json::json!(1)));

    let stats = valve.stats();
    assert_eq!(stats.async_completed, 1);
    assert_eq!(stats.persisted, 1);

    // Completing twice is a no-op
    valve.complete_async(&mut request).await;
    assert_eq!(store.calls().1, 1);
    assert_eq!(valve.stats().async_completed, 1);
}

#[tokio::test]
async fn test_async_completion_waits_for_session_lock() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "s1").await;
    let manager = manager_over(&store);
    let async_stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        go_async: true,
        ..Default::default()
    });
    let deferring = build_valve(ValveConfig::default(), &manager, async_stage);

    let mut request = Request::new("/stream").with_session_id("s1");
    let mut response = Response::new();
    deferring.invoke(&mut request, &mut response).await.unwrap();

    // Hold the key lock from outside and check completion blocks on it
    let handle = deferring.registry().acquire_handle("s1");
    let permit = handle.lock().try_acquire().unwrap();

    let completion = tokio::spawn({
        let valve = Arc::clone(&deferring);
        async move {
            valve.complete_async(&mut request).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!completion.is_finished());
    assert_eq!(store.calls().1, 0);

    drop(permit);
    deferring.registry().release_handle(handle);
    tokio::time::timeout(Duration::from_secs(1), completion)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(store.calls().1, 1);
    assert_eq!(manager.active_count(), 0);
    assert!(deferring.registry().is_empty());
}

#[tokio::test]
async fn test_downstream_failure_propagates_and_releases() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "s1").await;
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        fail: true,
        ..Default::default()
    });
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    let (result, _) = send(&valve, Request::new("/cart").with_session_id("s1")).await;
    assert!(matches!(result, Err(PipelineError::Stage(_))));
    assert_eq!(store.calls().1, 0);
    assert!(valve.registry().is_empty());
    assert_eq!(manager.active_count(), 0);
    assert!(store.inner.contains("s1"));

    // The lock must be free for the next request on the same session
    let next = tokio::time::timeout(
        Duration::from_secs(1),
        send(&valve, Request::new("/cart").with_session_id("s1")),
    )
    .await;
    assert!(next.is_ok());
    assert_eq!(valve.stats().downstream_failures, 2);
}

#[tokio::test]
async fn test_failed_requests_do_not_grow_working_set() {
    let store = Arc::new(CountingStore::default());
    for n in 0..100 {
        seed(&store, &format!("s{}", n)).await;
    }
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        fail: true,
        ..Default::default()
    });
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    for n in 0..100 {
        let (result, _) = send(&valve, Request::new("/cart").with_session_id(format!("s{}", n))).await;
        assert!(result.is_err());
    }

    assert!(stage.saw_session.load(Ordering::SeqCst));
    assert_eq!(manager.active_count(), 0);
    assert!(valve.registry().is_empty());
}

#[tokio::test]
#[tag(timing)]
async fn test_background_sweep_reaps_abandoned_sessions() {
    let start = chrono::Utc::now();
    let clock = FakeClock::new(start);
    let store = Arc::new(CountingStore::default());
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        create_session: true,
        ..Default::default()
    });
    let valve = Arc::new(
        PersistentValve::builder(
            ValveConfig::default(),
            Arc::clone(&manager) as Arc<dyn SessionManager>,
            stage.clone(),
        )
        .clock(Arc::new(clock.clone()))
        .build(),
    );

    // New sessions are not persisted by default and stay in the working set
    for _ in 0..3 {
        send(&valve, Request::new("/signup")).await.0.unwrap();
    }
    assert_eq!(manager.active_count(), 3);

    let sweep = PersistentValve::spawn_expiry_sweep(Arc::clone(&valve), Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(manager.active_count(), 3, "fresh sessions must survive the sweep");

    clock.advance(chrono::Duration::seconds(1801));
    tokio::time::timeout(Duration::from_secs(1), async {
        while manager.active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    sweep.cancel();

    assert_eq!(valve.stats().reaped, 3);
}

#[tokio::test]
async fn test_rekeyed_session_is_stored_under_new_id() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "old-id").await;
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        bump_hits: true,
        rekey: true,
        ..Default::default()
    });
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    let mut request = Request::new("/login").with_session_id("old-id");
    let mut response = Response::new();
    valve.invoke(&mut request, &mut response).await.unwrap();

    let new_id = request.resolved_session_id().unwrap().to_string();
    assert_ne!(new_id, "old-id");
    assert!(!store.inner.contains("old-id"));
    assert_eq!(store.len().await.unwrap(), 1);

    let stored = store.inner.load(&new_id).await.unwrap().unwrap();
    assert_eq!(stored.id(), new_id);
    assert_eq!(stored.attribute("hits"), Some(&serde_json::json!(1)));
    assert_eq!(manager.active_count(), 0);
    assert!(valve.registry().is_empty());
}

#[tokio::test]
async fn test_new_sessions_persisted_only_when_enabled() {
    for persist_new_sessions in [false, true] {
        let store = Arc::new(CountingStore::default());
        let manager = manager_over(&store);
        let stage = Arc::new(ScriptedStage {
            manager: Some(Arc::clone(&manager)),
            create_session: true,
            ..Default::default()
        });
        let config = ValveConfig {
            persist_new_sessions,
            ..Default::default()
        };
        let valve = build_valve(config, &manager, stage.clone());

        let mut request = Request::new("/signup");
        let mut response = Response::new();
        valve.invoke(&mut request, &mut response).await.unwrap();

        let new_id = request.resolved_session_id().unwrap().to_string();
        assert_eq!(store.inner.contains(&new_id), persist_new_sessions);
        assert_eq!(manager.active_count(), usize::from(!persist_new_sessions));
        assert!(valve.registry().is_empty());
    }
}

#[tokio::test]
async fn test_dropped_request_releases_lock() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "s1").await;
    let manager = manager_over(&store);
    let stage = Arc::new(GateStage::default());
    let valve = build_valve(ValveConfig::default(), &manager, stage.clone());

    let holder = tokio::spawn({
        let valve = Arc::clone(&valve);
        async move { send(&valve, Request::new("/a").with_session_id("s1")).await }
    });
    stage.entered.notified().await;
    assert_eq!(valve.registry().usage("s1"), Some(1));

    holder.abort();
    assert!(holder.await.unwrap_err().is_cancelled());
    assert!(valve.registry().is_empty());

    // A later request gets the session without waiting on the aborted one
    let follower = tokio::spawn({
        let valve = Arc::clone(&valve);
        async move { send(&valve, Request::new("/b").with_session_id("s1")).await }
    });
    stage.entered.notified().await;
    stage.release.notify_one();
    let (result, _) = tokio::time::timeout(Duration::from_secs(1), follower)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(valve.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_are_not_lost() {
    let store = Arc::new(CountingStore::default());
    seed(&store, "shared").await;
    let manager = manager_over(&store);
    let stage = Arc::new(ScriptedStage {
        manager: Some(Arc::clone(&manager)),
        bump_hits: true,
        hold: Duration::from_millis(1),
        ..Default::default()
    });
    let config = ValveConfig {
        lock_fairness: false,
        ..Default::default()
    };
    let valve = build_valve(config, &manager, stage.clone());

    let requests: Vec<_> = (0..40)
        .map(|_| {
            let valve = Arc::clone(&valve);
            tokio::spawn(async move { send(&valve, Request::new("/x").with_session_id("shared")).await.0 })
        })
        .collect();
    for request in requests {
        request.await.unwrap().unwrap();
    }

    let stored = store.inner.load("shared").await.unwrap().unwrap();
    assert_eq!(stored.attribute("hits"), Some(&serde_json::json!(40)));
    assert!(valve.registry().is_empty());
    assert_eq!(manager.active_count(), 0);
}
