//! Concurrent workload driver for `svalve simulate`.
//!
//! Seeds the store with a few sessions, then fires overlapping requests at
//! them through a [`PersistentValve`]. Each request that gets its session bumps
//! a counter attribute; afterwards the stored counters must equal the number
//! of requests served per session, otherwise an update was lost.

use super::config::AppConfig;
use crate::pipeline::{PipelineError, Request, Response, Stage};
use crate::session::{PersistentManager, Session, SessionManager, SessionStore};
use crate::valve::{PersistentValve, ValveStatsSnapshot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Session attribute incremented by every served request
pub const HITS_ATTRIBUTE: &str = "hits";

/// Downstream stage standing in for an application
struct CounterStage {
    manager: Arc<dyn SessionManager>,
    max_hold: Duration,
    served: DashMap<String, u64>,
}

#[async_trait]
impl Stage for CounterStage {
    async fn process(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), PipelineError> {
        let Some(id) = request.resolved_session_id().map(str::to_owned) else {
            response.write("static");
            return Ok(());
        };
        let Some(shared) = self.manager.find(&id) else {
            response.send_error(404, "Unknown session");
            return Ok(());
        };

        let hold = if self.max_hold.is_zero() {
            Duration::ZERO
        } else {
            let millis = self.max_hold.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(0..=millis))
        };

        let mut session = shared.write().await;
        let hits = session
            .attribute(HITS_ATTRIBUTE)
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        // Read-modify-write with a pause in the middle: without the valve's
        // lock, overlapping requests would lose increments here.
        tokio::time::sleep(hold).await;
        session.set_attribute(HITS_ATTRIBUTE, serde_json::json!(hits + 1));

        *self.served.entry(id).or_insert(0) += 1;
        response.write("ok");
        Ok(())
    }

    fn stage_name(&self) -> &'static str {
        "counter"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyReport {
    pub session_id: String,
    pub served: u64,
    pub stored_hits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub stats: ValveStatsSnapshot,
    pub keys: Vec<KeyReport>,
    pub elapsed_ms: u128,
    pub rejected_responses: u64,
}

impl SimulationReport {
    /// Sessions whose stored counter disagrees with the requests served
    pub fn lost_updates(&self) -> u64 {
        self.keys
            .iter()
            .map(|key| key.served.abs_diff(key.stored_hits))
            .sum()
    }
}

/// Run the configured workload against `store`
pub async fn run_simulation(config: &AppConfig, store: Arc<dyn SessionStore>) -> Result<SimulationReport> {
    let sim = &config.simulation;
    if sim.keys == 0 {
        anyhow::bail!("simulation needs at least one session key");
    }

    let now = chrono::Utc::now();
    let session_ids: Vec<String> = (0..sim.keys).map(|k| format!("sim-{}", k)).collect();
    for id in &session_ids {
        let mut session = Session::new(id.clone(), config.store.max_inactive_interval, now);
        session.set_attribute(HITS_ATTRIBUTE, serde_json::json!(0));
        store
            .save(&session)
            .await
            .with_context(|| format!("Failed to seed session {}", id))?;
    }
    info!("Seeded {} sessions in {} store", session_ids.len(), store.store_type());

    let manager: Arc<dyn SessionManager> = Arc::new(PersistentManager::new(Arc::clone(&store)));
    let stage = Arc::new(CounterStage {
        manager: Arc::clone(&manager),
        max_hold: Duration::from_millis(sim.hold_ms),
        served: DashMap::new(),
    });
    let valve = Arc::new(PersistentValve::new(
        config.valve.clone(),
        manager,
        Arc::clone(&stage) as Arc<dyn Stage>,
    ));

    let sweep = config
        .valve
        .expiry_sweep_interval()
        .map(|period| PersistentValve::spawn_expiry_sweep(Arc::clone(&valve), period));

    let started = Instant::now();
    let clients = (0..sim.clients).map(|client| {
        let valve = Arc::clone(&valve);
        let session_ids = session_ids.clone();
        let requests = sim.requests_per_client;
        let static_every = sim.static_every;
        tokio::spawn(async move {
            let mut rejected = 0u64;
            for n in 0..requests {
                let mut request = if static_every > 0 && (n + 1) % static_every == 0 {
                    Request::new("/static/logo.png")
                } else {
                    let key = rand::rng().random_range(0..session_ids.len());
                    Request::new("/app/cart").with_session_id(session_ids[key].clone())
                };
                let mut response = Response::new();

                if let Err(e) = valve.invoke(&mut request, &mut response).await {
                    warn!("Client {} request {} failed: {}", client, n, e);
                }
                if response.is_committed() && response.status() == valve.config().rejection_status {
                    rejected += 1;
                }
            }
            debug!("Client {} finished", client);
            rejected
        })
    });

    let mut rejected_responses = 0;
    for result in futures::future::join_all(clients).await {
        rejected_responses += result.context("Simulation client panicked")?;
    }
    let elapsed = started.elapsed();

    if let Some(sweep) = sweep {
        sweep.cancel();
    }
    let leftover = valve.process_expires();
    if leftover > 0 {
        warn!("Reaped {} expired sessions left behind by the run", leftover);
    }

    let mut keys = Vec::with_capacity(session_ids.len());
    for id in session_ids {
        let stored_hits = store
            .load(&id)
            .await?
            .and_then(|session| session.attribute(HITS_ATTRIBUTE).and_then(|v| v.as_u64()))
            .unwrap_or(0);
        let served = stage.served.get(&id).map(|entry| *entry).unwrap_or(0);
        keys.push(KeyReport {
            session_id: id,
            served,
            stored_hits,
        });
    }

    Ok(SimulationReport {
        stats: valve.stats(),
        keys,
        elapsed_ms: elapsed.as_millis(),
        rejected_responses,
    })
}
