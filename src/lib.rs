//! # Session Valve
//!
//! A request pipeline stage that gives each session a single writer. Before a
//! request is processed its session is loaded from an external store into the
//! active working set; afterwards the session is written back and evicted.
//! Requests that share a session id are serialized by a per-id lock for the
//! whole cycle.
//!
//! ## Architecture Overview
//!
//! - **[`lock`]**: Per-key permits and the reference-counted registry that owns them
//! - **[`session`]**: Session model, staleness policy, stores and the session manager
//! - **[`pipeline`]**: Request/response types and the [`Stage`](pipeline::Stage) trait
//! - **[`valve`]**: The lifecycle coordinator, its configuration and counters
//! - **[`cli`]**: Configuration discovery and the workload simulator behind `svalve`
//!
//! The lock only covers one process. Deployments with several instances must
//! route concurrent requests for one session to a single instance.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use session_valve::pipeline::{PipelineError, Request, Response, Stage};
//! use session_valve::session::{MemoryStore, PersistentManager};
//! use session_valve::valve::{PersistentValve, ValveConfig};
//! use std::sync::Arc;
//!
//! struct App;
//!
//! #[async_trait::async_trait]
//! impl Stage for App {
//!     async fn process(&self, _: &mut Request, response: &mut Response) -> Result<(), PipelineError> {
//!         response.write("hello");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = Arc::new(PersistentManager::new(Arc::new(MemoryStore::new())));
//!     let valve = PersistentValve::new(ValveConfig::default(), manager, Arc::new(App));
//!
//!     let mut request = Request::new("/cart").with_session_id("abc");
//!     let mut response = Response::new();
//!     valve.invoke(&mut request, &mut response).await?;
//!     Ok(())
//! }
//! ```

/// Per-session mutual exclusion.
///
/// [`KeyedLock`](lock::KeyedLock) is a one-permit lock with fair or barging
/// hand-off; [`LockRegistry`](lock::LockRegistry) creates locks on demand and
/// drops them when the last request for a key lets go.
pub mod lock;

/// Sessions and where they live.
pub mod session;

/// Request pipeline surface.
pub mod pipeline;

/// The per-request load, process, persist, release cycle.
pub mod valve;

/// Environment constants and path utilities.
pub mod env;

/// Configuration discovery and the `svalve` command line.
pub mod cli;

pub use lock::{ContentionPolicy, KeyedLock, LockHandle, LockRegistry, NotAcquired};
pub use pipeline::{PipelineError, Request, Response, Stage};
pub use session::{
    FileStore, MemoryStore, PersistentManager, Session, SessionManager, SessionStore, StoreError,
};
pub use valve::{PersistentValve, RejectionHandler, ValveConfig, ValveStatsSnapshot};
