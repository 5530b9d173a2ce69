//! CLI-specific functionality for the session valve
//!
//! This module contains argument parsing, configuration discovery and the
//! simulation driver used by the `svalve` binary.

pub mod args;
pub mod config;
pub mod simulate;

pub use args::{Args, ExecutionMode, SimulateOptions};
pub use config::{AppConfig, ConfigDiscovery, SimulationConfig, StoreConfig, StoreKind};
pub use simulate::{KeyReport, SimulationReport, run_simulation};
