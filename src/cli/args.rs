//! Command line argument parsing
//!
//! Subcommands:
//! - `simulate`: Drive concurrent requests through a valve and check for lost updates
//! - `check-config`: Validate a configuration file
//! - `show-config`: Show configuration discovery information

use super::config::StoreKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Simulate(SimulateOptions),
    CheckConfig(PathBuf),
    ShowConfig,
}

/// Overrides for the simulation, applied on top of the loaded configuration
#[derive(Debug, Default)]
pub struct SimulateOptions {
    pub config_override: Option<PathBuf>,
    pub clients: Option<usize>,
    pub requests: Option<usize>,
    pub keys: Option<usize>,
    pub hold_ms: Option<u64>,
    pub store: Option<StoreKind>,
    pub directory: Option<PathBuf>,
    pub reject_on_contention: bool,
}

#[derive(Debug, Parser)]
#[command(name = "svalve")]
#[command(author = "Session Valve Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Per-session request serialization with load/save around each request")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Enable debug logging
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a concurrent workload through the valve
    Simulate {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Number of concurrent clients
        #[arg(long = "clients")]
        clients: Option<usize>,
        /// Requests sent by each client
        #[arg(long = "requests")]
        requests: Option<usize>,
        /// Number of distinct sessions
        #[arg(long = "keys")]
        keys: Option<usize>,
        /// Maximum time a request works on its session, in milliseconds
        #[arg(long = "hold-ms")]
        hold_ms: Option<u64>,
        /// Session store backend
        #[arg(long = "store", value_enum)]
        store: Option<StoreKind>,
        /// Directory for the file store
        #[arg(long = "dir")]
        directory: Option<PathBuf>,
        /// Reject contended requests instead of waiting
        #[arg(long = "reject")]
        reject: bool,
    },
    /// Validate a configuration file
    CheckConfig {
        /// Path to the configuration file
        file: PathBuf,
    },
    /// Show configuration discovery information
    ShowConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Simulate {
                config,
                clients,
                requests,
                keys,
                hold_ms,
                store,
                directory,
                reject,
            }) => Ok(ExecutionMode::Simulate(SimulateOptions {
                config_override: config.clone(),
                clients: *clients,
                requests: *requests,
                keys: *keys,
                hold_ms: *hold_ms,
                store: *store,
                directory: directory.clone(),
                reject_on_contention: *reject,
            })),
            Some(Commands::CheckConfig { file }) => Ok(ExecutionMode::CheckConfig(file.clone())),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            None => Err(
                "No command specified. Use 'svalve --help' to see available commands.".to_string(),
            ),
        }
    }
}
