use anyhow::Context;
use session_valve::cli::{
    AppConfig, Args, ConfigDiscovery, ExecutionMode, SimulateOptions, SimulationReport, StoreKind,
    run_simulation,
};
use session_valve::valve::BypassFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_filter = if args.verbose {
        "session_valve=debug"
    } else {
        "session_valve=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match mode {
        ExecutionMode::Simulate(options) => run_simulate_mode(options).await,
        ExecutionMode::CheckConfig(path) => run_check_config(&path),
        ExecutionMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            Ok(())
        }
    }
}

async fn run_simulate_mode(options: SimulateOptions) -> anyhow::Result<()> {
    let mut config = match &options.config_override {
        Some(path) => {
            info!("Loading configuration override from: {:?}", path);
            AppConfig::from_toml_file(path)?
        }
        None => ConfigDiscovery::discover_config()?,
    };

    if let Some(clients) = options.clients {
        config.simulation.clients = clients;
    }
    if let Some(requests) = options.requests {
        config.simulation.requests_per_client = requests;
    }
    if let Some(keys) = options.keys {
        config.simulation.keys = keys;
    }
    if let Some(hold_ms) = options.hold_ms {
        config.simulation.hold_ms = hold_ms;
    }
    if let Some(kind) = options.store {
        config.store.kind = kind;
    }
    if let Some(directory) = options.directory {
        config.store.directory = Some(directory);
    }
    if options.reject_on_contention {
        config.valve.block_on_contention = false;
    }

    let root = std::env::current_dir().context("Failed to resolve working directory")?;
    let store = config.store.open(&root)?;

    info!(
        "Simulating {} clients x {} requests over {} sessions",
        config.simulation.clients, config.simulation.requests_per_client, config.simulation.keys
    );
    let report = run_simulation(&config, store).await?;
    print_report(&report, config.store.kind);

    if report.lost_updates() > 0 {
        error!("Detected {} lost session updates", report.lost_updates());
        std::process::exit(2);
    }
    Ok(())
}

fn print_report(report: &SimulationReport, kind: StoreKind) {
    let stats = &report.stats;

    println!("Simulation finished in {}ms ({:?} store)", report.elapsed_ms, kind);
    println!(
        "  requests: {}  bypassed: {}  rejected: {}",
        stats.requests, stats.bypassed, stats.rejected
    );
    println!(
        "  loaded: {}  expired on load: {}  load failures: {}",
        stats.loaded, stats.expired_on_load, stats.load_failures
    );
    println!(
        "  persisted: {}  skipped: {}  persist failures: {}",
        stats.persisted, stats.persist_skipped, stats.persist_failures
    );
    println!();
    for key in &report.keys {
        let marker = if key.served == key.stored_hits { "ok" } else { "LOST" };
        println!(
            "  {:<8} served {:>5}  stored {:>5}  {}",
            key.session_id, key.served, key.stored_hits, marker
        );
    }
}

fn run_check_config(path: &std::path::Path) -> anyhow::Result<()> {
    let config = AppConfig::from_toml_file(path)?;
    let valve = &config.valve;

    println!("Configuration: {}", path.display());
    println!("  contention policy: {:?}", valve.contention_policy());
    println!("  lock fairness: {}", valve.lock_fairness);
    println!("  rejection status: {}", valve.rejection_status);
    println!("  persist new sessions: {}", valve.persist_new_sessions);

    match BypassFilter::compile(valve.bypass_filter.as_deref()) {
        Ok(Some(filter)) => println!("  bypass filter: {}", filter.as_str()),
        Ok(None) => println!("  bypass filter: none"),
        Err(e) => {
            println!("  bypass filter: DISABLED ({})", e);
            std::process::exit(1);
        }
    }

    println!("  store: {:?}", config.store.kind);
    Ok(())
}
