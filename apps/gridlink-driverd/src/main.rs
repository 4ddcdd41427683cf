use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use gridlink_driver::stats::{StatisticsView, NODES, PEERS};
use gridlink_driver::Driver;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::{debug, error, info, warn};

mod config;

use crate::config::DriverdConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML, YAML, JSON or .env)
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the driver (default)
    Run,
    /// Print the effective configuration as JSON and exit
    ShowConfig,
}

fn log_topology(driver: &Driver) {
    let report = driver.topology();
    let stats = driver.statistics();
    info!(
        "topology: discovered_peers={} peer_channels={} nodes={} peers={} single_peer={}",
        report.peers.len(),
        report.peer_channel_count(),
        stats.latest(NODES).unwrap_or(0.0),
        stats.latest(PEERS).unwrap_or(0.0),
        driver.verify_single_peer()
    );
    match report.to_json() {
        Ok(json) => debug!("topology report: {json}"),
        Err(err) => warn!("cannot encode topology report: {err}"),
    }
    let m = driver.discovery().metrics_snapshot();
    debug!(
        "discovery metrics: discovered={} duplicates={} attempts={} ok={} err={} disconnects={}",
        m.discovered, m.duplicates, m.connect_attempts, m.connect_ok, m.connect_err, m.disconnects
    );
}

fn main() {
    let filter = std::env::var("GRIDLINK_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match DriverdConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    if let Some(Commands::ShowConfig) = cli.command {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                error!("failed to render config: {err}");
                std::process::exit(1);
            }
        }
        return;
    }

    let settings = match config.to_settings() {
        Ok(settings) => settings,
        Err(err) => {
            error!("invalid config: {err}");
            std::process::exit(1);
        }
    };

    let mut driver = match Driver::start(settings) {
        Ok(driver) => driver,
        Err(err) => {
            error!("failed to start driver: {err}");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = flag::register(SIGTERM, Arc::clone(&shutdown));
    let _ = flag::register(SIGINT, Arc::clone(&shutdown));

    info!(
        "driver '{}' running; admission policy '{}'",
        driver.name(),
        driver.admission().default_policy()
    );
    let mut next_report = Instant::now() + config.report_interval;
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
        if Instant::now() >= next_report {
            log_topology(&driver);
            next_report = Instant::now() + config.report_interval;
        }
    }

    info!("shutdown requested");
    log_topology(&driver);
    driver.shutdown();
}
