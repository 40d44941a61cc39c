use anyhow::{Context, Result};
use clap::Parser;
use kernel_health::alerts::build_sink;
use kernel_health::collectors::HostMetricSource;
use kernel_health::config::Config;
use kernel_health::error::ConfigError;
use kernel_health::feed::FeedServer;
use kernel_health::gate::StaticTokenGate;
use kernel_health::monitor::HealthMonitor;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;

/// How long open feed connections get to say goodbye on shutdown
const FEED_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command-line arguments for the kernel health monitor
#[derive(Parser)]
#[command(
    name = "kernel-health",
    about = "Real-time kernel health telemetry",
    long_about = "Samples host and kernel counters at a fixed interval, classifies them with \
                  hysteresis into normal, warning and critical, and streams the result to \
                  authorized viewers over a WebSocket feed."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Override the feed listen address
    #[arg(short, long, value_name = "ADDR", help = "Live feed listen address, e.g. 0.0.0.0:8765")]
    bind: Option<String>,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in load_config
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }
                if config_path.extension().is_some_and(|ext| ext != "toml") {
                    warn!(
                        "Configuration file does not have .toml extension: {}",
                        config_path.display()
                    );
                }
            }
        }

        if let Some(ref bind) = self.bind {
            bind.parse::<SocketAddr>()
                .map_err(|e| format!("Invalid bind address '{}': {}", bind, e))?;
        }

        Ok(())
    }

    /// Convert config path to string safely, handling non-UTF-8 paths
    fn config_path_str(&self) -> Result<Option<&str>, String> {
        match &self.config {
            Some(path) => match path.to_str() {
                Some(path_str) => Ok(Some(path_str)),
                None => Err(format!(
                    "Configuration file path contains invalid UTF-8 characters: {}",
                    path.display()
                )),
            },
            None => Ok(None),
        }
    }

    /// Apply command-line overrides on top of the loaded configuration
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref bind) = self.bind {
            info!("Feed bind address overridden to {}", bind);
            config.feed.bind = bind.clone();
        }
    }
}

/// Load configuration from file or use defaults
///
/// A missing or unreadable file falls back to defaults with a warning. A file
/// that exists but does not parse or validate is an error.
fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            match Config::from_file(std::path::Path::new(path)) {
                Ok(config) => Ok(config),
                Err(ConfigError::ReadError(reason)) => {
                    warn!("Configuration file unreadable ({}), using defaults", reason);
                    Ok(Config::default())
                }
                Err(e) => {
                    error!("Configuration error in '{}': {}", path, e);
                    Err(e)
                }
            }
        }
        None => {
            info!("Using default configuration");
            Ok(Config::default())
        }
    }
}

/// Block until the signal handler asks for shutdown
fn wait_for_shutdown(receiver: &Receiver<()>) {
    info!("Waiting for shutdown signal...");
    match receiver.recv() {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Error waiting for shutdown: {}", e),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting kernel health monitor");

    cli.validate().map_err(anyhow::Error::msg)?;
    let config_path = cli.config_path_str().map_err(anyhow::Error::msg)?;
    let mut config = load_config(config_path).context("Failed to load configuration")?;
    cli.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;

    let gate = StaticTokenGate::from_config(&config.auth);
    if gate.is_empty() {
        warn!("No session tokens configured, every feed client will be rejected");
    }
    let log_sink = build_sink(&config.log_sink).context("Failed to open log sink")?;

    let mut monitor = HealthMonitor::new(
        config.clone(),
        Box::new(HostMetricSource::new()),
        Arc::new(gate),
        log_sink,
    );

    let (shutdown_sender, shutdown_receiver) = mpsc::channel();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down gracefully...");
        if let Err(e) = shutdown_sender.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    })
    .context("Error setting interrupt handler")?;

    monitor.start().context("Failed to start health monitor")?;

    let runtime = Runtime::new().context("Failed to create async runtime")?;
    let (feed_shutdown, feed_shutdown_receiver) = watch::channel(false);
    let feed_task = if config.feed.enabled {
        let addr = config.feed.bind_addr()?;
        let listener = runtime
            .block_on(TcpListener::bind(addr))
            .with_context(|| format!("Failed to bind live feed to {}", addr))?;
        let server = FeedServer::new(monitor.hub(), monitor.host_info().clone(), &config.feed);
        Some(runtime.spawn(server.run(listener, feed_shutdown_receiver)))
    } else {
        info!("Live feed disabled");
        None
    };

    info!("Kernel health monitor is running. Press Ctrl+C to stop.");
    wait_for_shutdown(&shutdown_receiver);

    // Stop accepting first, then closing the hub ends the open connections
    let _ = feed_shutdown.send(true);
    monitor.stop();

    if let Some(task) = feed_task {
        match runtime.block_on(tokio::time::timeout(FEED_SHUTDOWN_GRACE, task)) {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("Live feed failed: {}", e),
            Ok(Err(e)) => error!("Live feed task panicked: {}", e),
            Err(_) => warn!("Live feed did not stop within {:?}", FEED_SHUTDOWN_GRACE),
        }
    }
    runtime.shutdown_timeout(FEED_SHUTDOWN_GRACE);

    info!("Kernel health monitor shutdown complete");
    Ok(())
}
