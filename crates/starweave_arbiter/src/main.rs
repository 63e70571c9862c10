//! Arbiter entry point.
//!
//! Loads configuration, binds the bus, and drives the arbiter's tick loop.
//! The HTTP transport is an embedding concern: it calls
//! [`Application::dispatch`] with a route name and a JSON body and renders
//! the [`starweave_api::ApiResponse`] it gets back.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, Command};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use starweave_api::ApiResponse;
use starweave_bus::BusNode;

mod arbiter;
mod routes;
mod routing;

use arbiter::Arbiter;

// ============================================================================
// Configuration
// ============================================================================

/// Application configuration loaded from TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// UDP port the bus binds on
    pub bus_port: u16,
    /// Host the embedding HTTP transport should bind
    pub client_host: String,
    /// Port the embedding HTTP transport should bind
    pub client_port: u16,
    /// Half extent of the universe square
    pub universe_half_extent: f64,
    /// Tick period, milliseconds
    pub tick_interval_ms: u64,
    /// Silence after which a compute node is considered gone, milliseconds
    pub peer_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter
    pub level: String,
    /// JSON formatting
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bus_port: 3000,
                client_host: "localhost".to_string(),
                client_port: 8000,
                universe_half_extent: (1u64 << 31) as f64,
                tick_interval_ms: 100,
                peer_timeout_ms: 10_000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from file, writing the defaults when it is absent
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.bus_port == 0 {
            return Err("bus_port must be nonzero".to_string());
        }
        if self.server.client_host.is_empty() {
            return Err("client_host cannot be empty".to_string());
        }
        if self.server.universe_half_extent <= 0.0 {
            return Err("universe_half_extent must be positive".to_string());
        }
        if self.server.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be positive".to_string());
        }
        if self.server.peer_timeout_ms < self.server.tick_interval_ms {
            return Err("peer_timeout_ms must be at least one tick".to_string());
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CLI Interface
// ============================================================================

/// Command line arguments
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub bus_port: Option<u16>,
    pub client_port: Option<u16>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    /// Parse command line arguments
    pub fn parse() -> Self {
        let matches = Command::new("Starweave Arbiter")
            .version(option_env!("CARGO_PKG_VERSION").unwrap_or("UNK"))
            .about("Partition-tree arbiter for the Starweave arena")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("arbiter_config.toml"),
            )
            .arg(
                Arg::new("bus-port")
                    .short('b')
                    .long("bus-port")
                    .value_name("PORT")
                    .help("UDP port the message bus binds on"),
            )
            .arg(
                Arg::new("client-port")
                    .short('p')
                    .long("client-port")
                    .value_name("PORT")
                    .help("Port for the client-facing HTTP transport"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .get_matches();

        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .expect("Default config path should always be set"),
            ),
            bus_port: matches
                .get_one::<String>("bus-port")
                .and_then(|p| p.parse().ok()),
            client_port: matches
                .get_one::<String>("client-port")
                .and_then(|p| p.parse().ok()),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

// ============================================================================
// Logging Setup
// ============================================================================

/// Initialize logging system
fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

// ============================================================================
// Signal Handling
// ============================================================================

/// Setup graceful shutdown signal handling
async fn setup_signal_handlers() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("📡 Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}

// ============================================================================
// Application
// ============================================================================

/// The running arbiter process: bus, tick task, and the shared state the
/// HTTP transport dispatches into.
pub struct Application {
    config: AppConfig,
    bus: Arc<BusNode>,
    arbiter: Arc<Mutex<Arbiter>>,
}

impl Application {
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        // Apply CLI overrides
        if let Some(bus_port) = args.bus_port {
            config.server.bus_port = bus_port;
        }
        if let Some(client_port) = args.client_port {
            config.server.client_port = client_port;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {}", e).into());
        }

        setup_logging(&config.logging, args.json_logs)?;

        let bus_addr = format!("0.0.0.0:{}", config.server.bus_port).parse()?;
        let bus = Arc::new(BusNode::bind(bus_addr).await?);
        let arbiter = Arc::new(Mutex::new(Arbiter::new(
            bus.clone(),
            config.server.universe_half_extent,
            Duration::from_millis(config.server.peer_timeout_ms),
        )));

        info!("🚀 Starweave Arbiter v{}", env!("CARGO_PKG_VERSION"));
        info!(
            "📂 Config: {} | Bus: udp/{} | Clients: {}:{}",
            args.config_path.display(),
            config.server.bus_port,
            config.server.client_host,
            config.server.client_port
        );

        Ok(Self {
            config,
            bus,
            arbiter,
        })
    }

    /// Routes one client request into the arbiter under the coarse lock.
    pub async fn dispatch(&self, route: &str, body: serde_json::Value) -> ApiResponse {
        let mut arb = self.arbiter.lock().await;
        routes::TABLE.dispatch(&mut arb, route, body).await
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting arbiter tick loop");
        info!("  🌌 Universe half extent: {}", self.config.server.universe_half_extent);
        info!("  ⏱ Tick: {}ms | Peer timeout: {}ms",
            self.config.server.tick_interval_ms,
            self.config.server.peer_timeout_ms
        );

        let tick_handle = {
            let arbiter = self.arbiter.clone();
            let tick = Duration::from_millis(self.config.server.tick_interval_ms);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    interval.tick().await;
                    arbiter.lock().await.tick().await;
                }
            })
        };

        info!("✅ Arbiter is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        setup_signal_handlers().await?;

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        tick_handle.abort();
        self.bus.shutdown();

        let arb = self.arbiter.lock().await;
        info!("📊 Final Statistics:");
        info!("  - Compute nodes: {}", arb.routing().node_count());
        info!("  - Ships routed: {}", arb.routing().ship_count());
        info!("✅ Arbiter shutdown complete");

        Ok(())
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start arbiter: {:?}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
