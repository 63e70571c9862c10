//! Compute node entry point.
//!
//! Loads configuration, binds the bus, announces the node to the arbiter,
//! and drives the simulation tick loop. The HTTP transport is an embedding
//! concern: it calls [`Application::dispatch`] with a route name and a
//! JSON body and renders the [`starweave_api::ApiResponse`] it gets back.

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

mod game;
mod persistence;
mod query;
mod routes;
mod ship;

use game::GameNode;
use persistence::ShipStore;
use ship::GameClock;

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
    /// Address this node is reachable at (must be an IP, not a hostname)
    pub client_host: String,
    /// Port the embedding HTTP transport should bind
    pub client_port: u16,
    /// Bus address of the arbiter
    pub arbiter_addr: String,
    /// Half extent of the universe square; must match the arbiter's
    pub universe_half_extent: f64,
    /// Tick period, milliseconds
    pub tick_interval_ms: u64,
    /// How often to re-announce ourselves to the arbiter, milliseconds
    pub heartbeat_interval_ms: u64,
    /// Document store address for ship hand-off, e.g. "127.0.0.1:9200".
    /// Empty disables persistence.
    pub store_addr: String,
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
                bus_port: 3001,
                client_host: "127.0.0.1".to_string(),
                client_port: 8001,
                arbiter_addr: "127.0.0.1:3000".to_string(),
                universe_half_extent: (1u64 << 31) as f64,
                tick_interval_ms: 100,
                heartbeat_interval_ms: 2_000,
                store_addr: String::new(),
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
        if self.server.client_host.parse::<std::net::IpAddr>().is_err() {
            return Err(format!(
                "client_host must be an IP address, got: {}",
                self.server.client_host
            ));
        }
        if self.server.arbiter_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "arbiter_addr must be ip:port, got: {}",
                self.server.arbiter_addr
            ));
        }
        if self.server.universe_half_extent <= 0.0 {
            return Err("universe_half_extent must be positive".to_string());
        }
        if self.server.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be positive".to_string());
        }
        if self.server.heartbeat_interval_ms < self.server.tick_interval_ms {
            return Err("heartbeat_interval_ms must be at least one tick".to_string());
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

    /// The URL the arbiter redirects clients to for this node.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}/", self.server.client_host, self.server.client_port)
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
    pub arbiter_addr: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    /// Parse command line arguments
    pub fn parse() -> Self {
        let matches = Command::new("Starweave Node")
            .version(option_env!("CARGO_PKG_VERSION").unwrap_or("UNK"))
            .about("Compute node for the Starweave arena")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("node_config.toml"),
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
                Arg::new("arbiter")
                    .short('a')
                    .long("arbiter")
                    .value_name("ADDR")
                    .help("Bus address of the arbiter (ip:port)"),
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
            arbiter_addr: matches.get_one::<String>("arbiter").cloned(),
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

/// The running compute node process: bus, tick task, and the shared state
/// the HTTP transport dispatches into.
pub struct Application {
    config: AppConfig,
    bus: Arc<BusNode>,
    node: Arc<Mutex<GameNode>>,
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
        if let Some(arbiter_addr) = args.arbiter_addr {
            config.server.arbiter_addr = arbiter_addr;
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
        let arbiter = bus.connect(config.server.arbiter_addr.parse()?);

        let store = if config.server.store_addr.is_empty() {
            None
        } else {
            Some(ShipStore::new(config.server.store_addr.clone()))
        };

        let node = GameNode::new(
            bus.clone(),
            arbiter,
            config.api_url(),
            std::net::SocketAddr::new(config.server.client_host.parse()?, config.server.bus_port),
            config.server.universe_half_extent,
            store,
            GameClock::monotonic(),
        )?;
        let node = Arc::new(Mutex::new(node));

        info!("🚀 Starweave Node v{}", env!("CARGO_PKG_VERSION"));
        info!(
            "📂 Config: {} | Bus: udp/{} | Clients: {}:{} | Arbiter: {}",
            args.config_path.display(),
            config.server.bus_port,
            config.server.client_host,
            config.server.client_port,
            config.server.arbiter_addr
        );
        if config.server.store_addr.is_empty() {
            info!("📦 Ship persistence disabled");
        } else {
            info!("📦 Ship persistence at {}", config.server.store_addr);
        }

        Ok(Self { config, bus, node })
    }

    /// Routes one client request into the node under the coarse lock.
    pub async fn dispatch(&self, route: &str, body: serde_json::Value) -> ApiResponse {
        let mut node = self.node.lock().await;
        routes::TABLE.dispatch(&mut node, route, body).await
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting node tick loop");
        info!(
            "  🌌 Universe half extent: {}",
            self.config.server.universe_half_extent
        );
        info!(
            "  ⏱ Tick: {}ms | Heartbeat: {}ms",
            self.config.server.tick_interval_ms, self.config.server.heartbeat_interval_ms
        );

        self.node.lock().await.announce().await?;
        info!("📣 Announced to the arbiter, awaiting placement");

        let tick_handle = {
            let node = self.node.clone();
            let tick = Duration::from_millis(self.config.server.tick_interval_ms);
            let ticks_per_heartbeat = (self.config.server.heartbeat_interval_ms
                / self.config.server.tick_interval_ms)
                .max(1);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                let mut ticks: u64 = 0;
                loop {
                    interval.tick().await;
                    let mut node = node.lock().await;
                    node.tick().await;
                    ticks += 1;
                    if ticks % ticks_per_heartbeat == 0 {
                        node.heartbeat().await;
                    }
                }
            })
        };

        info!("✅ Node is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        setup_signal_handlers().await?;

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        tick_handle.abort();

        // Hand every ship back before going dark.
        {
            let mut node = self.node.lock().await;
            node.garbage_collect_all().await;
        }
        self.bus.shutdown();

        let node = self.node.lock().await;
        info!("📊 Final Statistics:");
        info!("  - Ships held: {}", node.ship_count());
        if let Some(path) = node.path() {
            info!("  - Tree position: {}", path);
        }
        info!("✅ Node shutdown complete");

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
            eprintln!("❌ Failed to start node: {:?}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
