//! TideMQ - lightweight MQTT v3.1.1/v5.0 broker
//!
//! Usage:
//!   tidemq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -b, --bind <ADDR>          Bind address (default: 0.0.0.0:1883)
//!   --max-connections <N>      Maximum bound connections (default: 100)
//!   --max-packet-size <N>      Maximum packet size (default: 2048)
//!   --keep-alive <SECS>        Liveness timeout, 0 disables (default: 120)
//!   --workers <N>              Request worker count (default: 10)
//!   --admin-bind <ADDR>        Enable the HTTP admin surface on ADDR
//!   -l, --log-level <LEVEL>    Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tidemq::admin::{AdminApi, AdminServer};
use tidemq::broker::{Broker, BrokerConfig};
use tidemq::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// TideMQ - lightweight MQTT broker
#[derive(Parser, Debug)]
#[command(name = "tidemq")]
#[command(version)]
#[command(about = "Lightweight MQTT v3.1.1/v5.0 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum bound connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Keep alive in seconds (0 disables)
    #[arg(long)]
    keep_alive: Option<u64>,

    /// Request worker count
    #[arg(long)]
    workers: Option<usize>,

    /// HTTP admin bind address (enables the admin surface)
    #[arg(long)]
    admin_bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI values override file and environment values
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.server.ip = bind.ip();
            config.server.port = bind.port();
        }
        if let Some(n) = self.max_connections {
            config.limits.max_connections = n;
        }
        if let Some(n) = self.max_packet_size {
            config.limits.max_packet_size = n;
        }
        if let Some(secs) = self.keep_alive {
            config.session.keep_alive = secs;
        }
        if let Some(n) = self.workers {
            config.workers.pool_size = n;
        }
        if let Some(addr) = self.admin_bind {
            config.admin.enabled = true;
            config.admin.bind = addr;
        }
        if let Some(level) = self.log_level {
            config.log.level = level.as_str().to_string();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // RUST_LOG wins over --log-level and log.level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let broker_config = BrokerConfig::from(&config);
    info!("Starting TideMQ MQTT Broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Keep alive: {:?}", broker_config.keep_alive);
    if broker_config.workers.enabled {
        info!(
            "  Request workers: {} (queue {})",
            broker_config.workers.size, broker_config.workers.queue_capacity
        );
    } else {
        info!("  Request workers: disabled");
    }
    info!("  Fan-out workers: {}", broker_config.fanout.size);

    let broker = Broker::new(broker_config);
    match config.auth.verifier() {
        Some(verifier) => {
            info!("  Auth: static credentials for '{}'", config.auth.username);
            broker.set_connect_verifier(Arc::new(verifier));
        }
        None => info!("  Auth: disabled"),
    }

    if config.admin.enabled {
        info!("  Admin: enabled (http://{})", config.admin.bind);
        let server = AdminServer::new(AdminApi::new(broker.clone()), config.admin.bind);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Admin server error: {}", e);
            }
        });
    } else {
        info!("  Admin: disabled");
    }

    let server = broker.clone();
    let mut accept = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = &mut accept => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    broker.stop();
    accept.await??;
    info!("TideMQ stopped");
    Ok(())
}
