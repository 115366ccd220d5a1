//! TetherMQ - Multi-transport MQTT v3.1.1 broker
//!
//! Usage:
//!   tethermq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>   Configuration file path (TOML)
//!   -b, --bind <ADDR>     MQTT/TCP bind address (default: 0.0.0.0:1883)
//!   --ws-bind <ADDR>      MQTT/WebSocket bind address
//!   --admin-bind <ADDR>   Metrics and debug HTTP bind address
//!   -l, --log-level       Log level (error, warn, info, debug, trace)

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tethermq::broker::Broker;
use tethermq::config::Config;

/// Log level for the CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// TetherMQ - Multi-transport MQTT v3.1.1 broker
#[derive(Parser, Debug)]
#[command(name = "tethermq")]
#[command(version)]
#[command(about = "Multi-transport MQTT v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT/TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// MQTT/TLS bind address (requires certificates in the config file)
    #[arg(long)]
    tls_bind: Option<SocketAddr>,

    /// MQTT/WebSocket bind address
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Metrics and debug HTTP bind address
    #[arg(long)]
    admin_bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::from_env().unwrap_or_default()
    };

    // CLI overrides config, config overrides the default
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("loaded configuration from {:?}", path);
    }

    let mut broker_config = file_config.broker_config();
    if let Some(bind) = args.bind {
        broker_config.bind_addr = Some(bind);
    }
    if let Some(tls_bind) = args.tls_bind {
        broker_config.tls_bind_addr = Some(tls_bind);
    }
    if let Some(ws_bind) = args.ws_bind {
        broker_config.ws_bind_addr = Some(ws_bind);
    }
    if let Some(admin_bind) = args.admin_bind {
        broker_config.admin_bind_addr = Some(admin_bind);
    }

    let broker = Broker::new(broker_config);

    tokio::select! {
        result = broker.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("signal received, shutting down");
            broker.shutdown();
        }
    }

    Ok(())
}
