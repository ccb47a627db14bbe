//! Statecast - event-to-MQTT bridge over a private overlay network
//!
//! Usage:
//!   statecast [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -e, --event <FILE>     Inbound event JSON (default: stdin)
//!   --host <HOST>          Broker host (overrides config)
//!   --topic <TOPIC>        Topic to publish on (overrides config)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use statecast::config::Config;
use statecast::event::InboundEvent;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
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

/// Statecast - pipeline event to MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "statecast")]
#[command(author = "Statecast Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Republishes pipeline state-change events on an MQTT topic over a private overlay network")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Inbound event JSON file (reads stdin when absent or "-")
    #[arg(short, long)]
    event: Option<PathBuf>,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Topic to publish on
    #[arg(long)]
    topic: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Load configuration file if specified, otherwise env-only defaults
    let mut config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => match Config::from_env() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading configuration: {}", e);
                std::process::exit(1);
            }
        },
    };

    // CLI args override file config
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(topic) = args.topic {
        config.broker.topic = topic;
    }

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error installing log subscriber: {}", e);
        std::process::exit(1);
    }

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let event = match read_event(args.event.as_deref()) {
        Ok(event) => event,
        Err(e) => {
            error!(stage = "event", error = %e, "invocation failed");
            std::process::exit(1);
        }
    };

    info!(
        broker = %config.broker.host,
        topic = %config.broker.topic,
        overlay = config.overlay.enabled,
        "Starting Statecast bridge"
    );

    // Top-level error boundary: every failure logs stage and reason,
    // then the process exits non-zero for the invoking platform.
    match statecast::driver::run(&config, event).await {
        Ok(delivery) => {
            info!(
                topic = %delivery.topic,
                subject = %delivery.subject,
                state = %delivery.state,
                attempts = delivery.attempts,
                "Delivered"
            );
        }
        Err(e) => {
            error!(stage = e.stage(), error = %e, "invocation failed");
            std::process::exit(1);
        }
    }
}

/// Read the inbound event from a file or stdin
fn read_event(path: Option<&std::path::Path>) -> Result<InboundEvent, Box<dyn std::error::Error>> {
    let bytes = match path {
        Some(p) if p.as_os_str() != "-" => std::fs::read(p)?,
        _ => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };
    Ok(InboundEvent::from_slice(&bytes)?)
}
