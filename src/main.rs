//! mqtt-quic - command line client
//!
//! Connects with the configured device identity and publishes, subscribes or
//! just holds the connection open while printing statistics.

use clap::{Parser, Subcommand};
use mqtt_quic_client::{ConnectionConfig, ConnectionManager, PublishRequest, QoS};
use mqtt_quic_client::observability::init_default_logging;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// MQTT over QUIC with TCP+TLS fallback
#[derive(Parser)]
#[command(name = "mqtt-quic")]
#[command(about = "MQTT 3.1.1 client over QUIC with 0-RTT resumption and TCP+TLS fallback")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_QUIC_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stay connected until Ctrl-C, logging statistics
    Connect {
        /// Seconds between statistics reports
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },
    /// Publish one message per topic
    Publish {
        /// Topic to publish to; repeat for several topics
        #[arg(short, long, required = true)]
        topic: Vec<String>,
        /// Payload sent to every topic
        #[arg(short, long)]
        message: String,
        /// 0 or 1
        #[arg(short, long, default_value_t = 1)]
        qos: u8,
        /// Dispatch all topics at once
        #[arg(long)]
        parallel: bool,
    },
    /// Subscribe and print incoming messages
    Subscribe {
        /// Topic filter; repeat for several
        #[arg(short, long, required = true)]
        topic: Vec<String>,
        #[arg(short, long, default_value_t = 1)]
        qos: u8,
        /// Stop after this many seconds; runs until Ctrl-C when omitted
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!("Starting mqtt-quic v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Connect { stats_interval } => run_connect(config, stats_interval).await,
        Commands::Publish {
            topic,
            message,
            qos,
            parallel,
        } => run_publish(config, topic, message, qos, parallel).await,
        Commands::Subscribe {
            topic,
            qos,
            duration,
        } => run_subscribe(config, topic, qos, duration).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ConnectionConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ConnectionConfig::load_from_file(path)?);
    }

    for path_str in ["mqtt-quic.toml", "config/mqtt-quic.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ConnectionConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create mqtt-quic.toml".into())
}

fn parse_qos(qos: u8) -> Result<QoS, Box<dyn std::error::Error>> {
    QoS::from_u8(qos)
        .ok_or_else(|| format!("Unsupported QoS {qos}; this client speaks QoS 0 and 1").into())
}

async fn connected_manager(
    config: ConnectionConfig,
) -> Result<ConnectionManager, Box<dyn std::error::Error>> {
    let manager = ConnectionManager::new(config)?;
    manager.connect().await?;
    let stats = manager.stats();
    info!(
        transport = ?stats.transport,
        zero_rtt = stats.zero_rtt_used,
        connect_latency_ms = ?stats.connect_latency.map(|d| d.as_millis()),
        "Connected"
    );
    Ok(manager)
}

async fn run_connect(
    config: ConnectionConfig,
    stats_interval: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = connected_manager(config).await?;
    let interval = Duration::from_secs(stats_interval.max(1));

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down gracefully...");
                break;
            }
            _ = sleep(interval) => {
                println!("{}", serde_json::to_string(&manager.stats())?);
            }
        }
    }

    manager.disconnect().await;
    Ok(())
}

async fn run_publish(
    config: ConnectionConfig,
    topics: Vec<String>,
    message: String,
    qos: u8,
    parallel: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = parse_qos(qos)?;
    let manager = connected_manager(config).await?;
    let mut failures = 0usize;

    if parallel {
        let requests = topics
            .iter()
            .map(|topic| PublishRequest::new(topic.clone(), message.clone(), qos))
            .collect();
        for (topic, result) in manager.publish_parallel(requests).await {
            match result {
                Ok(()) => info!(topic = %topic, "Published"),
                Err(e) => {
                    failures += 1;
                    error!(topic = %topic, error = %e, "Publish failed");
                }
            }
        }
    } else {
        for topic in &topics {
            match manager.publish(topic, message.clone(), qos).await {
                Ok(()) => info!(topic = %topic, "Published"),
                Err(e) => {
                    failures += 1;
                    error!(topic = %topic, error = %e, "Publish failed");
                }
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&manager.stats())?);
    manager.disconnect().await;

    if failures > 0 {
        return Err(format!("{failures} of {} publishes failed", topics.len()).into());
    }
    Ok(())
}

async fn run_subscribe(
    config: ConnectionConfig,
    filters: Vec<String>,
    qos: u8,
    duration: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = parse_qos(qos)?;
    let manager = connected_manager(config).await?;
    let mut messages = manager
        .take_message_receiver()
        .ok_or("message receiver already taken")?;

    for filter in &filters {
        manager.subscribe(filter, qos).await?;
    }

    let deadline = async {
        match duration {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down gracefully...");
                break;
            }
            _ = &mut deadline => break,
            message = messages.recv() => match message {
                Some(message) => {
                    println!("{} {}", message.topic, String::from_utf8_lossy(&message.payload));
                }
                None => {
                    warn!("Message channel closed");
                    break;
                }
            },
        }
    }

    manager.disconnect().await;
    Ok(())
}

fn handle_config_command(
    config: &ConnectionConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration is valid");
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
