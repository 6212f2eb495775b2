//! mqtthub - shared MQTT broker connection for home automation hosts

use mqtthub::api;
use mqtthub::broker::{BrokerEvent, ConnectionManager, ConnectionState, PublishRequest, Purpose};
use mqtthub::config::HubConfig;
use mqtthub::observability::{init_default_logging, init_logging, LogFormat};
use mqtthub::transport::mqtt::RumqttcConnector;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn, Level};

/// Caller id owning the topics listed in the configuration file
const CONFIG_CALLER: &str = "config";

#[derive(Parser)]
#[command(name = "mqtthub")]
#[command(about = "Shared, resilient MQTT broker connection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe configured topics and serve the HTTP API
    Run,
    /// Publish one message and exit once it left the queue
    Publish {
        topic: String,
        message: String,
        /// 0, 1 or 2
        #[arg(long)]
        qos: Option<String>,
        /// true/false/1/0
        #[arg(long)]
        retain: Option<String>,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Validate configuration
    Config {
        /// Show current configuration, password redacted
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_hub(config).await,
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
            wait_secs,
        } => publish_once(config, topic, message, qos, retain, wait_secs).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<HubConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(HubConfig::load_from_file(path)?)
        }
        None => Ok(HubConfig::load_default()?),
    }
}

fn start_manager(config: &HubConfig) -> Arc<ConnectionManager> {
    let (manager, events) =
        ConnectionManager::new(config.broker.clone(), Arc::new(RumqttcConnector::new()));
    tokio::spawn(manager.clone().run(events));
    manager
}

async fn run_hub(config: HubConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting mqtthub v{}", env!("CARGO_PKG_VERSION"));

    let manager = start_manager(&config);
    tokio::spawn(log_broker_events(manager.subscribe_events()));

    manager.connect().await;
    for topic in &config.subscriptions {
        if let Err(e) = manager.subscribe(topic, Purpose::Trigger, CONFIG_CALLER).await {
            error!(topic = %topic, error = %e, "Failed to register configured topic");
        }
    }

    let (api_shutdown_tx, api_shutdown_rx) = oneshot::channel::<()>();
    let api_handle = if config.api.enabled {
        let api_manager = manager.clone();
        let section = config.api.clone();
        Some(tokio::spawn(async move {
            let shutdown = async {
                let _ = api_shutdown_rx.await;
            };
            if let Err(e) = api::serve(api_manager, &section, shutdown).await {
                error!("HTTP API error: {}", e);
            }
        }))
    } else {
        info!("HTTP API disabled");
        None
    };

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    let _ = api_shutdown_tx.send(());
    if let Some(handle) = api_handle {
        let _ = handle.await;
    }
    manager.disconnect().await;
    info!("Shutdown complete");
    Ok(())
}

async fn log_broker_events(mut events: broadcast::Receiver<BrokerEvent>) {
    loop {
        match events.recv().await {
            Ok(BrokerEvent::Message(message)) => info!(
                topic = %message.topic,
                payload = %message.payload_str(),
                retain = message.retain,
                "Inbound message"
            ),
            Ok(BrokerEvent::Availability(availability)) => {
                warn!(availability = ?availability, "Broker availability changed")
            }
            Ok(BrokerEvent::StateChanged { from, to }) => {
                debug!(from = %from, to = %to, "Broker state")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event logger fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn publish_once(
    config: HubConfig,
    topic: String,
    message: String,
    qos: Option<String>,
    retain: Option<String>,
    wait_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = start_manager(&config);

    let mut request = PublishRequest::new(topic, message);
    if let Some(qos) = qos {
        request = request.with_qos(qos);
    }
    if let Some(retain) = retain {
        request = request.with_retain(retain);
    }
    let outcome = manager.publish_request(request).await?;
    debug!(outcome = ?outcome, "Publish accepted");

    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    loop {
        let status = manager.status().await;
        if status.queued == 0 && status.state == ConnectionState::Connected {
            break;
        }
        if Instant::now() >= deadline {
            manager.disconnect().await;
            return Err(format!(
                "Message still queued after {wait_secs}s (state {})",
                status.state
            )
            .into());
        }
        sleep(Duration::from_millis(100)).await;
    }

    // Give the event loop a moment to flush the outgoing packet
    sleep(Duration::from_millis(200)).await;
    manager.disconnect().await;
    info!("Message published");
    Ok(())
}

fn handle_config_command(config: &HubConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration is valid");
    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }
    Ok(())
}
