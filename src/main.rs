//! Telemetry link - device entry point
//!
//! Waits for the clock, starts the supervised broker session and publishes
//! sensor telemetry until SIGINT or SIGTERM.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use telemetry_link::clock::{wait_until_synchronized, ClockSource, SystemClock};
use telemetry_link::config::TelemetryConfig;
use telemetry_link::credential::{CredentialIssuer, JwtIssuer};
use telemetry_link::observability::{init_default_logging, HealthServer};
use telemetry_link::publisher::TelemetryPublisher;
use telemetry_link::telemetry::{run_sensor_loop, utc_offset, SamplingSettings, SimulatedSensor};
use telemetry_link::telemetry_span;
use telemetry_link::transport::mqtt::{MessageCallback, MqttSession};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, Instrument};

/// Publishes device telemetry over an authenticated MQTT session
#[derive(Parser)]
#[command(name = "telemetry-link")]
#[command(about = "Publish device telemetry to a cloud IoT MQTT bridge")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TELEMETRY_LINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and publish sensor telemetry until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Issue one credential with the device key and print it
    Token,
}

/// Poll interval while waiting for time sync
const CLOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting telemetry-link v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_device(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Token => print_token(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<TelemetryConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(TelemetryConfig::load_from_file(path)?);
    }

    let default_paths = ["telemetry.toml", "config/telemetry.toml"];
    for path_str in default_paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(TelemetryConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create telemetry.toml".into())
}

async fn run_device(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let identity = config.device_identity()?;
    info!("Device {} starting", identity.client_id());

    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
    wait_until_synchronized(
        clock.as_ref(),
        Duration::from_secs(config.telemetry.clock_sync_timeout_secs),
        CLOCK_POLL_INTERVAL,
    )
    .await?;

    let on_message: MessageCallback = Arc::new(|topic: &str, payload: &[u8]| {
        info!(
            topic,
            payload = %String::from_utf8_lossy(payload),
            "Inbound message"
        );
    });
    let session =
        Arc::new(MqttSession::new(config.broker_settings()).with_message_callback(on_message));

    let publisher = TelemetryPublisher::new(
        identity.clone(),
        Arc::clone(&clock),
        session,
        config.supervisor_config(),
    )?;

    if config.health.enabled {
        let health_server = Arc::new(HealthServer::new(
            identity.device_id.clone(),
            config.health.port,
            publisher.subscribe_status(),
            publisher.metrics(),
        ));
        tokio::spawn(health_server.start());
    }

    publisher.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let settings = SamplingSettings {
        interval: Duration::from_secs(config.telemetry.interval_secs),
        subfolder: config.telemetry.subfolder.clone(),
        offset: utc_offset(config.telemetry.utc_offset_hours),
        device: identity.device_id.clone(),
    };
    let span = telemetry_span!(device_id = %identity.device_id);
    let sampler = tokio::spawn(
        run_sensor_loop(
            publisher.clone(),
            SimulatedSensor::new(),
            Arc::clone(&clock),
            settings,
            shutdown_rx,
        )
        .instrument(span),
    );

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    let _ = shutdown_tx.send(true);
    publisher.stop().await;
    match sampler.await {
        Ok(published) => info!(published, "Shutdown complete"),
        Err(e) => error!("Telemetry task failed: {}", e),
    }

    Ok(())
}

fn handle_config_command(
    config: &TelemetryConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn print_token(config: &TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let issuer = JwtIssuer::new(config.device_identity()?)?;
    let clock = SystemClock;
    wait_until_synchronized(
        &clock,
        Duration::from_secs(config.telemetry.clock_sync_timeout_secs),
        CLOCK_POLL_INTERVAL,
    )
    .await?;

    let validity = Duration::from_secs(config.credential.validity_secs);
    let credential = issuer.issue_now(&clock, validity)?;
    info!(
        issued_at = credential.issued_at(),
        expires_at = credential.expires_at(),
        "Issued device credential"
    );
    println!("{}", credential.token());
    Ok(())
}
