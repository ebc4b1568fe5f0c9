//! Edge telemetry client - main entry point

use clap::{Parser, Subcommand};
use edge_telemetry::auth::CredentialIssuer;
use edge_telemetry::commands::LoggingCommandHandler;
use edge_telemetry::config::{find_config_file, TelemetryConfig};
use edge_telemetry::manager::ConnectionManager;
use edge_telemetry::observability::{init_default_logging, lifecycle_span, metrics::metrics};
use edge_telemetry::publisher::PublishLoop;
use edge_telemetry::source;
use edge_telemetry::state::ConfigStateStore;
use edge_telemetry::transport::mqtt::MqttTransport;
use edge_telemetry::TelemetryError;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

/// Publishes device telemetry to an MQTT broker with JWT device auth
#[derive(Parser)]
#[command(name = "edge-telemetry")]
#[command(about = "Edge device telemetry publisher")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "EDGE_TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and publish measurements
    Run {
        /// Measurement file, overrides [source].path
        #[arg(long, value_name = "FILE")]
        source: Option<PathBuf>,
        /// Seconds between publishes, overrides [telemetry].publish_interval_secs
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Issue one token and print its claims
    Token,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    info!(
        "Starting edge telemetry client v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e.redacted());
            process::exit(e.exit_code());
        }
    };

    let result = match cli.command {
        Commands::Run { source, interval } => {
            if let Some(path) = source {
                config.source.path = path;
            }
            if let Some(secs) = interval {
                config.telemetry.publish_interval_secs = secs;
            }
            match config.validate() {
                Ok(()) => run_client(config).await,
                Err(e) => Err(e.into()),
            }
        }
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Token => print_token(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e.redacted());
        process::exit(e.exit_code());
    }

    info!("Finished.");
}

fn load_configuration(explicit: Option<&Path>) -> Result<TelemetryConfig, TelemetryError> {
    let path = find_config_file(explicit)?;
    info!("Loading configuration from: {}", path.display());
    Ok(TelemetryConfig::load_from_file(&path)?)
}

async fn run_client(config: TelemetryConfig) -> Result<(), TelemetryError> {
    // Startup failures are fatal before anything connects
    let issuer = Arc::new(CredentialIssuer::new(
        config.identity(),
        config.token_validity(),
    )?);
    let transport = MqttTransport::new(issuer.identity().client_id(), config.broker_settings()?)?;
    let measurements = source::load_file(&config.source.path, config.source.repeat)?;

    let store = Arc::new(ConfigStateStore::default());
    let settings = config.connection_settings();
    let events_topic = settings.topics.events();

    let mut manager = ConnectionManager::start(
        transport,
        issuer,
        Arc::clone(&store),
        Arc::new(LoggingCommandHandler),
        settings,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => info!("Received {}, shutting down gracefully...", name),
            Err(e) => error!("Failed to install signal handlers: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let mut publish_loop = PublishLoop::new(
        manager.handle(),
        store,
        measurements,
        events_topic,
        config.payload_options(),
        config.publish_interval(),
    );
    let outcome = publish_loop
        .run(shutdown_rx)
        .instrument(lifecycle_span!(device = %config.device.device_id))
        .await;

    // Always release the session, whatever stopped the loop
    manager.shutdown().await;

    match serde_json::to_string(&metrics().snapshot()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Final metrics"),
        Err(e) => warn!("Failed to serialize metrics: {}", e),
    }

    let outcome = outcome?;
    info!(
        "Publish loop stopped ({:?}) after {} messages",
        outcome,
        publish_loop.published()
    );
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

fn handle_config_command(config: &TelemetryConfig, show: bool) -> Result<(), TelemetryError> {
    if show {
        println!("{}", config.to_toml()?);
    }

    info!(
        client_id = %config.identity().client_id(),
        "Configuration validation complete"
    );
    Ok(())
}

/// Verify key material without connecting. The signature is never printed.
fn print_token(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let issuer = CredentialIssuer::new(config.identity(), config.token_validity())?;
    let token = issuer.issue(chrono::Utc::now())?;

    let claims = serde_json::json!({
        "client_id": issuer.identity().client_id(),
        "algorithm": issuer.identity().algorithm.as_str(),
        "aud": token.audience(),
        "iat": token.issued_at().timestamp(),
        "exp": token.expires_at().timestamp(),
    });
    println!("{claims:#}");
    Ok(())
}
