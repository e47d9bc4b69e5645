//! trackerlink - tracker connectivity daemon

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use trackerlink::bus::{Bus, Observer, Topology};
use trackerlink::config::{ConfigError, TrackerConfig};
use trackerlink::fota::{LoggingDownloader, UpdateManager};
use trackerlink::modem::StaticModem;
use trackerlink::observability::logging::{init_logging, parse_level, LogFormat};
use trackerlink::observability::{init_default_logging, metrics};
use trackerlink::producers::{
    FixSource, JsonLinesFixSource, LineIngest, LocationManager, NetworkReporter, PdnEvent,
};
use trackerlink::supervisor::{FatalEscalator, ProcessRestart, RebootHandler, Supervisor};
use trackerlink::transport::{Coordinator, MqttBrokerClient};
use trackerlink::{FirmwareVersion, TrackerResult};

/// Broker callbacks buffered between the MQTT event loop and the coordinator
const BROKER_EVENT_DEPTH: usize = 32;

/// Cellular tracker connectivity daemon
#[derive(Parser)]
#[command(name = "trackerlink")]
#[command(about = "Connects tracker producers to an MQTT broker over a cellular link")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TRACKERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracker until SIGINT or SIGTERM
    Run {
        /// JSON-lines file of fixes to replay, overrides `location.fixes_file`
        #[arg(long, value_name = "FILE")]
        fixes: Option<PathBuf>,
    },
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(parse_level("DEBUG"), LogFormat::Pretty, false),
        _ => init_logging(parse_level("TRACE"), LogFormat::Pretty, true),
    }

    info!(
        version = %FirmwareVersion::current(),
        "Starting trackerlink"
    );

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { fixes } => run_tracker(config, fixes).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(transient = e.is_transient(), "Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(explicit: Option<&Path>) -> TrackerResult<TrackerConfig> {
    let path = TrackerConfig::locate(explicit)?;
    info!("Loading configuration from: {}", path.display());
    Ok(TrackerConfig::load_from_file(&path)?)
}

async fn build_fix_source(
    config: &TrackerConfig,
    fixes: Option<PathBuf>,
) -> TrackerResult<Box<dyn FixSource>> {
    let period = std::time::Duration::from_millis(config.location.fix_interval_ms);
    match fixes.or_else(|| config.location.fixes_file.clone()) {
        Some(path) => {
            info!(path = %path.display(), "Replaying location fixes");
            Ok(Box::new(JsonLinesFixSource::open(&path, period).await?))
        }
        None => {
            info!("No fix source configured, location reporting disabled");
            Ok(Box::new(JsonLinesFixSource::from_reader(
                tokio::io::empty(),
                period,
            )))
        }
    }
}

async fn run_tracker(config: TrackerConfig, fixes: Option<PathBuf>) -> TrackerResult<()> {
    let config = Arc::new(config);
    info!(identity = %config.device.identity, broker = %config.mqtt.broker_url, "Tracker starting");

    let bus = Arc::new(Bus::new(Topology::standard(), config.transport.inbox_depth)?);
    let transport_inbox = bus.subscribe(Observer::Transport)?;
    let update_inbox = bus.subscribe(Observer::UpdateManager)?;
    let location_inbox = bus.subscribe(Observer::LocationManager)?;
    let supervisor_inbox = bus.subscribe(Observer::Supervisor)?;

    let reboot: Arc<dyn RebootHandler> = Arc::new(ProcessRestart);
    let escalator = FatalEscalator::new(Arc::clone(&bus), Arc::clone(&reboot));
    let read_timeout = config.read_timeout();

    let (shutdown_tx, shutdown) = watch::channel(false);

    let supervisor = Supervisor::new(Arc::clone(&bus), supervisor_inbox, reboot, read_timeout);
    let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

    let (events_tx, events_rx) = mpsc::channel(BROKER_EVENT_DEPTH);
    let broker = Arc::new(MqttBrokerClient::new(events_tx));
    let modem = Arc::new(StaticModem::new(
        config.device.identity.clone(),
        config.modem.clone(),
    ));
    let transport = Coordinator::new(
        Arc::clone(&config),
        Arc::clone(&bus),
        transport_inbox,
        broker,
        events_rx,
        modem,
        escalator.clone(),
    )
    .start(shutdown.clone());

    let updates = UpdateManager::new(
        Arc::clone(&bus),
        update_inbox,
        Arc::new(LoggingDownloader),
        escalator.clone(),
        config.update.host.clone(),
        read_timeout,
    );
    let update_task = tokio::spawn(updates.run(shutdown.clone()));

    let source = build_fix_source(&config, fixes).await?;
    let location = LocationManager::new(
        Arc::clone(&bus),
        location_inbox,
        source,
        escalator.clone(),
        read_timeout,
    );
    let location_task = tokio::spawn(location.run(shutdown.clone()));

    let ingest = LineIngest::new(
        Arc::clone(&bus),
        BufReader::new(tokio::io::stdin()),
        config.publish_timeout(),
    );
    let ingest_task = tokio::spawn(ingest.run(shutdown.clone()));

    // The host network is up by the time the daemon runs
    let reporter = NetworkReporter::new(Arc::clone(&bus), escalator);
    reporter.report(PdnEvent::Activated).await;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Tracker is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    let _ = shutdown_tx.send(true);

    if let Err(e) = transport.coordinator.await {
        warn!(error = %e, "Coordinator task failed");
    }
    let _ = transport.executor.await;
    let _ = update_task.await;
    let _ = location_task.await;
    let _ = supervisor_task.await;
    match ingest_task.await {
        Ok(Ok(lines)) => info!(lines, "Ingest stopped"),
        Ok(Err(e)) => warn!(error = %e, "Ingest failed"),
        Err(e) => warn!(error = %e, "Ingest task failed"),
    }

    let snapshot = metrics().snapshot();
    info!(?snapshot, "Final metrics");
    Ok(())
}

fn handle_config_command(config: &TrackerConfig, show: bool) -> TrackerResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config).map_err(ConfigError::from)?;
        println!("Current configuration:");
        println!("{rendered}");
    }
    println!("Configuration is valid");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackerlink::TrackerError;

    #[test]
    fn test_missing_config_surfaces_as_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let err = load_configuration(Some(&missing)).unwrap_err();
        assert!(matches!(err, TrackerError::Config(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_config_command_renders_loaded_config() {
        let config = trackerlink::testing::test_config();
        assert!(handle_config_command(&config, true).is_ok());
    }
}
