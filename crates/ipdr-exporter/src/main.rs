//! IPDR exporter daemon.
//!
//! Loads sessions, templates and collectors from a TOML file, starts the
//! exporter on a TCP transport and runs until SIGINT/SIGTERM, draining each
//! session before shutting down.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ipdr_exporter::runtime::{run_discovery, ExporterDriver, TcpTransport};
use ipdr_exporter::{init_logging, Event, Exporter, ExporterFile, Severity};
use ipdr_wire::SessionStopReason;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// IPDR/SP exporter daemon
#[derive(Parser, Debug)]
#[command(name = "ipdr-exporterd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = "/etc/ipdr/exporter.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Seconds to wait for each session's queue to drain on shutdown (0 waits forever)
    #[arg(long, default_value = "10")]
    drain_timeout: u64,

    /// Validate the configuration file and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.json);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("ipdr-exporterd failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let file = ExporterFile::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    file.validate()
        .with_context(|| format!("validating {}", args.config.display()))?;
    if args.check {
        info!(path = %args.config.display(), "configuration is valid");
        return Ok(());
    }

    let (transport, transport_events) = TcpTransport::new(Handle::current());
    let exporter = Exporter::init(file.parameter_store()?, transport)?;
    exporter.on_event(log_event);
    file.apply(&exporter)?;
    exporter.start()?;
    info!(
        listen = %exporter.config().listen_addr(),
        sessions = file.sessions.len(),
        collectors = file.collectors.len(),
        "ipdr-exporterd started"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let driver = tokio::spawn(ExporterDriver::new(exporter.clone(), transport_events).run(stop_rx.clone()));
    let discovery = tokio::spawn(run_discovery(exporter.clone(), stop_rx));

    shutdown_signal().await;
    info!("shutdown signal received");

    // Draining blocks while acknowledgments keep arriving through the driver.
    let drain_timeout = Duration::from_secs(args.drain_timeout);
    let stopping = exporter.clone();
    tokio::task::spawn_blocking(move || graceful_stop(&stopping, drain_timeout))
        .await
        .context("shutdown task panicked")??;

    let _ = stop_tx.send(true);
    let _ = driver.await;
    let _ = discovery.await;
    exporter.delete()?;
    info!("ipdr-exporterd stopped");
    Ok(())
}

fn graceful_stop(exporter: &Exporter, drain_timeout: Duration) -> Result<()> {
    for session in exporter.list_sessions() {
        if !session.running {
            continue;
        }
        match exporter.stop_session(session.id, SessionStopReason::EndOfData, drain_timeout) {
            Ok(outcome) => info!(session = session.id.0, ?outcome, "session stopped"),
            Err(e) => warn!(session = session.id.0, error = %e, "failed to stop session"),
        }
    }
    exporter.stop()?;
    Ok(())
}

fn log_event(event: &Event) {
    let collector = event.collector.as_deref().unwrap_or("-");
    let session = event.session.map(|s| s.0);
    match event.severity {
        Severity::Info => info!(target: "ipdr_event", kind = %event.kind, ?session, collector, "exporter event"),
        Severity::Warning | Severity::Error => warn!(
            target: "ipdr_event",
            kind = %event.kind,
            ?session,
            collector,
            outstanding = event.outstanding,
            unacknowledged = event.unacknowledged,
            "exporter event"
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
