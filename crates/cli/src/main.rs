//! sipline - run a SIP session from the command line
//!
//! Loads configuration and credentials, registers, optionally places a call,
//! and on Ctrl-C de-registers within the configured shutdown deadline. A
//! second Ctrl-C abandons the de-registration wait.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sipline_session_controller::events::{CallStatusInfo, RegistrationStatusInfo};
use sipline_session_controller::logging::{parse_log_level, setup_logging, LoggingConfig};
use sipline_session_controller::prelude::*;
use sipline_session_controller::sim::{RegistrarBehavior, SimulatedEngineFactory};

/// Registrar behaviour of the simulated engine backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Simulate {
    Accept,
    Reject,
    Unreachable,
    NeverClear,
}

impl From<Simulate> for RegistrarBehavior {
    fn from(mode: Simulate) -> Self {
        match mode {
            Simulate::Accept => RegistrarBehavior::Accept,
            Simulate::Reject => RegistrarBehavior::Reject("Forbidden".to_string()),
            Simulate::Unreachable => RegistrarBehavior::Unreachable,
            Simulate::NeverClear => RegistrarBehavior::NeverClear,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "sipline", version, about = "Register a SIP identity and keep it registered until Ctrl-C")]
struct Cli {
    /// Writable directory holding the per-install configuration
    #[arg(long, env = "SIPLINE_DOCUMENTS_DIR")]
    documents_dir: PathBuf,

    /// Read-only directory holding the factory template, secrets and audio assets
    #[arg(long, env = "SIPLINE_BUNDLE_DIR")]
    bundle_dir: PathBuf,

    #[arg(long, default_value = "linphonerc")]
    user_config: String,

    #[arg(long, default_value = "linphonerc-factory")]
    factory_config: String,

    /// Secret store file; relative paths are resolved in the bundle directory
    #[arg(long, default_value = "Secret.toml")]
    secrets: PathBuf,

    #[arg(long, default_value = "ringback.wav")]
    ringback: String,

    #[arg(long, default_value = "toy-mono.wav")]
    ring: String,

    #[arg(long, env = "SIPLINE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log one JSON object per line
    #[arg(long)]
    json_logs: bool,

    /// Log span open and close with source locations
    #[arg(long)]
    trace_spans: bool,

    /// Registrar behaviour of the simulated engine
    #[arg(long, value_enum, default_value_t = Simulate::Accept)]
    simulate: Simulate,

    /// Place a call to this address once registered
    #[arg(long)]
    call: Option<String>,
}

struct ConsoleReporter;

impl SessionEventHandler for ConsoleReporter {
    fn on_registration_state_changed(&self, info: &RegistrationStatusInfo) {
        println!("registration {}: {} {}", info.proxy, info.state, info.message);
    }

    fn on_call_state_changed(&self, info: &CallStatusInfo) {
        println!("{}: {} {}", info.call, info.state, info.message);
    }

    fn on_session_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::RegistrationStateChanged(info) => self.on_registration_state_changed(info),
            SessionEvent::CallStateChanged(info) => self.on_call_state_changed(info),
            SessionEvent::RegistrationRetryScheduled { attempt, delay, .. } => {
                println!("registration retry #{} in {} ms", attempt, delay.as_millis());
            }
            SessionEvent::RegistrationGaveUp { attempts, reason, .. } => {
                println!("registration abandoned after {} retries: {}", attempts, reason);
            }
            SessionEvent::LifecycleChanged { .. } => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::new(parse_log_level(&cli.log_level)?, "sipline");
    if cli.json_logs {
        logging = logging.with_json();
    }
    if cli.trace_spans {
        logging = logging.with_span_events().with_source_locations();
    }
    setup_logging(logging)?;

    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let dirs = AppDirs::new(&cli.documents_dir, &cli.bundle_dir);
    let assets = AudioAssets::from_bundle(&dirs, &cli.ringback, &cli.ring)?;
    let secrets = if cli.secrets.is_absolute() {
        cli.secrets.clone()
    } else {
        cli.bundle_dir.join(&cli.secrets)
    };

    let options = ControllerOptions::new(dirs, secrets, assets)
        .with_user_config(&cli.user_config)
        .with_factory_config(&cli.factory_config);
    let factory = SimulatedEngineFactory::new(cli.simulate.into()).with_latency(2);
    let controller = SessionController::new(options, &factory).context("cannot create session")?;
    let timeout_ms = controller.settings().shutdown_timeout_ms;

    let session = SessionService::spawn(controller);
    session.subscribe(Arc::new(ConsoleReporter));

    if let Err(e) = session.start().await {
        error!(error = %e, "Cannot start session");
        session.shutdown().await?;
        return Err(e.into());
    }
    info!("Session started, press Ctrl-C to stop");

    if let Some(destination) = &cli.call {
        match session.place_call(destination.as_str()).await {
            Ok(call) => info!(%call, destination = %destination, "Calling"),
            Err(e) => warn!(error = %e, destination = %destination, "Cannot place call"),
        }
    }

    tokio::signal::ctrl_c().await.context("cannot listen for Ctrl-C")?;
    info!(timeout_ms, "Shutting down, press Ctrl-C again to abandon de-registration");

    let cancel = CancellationToken::new();
    let second_interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let outcome = session.shutdown_with(cancel).await;
    second_interrupt.abort();

    match outcome {
        Ok(ShutdownOutcome::Cleared { iterations }) => {
            println!("de-registered after {} polls", iterations);
            Ok(())
        }
        Ok(ShutdownOutcome::NotRegistered) => Ok(()),
        Err(e @ (SessionError::ShutdownTimeout { .. } | SessionError::Cancelled)) => {
            warn!(error = %e, "Engine released without confirmed de-registration");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
