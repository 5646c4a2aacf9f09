//! Binary entry point: load configuration, wire up the engine, and run
//! the transport loop until `Ctrl-C`.
//!
//! Follows the teacher crate's `main`/`main_impl` split in spirit --
//! argument parsing and fatal-error reporting live here, everything
//! else is built as a library so it can be driven from tests.

use std::env;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use sipvine::{AuditBus, EngineConfig, SipEngine, SystemClock};

fn parse_args() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

fn load_config() -> anyhow::Result<EngineConfig> {
    let mut config = match parse_args() {
        Some(path) => {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {:?}", path))?;
            EngineConfig::from_file_contents(&contents)
                .with_context(|| format!("parsing config file {:?}", path))?
        }
        None => EngineConfig::default(),
    };
    config.apply_env().context("applying SIPVINE_* environment overrides")?;
    config.validate().context("validating configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "fatal: could not start sipvine");
            return ExitCode::FAILURE;
        }
    };

    if let Err(error) = run(config).await {
        tracing::error!(%error, "fatal error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    let clock: Arc<dyn sipvine::Clock> = Arc::new(SystemClock::new());
    let audit = AuditBus::with_clock(config.audit_bus_capacity, clock.clone());
    let engine = Arc::new(SipEngine::new(config, clock.clone(), audit));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reaper = tokio::spawn(sipvine::transport::run_reaper(engine.clone(), clock.clone(), shutdown_rx));

    let transport = sipvine::transport::Transport::bind(engine.clone(), clock.clone())
        .await
        .context("binding UDP socket")?;

    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl-C, shutting down");
    };
    transport.run(ctrl_c).await;

    let _ = shutdown_tx.send(true);
    let _ = reaper.await;
    Ok(())
}
