//! canaryd - CAN simulator daemon
//!
//! Starts the links described in a TOML file and plays the first
//! configured scenario.
//!
//! Usage:
//!   canaryd [OPTIONS] <config.toml>

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use canary_link::PlatformInfo;
use canary_manager::CanManager;
use canary_scenario::{EngineState, ScenarioEngine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::DaemonConfig;

/// Parsed command-line arguments
struct Args {
    config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut result = Args { config_path: None };

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                result.config_path = Some(PathBuf::from(arg));
            }
            _ => tracing::warn!("Unknown argument: {}", arg),
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"canaryd - CAN simulator daemon

Usage: canaryd [OPTIONS] <config.toml>

Options:
  -h, --help    Print this help message

Logging is controlled through RUST_LOG, e.g.
  RUST_LOG=canary_link=debug canaryd config/sim.toml
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "canaryd=info,canary_link=info,canary_manager=info,canary_scenario=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args();
    let Some(path) = args.config_path else {
        print_help();
        anyhow::bail!("No config file given");
    };

    tracing::info!("Starting canaryd");
    tracing::info!(platform = %PlatformInfo::detect(), "Host platform");

    tracing::info!("Loading config from: {}", path.display());
    let config = DaemonConfig::load(&path)?;

    let manager = Arc::new(CanManager::new());
    for (name, link_config) in config.link_configs() {
        tracing::info!(
            link = %name,
            kind = %link_config.backend_kind,
            channel = %link_config.channel,
            "Adding link"
        );
        manager
            .add_link(&name, link_config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to add link '{}': {}", name, e))?;
    }

    let results = manager.start_all().await;
    for result in &results {
        match &result.error {
            None => tracing::info!(link = %result.link, state = %result.state, "Link started"),
            Some(e) => tracing::error!(link = %result.link, error = %e, "Link failed to start"),
        }
    }
    if !results.is_empty() && results.iter().all(|r| !r.is_ok()) {
        manager.stop_all().await;
        anyhow::bail!("No link could be started");
    }

    let engine = ScenarioEngine::new(manager.clone(), config.engine_config());
    if let Some(scenario) = config.scenarios.first().cloned() {
        if config.scenarios.len() > 1 {
            tracing::warn!(
                count = config.scenarios.len(),
                "Only the first scenario is played"
            );
        }
        engine.load(scenario)?;
        engine.start()?;

        let mut states = engine.watch_state();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping scenario");
                if let Err(e) = engine.stop() {
                    tracing::warn!(error = %e, "Scenario was not running");
                }
            }
            _ = states.wait_for(|s| matches!(s, EngineState::Completed | EngineState::Error)) => {}
        }

        let progress = engine.progress();
        match engine.last_error() {
            Some(e) => tracing::error!(error = %e, ?progress, "Scenario failed"),
            None => tracing::info!(?progress, "Scenario finished"),
        }
    } else {
        tracing::info!("No scenario configured, running until Ctrl-C");
        tokio::signal::ctrl_c().await?;
    }

    tracing::info!("Shutting down");
    for result in manager.stop_all().await {
        if result.forced {
            tracing::warn!(link = %result.link, "Link force-closed");
        } else if let Some(e) = result.error {
            tracing::error!(link = %result.link, error = %e, "Link failed to stop");
        }
    }

    Ok(())
}
