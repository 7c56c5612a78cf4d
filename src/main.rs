// SPDX-License-Identifier: MIT
mod agent_stub;
mod cli;
mod gateway;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use qqgate_core::AgentRuntime;
use qqgate_onebot::sender::RelayUrlIssuer;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Some(Commands::Completions { shell }) => {
            cli::print_completions(*shell);
            Ok(())
        }
        Some(Commands::ShowConfig) => {
            let config = qqgate_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Some(Commands::Validate) => {
            let config = qqgate_config::load(cli.config.as_deref())?;
            println!(
                "config OK: {} account(s), {} automation target(s)",
                config.accounts.len(),
                config.automation.len()
            );
            Ok(())
        }
        Some(Commands::Run) | None => {
            let config = qqgate_config::load(cli.config.as_deref())?;
            run(config).await
        }
    }
}

/// Mirrors the teacher's verbosity-to-filter mapping (`-v`/`-vv`), minus the
/// TUI-corruption guard this binary has no TUI to corrupt.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Starts every configured account's inbound loop plus its automation
/// reconciler and proactive-nudge sweep (spec §2 "Data flow"), and blocks
/// until Ctrl-C, then drains all tasks under one shutdown token.
async fn run(config: qqgate_config::Config) -> Result<()> {
    if config.accounts.is_empty() {
        warn!("no accounts configured; nothing to do");
        return Ok(());
    }

    let workspace_root = PathBuf::from(&config.workspace);
    std::fs::create_dir_all(&workspace_root)?;

    let shutdown = CancellationToken::new();
    let agent: Arc<dyn AgentRuntime> = Arc::new(agent_stub::EchoAgentRuntime);

    let relay: Option<Arc<qqgate_relay::MediaRelay>> = if config.relay.enabled {
        let relay = Arc::new(qqgate_relay::MediaRelay::new(&config.relay));
        let serve_relay = relay.clone();
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_relay.serve(serve_shutdown).await {
                warn!(%err, "media relay server exited");
            }
        });
        Some(relay)
    } else {
        None
    };

    let mut join_handles = Vec::new();

    for (index, account) in config.accounts.iter().enumerate() {
        let account_id = account
            .id
            .clone()
            .unwrap_or_else(|| format!("account-{index}"));
        info!(account = %account_id, ws_url = %account.ws_url, "starting account");

        let relay_issuer: Option<Arc<dyn RelayUrlIssuer>> =
            relay.clone().map(|r| r as Arc<dyn RelayUrlIssuer>);

        let handles = Arc::new(gateway::build_account(
            account_id,
            account.clone(),
            &workspace_root,
            agent.clone(),
            relay_issuer,
            shutdown.clone(),
        ));

        join_handles.push(tokio::spawn(gateway::run_account_inbound(
            handles.clone(),
            shutdown.clone(),
        )));
        join_handles.push(gateway::spawn_reconciler(
            &config,
            handles.engine.clone(),
            handles.runtime.nudge.clone(),
            &workspace_root,
            shutdown.clone(),
        ));
        join_handles.push(gateway::spawn_proactive_sweep(
            handles.runtime.clone(),
            handles.engine.clone(),
            shutdown.clone(),
        ));
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    shutdown.cancel();

    for handle in join_handles {
        let _ = handle.await;
    }

    Ok(())
}
