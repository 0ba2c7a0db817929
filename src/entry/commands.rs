use std::path::Path;

use clap::ArgMatches;
use tokio::sync::watch;
use tracing::info;

use crate::agent::run_agent;
use crate::args::{AgentArgs, DiscoverArgs, RunArgs, StatusArgs};
use crate::config::{agent_settings, load_config, load_plan, write_run};
use crate::error::{AppError, AppResult, RunFailure};
use crate::orchestrator::{Orchestrator, OrchestratorConfig, Phase, RunStatus, TestRun};
use crate::remote::{
    AgentControlPort, AgentEndpoint, DiscoveryOptions, RemoteClient, RemoteConfig, discover_agents,
};
use crate::shutdown_handlers::{setup_signal_shutdown_handler, shutdown_channel};

use super::summary;

pub(super) async fn agent(args: &AgentArgs, matches: &ArgMatches) -> AppResult<()> {
    let file = load_config(args.config.as_deref())?;
    let settings = agent_settings(args, matches, file.as_ref())?;

    let (shutdown_tx, _) = shutdown_channel();
    let signals = setup_signal_shutdown_handler(&shutdown_tx);
    let result = run_agent(settings, &shutdown_tx).await;
    drop(shutdown_tx.send(()));
    signals.await?;
    result
}

pub(super) async fn run_plan(args: &RunArgs) -> AppResult<()> {
    let plan = load_plan(Path::new(&args.plan))?;
    let client = RemoteClient::new(RemoteConfig {
        poll_timeout: args.poll_timeout,
        command_timeout: args.command_timeout,
        default_api_key: args.resolved_api_key(),
    });
    let orchestrator = Orchestrator::new(
        client,
        OrchestratorConfig {
            stop_grace: args.stop_grace,
        },
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (shutdown_tx, _) = shutdown_channel();
    let signals = setup_signal_shutdown_handler(&shutdown_tx);
    let mut shutdown_rx = shutdown_tx.subscribe();
    let cancel_on_signal = tokio::spawn(async move {
        if shutdown_rx.recv().await.is_ok() {
            cancel_tx.send_replace(true);
        }
    });
    let progress = tokio::spawn(log_progress(orchestrator.subscribe()));

    let run = orchestrator.execute(plan, cancel_rx).await;

    drop(shutdown_tx.send(()));
    signals.await?;
    cancel_on_signal.await?;
    progress.abort();
    orchestrator.shutdown().await;

    if !args.quiet {
        for line in summary::run_lines(&run) {
            println!("{}", line);
        }
    }
    if let Some(output) = args.output.as_deref() {
        write_run(Path::new(output), &run)?;
        info!("Run written to {}", output);
    }
    finish(&run)
}

/// Logs each phase transition as the run moves through it.
async fn log_progress(mut updates: watch::Receiver<TestRun>) {
    let mut last = Phase::Pending;
    while updates.changed().await.is_ok() {
        let phase = updates.borrow_and_update().phase;
        if phase != last {
            info!("Run phase: {}", phase.as_str());
            last = phase;
        }
        if phase.is_terminal() {
            break;
        }
    }
}

fn finish(run: &TestRun) -> AppResult<()> {
    if run.status == RunStatus::Failed && !run.cancelled {
        return Err(AppError::run(RunFailure::Unsuccessful {
            message: run.error.clone().unwrap_or_default(),
        }));
    }
    Ok(())
}

pub(super) async fn discover(args: &DiscoverArgs) -> AppResult<()> {
    let options = DiscoveryOptions {
        target: args.target,
        port: args.port,
        timeout: args.timeout,
        retries: args.retries,
    };
    let replies = discover_agents(&options).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&replies)?);
        return Ok(());
    }
    for line in summary::discovery_lines(&replies) {
        println!("{}", line);
    }
    Ok(())
}

pub(super) async fn status(args: &StatusArgs) -> AppResult<()> {
    let client = RemoteClient::new(RemoteConfig {
        poll_timeout: args.timeout,
        command_timeout: args.timeout,
        default_api_key: args.resolved_api_key(),
    });
    let result = client.status(&AgentEndpoint::new(args.agent.trim())).await;
    client.shutdown().await;
    let status = result?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    for line in summary::status_lines(&status) {
        println!("{}", line);
    }
    Ok(())
}
