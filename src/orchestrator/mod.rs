//! Drives one server agent and N client agents through a test run and
//! aggregates their metrics into a single [`TestRun`].
mod finalize;
mod plan;
mod poll;
mod run;
mod setup;


use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::RunFailure;
use crate::remote::{AgentControlPort, AgentEndpoint};
use crate::wire::{ServerStartRequest, SessionKey};

pub use plan::{ClientEntry, Leg, Mode, ServerEntry, Stage, TestPlan};
pub use run::{AgentSeries, ClientFailure, Phase, PhaseWindow, RunStatus, TestRun};

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on each stop call during teardown.
    pub stop_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Runs test plans against remote agents reached through `TPort`.
pub struct Orchestrator<TPort> {
    port: TPort,
    config: OrchestratorConfig,
    run_tx: watch::Sender<TestRun>,
}

/// Endpoints and sessions of one validated plan.
pub(crate) struct RunContext {
    server: AgentEndpoint,
    clients: Vec<AgentEndpoint>,
    legs: Vec<Leg>,
    server_request: ServerStartRequest,
    started_at: Instant,
}

impl RunContext {
    fn new(plan: &TestPlan, legs: Vec<Leg>) -> Self {
        let api_key = |entry_key: Option<&String>| {
            entry_key
                .or(plan.api_key.as_ref())
                .map(|key| key.trim().to_owned())
        };
        Self {
            server: AgentEndpoint::new(plan.server.agent.trim())
                .with_api_key(api_key(plan.server.api_key.as_ref())),
            clients: plan
                .clients
                .iter()
                .map(|client| {
                    AgentEndpoint::new(client.agent.trim())
                        .with_api_key(api_key(client.api_key.as_ref()))
                })
                .collect(),
            legs,
            server_request: ServerStartRequest {
                ports: plan.server_ports(),
                bind: plan.server.bind.clone(),
                bind_map: plan.server.bind_map.clone(),
            },
            started_at: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Client sessions currently believed to be running, by client index.
pub(crate) type ActiveSessions = BTreeMap<usize, Vec<SessionKey>>;

impl<TPort> Orchestrator<TPort>
where
    TPort: AgentControlPort + Sync,
{
    #[must_use]
    pub fn new(port: TPort, config: OrchestratorConfig) -> Self {
        let (run_tx, _) = watch::channel(TestRun::default());
        Self {
            port,
            config,
            run_tx,
        }
    }

    /// Snapshots of the current run, refreshed after every transition and tick.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TestRun> {
        self.run_tx.subscribe()
    }

    /// Closes pooled agent connections. Call once after the last run.
    pub async fn shutdown(&self) {
        self.port.shutdown().await;
    }

    fn publish(&self, run: &TestRun) {
        self.run_tx.send_replace(run.clone());
    }

    /// Executes `plan` to a terminal state. Flipping `cancel` to `true`
    /// ends the run early; sessions are stopped best-effort either way.
    pub async fn execute(&self, plan: TestPlan, mut cancel: watch::Receiver<bool>) -> TestRun {
        let mut run = TestRun::new(plan);
        run.started_at = Some(chrono::Utc::now().to_rfc3339());
        self.publish(&run);

        match self.drive(&mut run, &mut cancel).await {
            Ok(()) => run.enter(Phase::Completed),
            Err(failure) => {
                warn!("Run failed: {}", failure);
                if matches!(failure, RunFailure::Cancelled) {
                    run.cancelled = true;
                }
                run.error = Some(failure.to_string());
                run.enter(Phase::Failed);
            }
        }
        run.finished_at = Some(chrono::Utc::now().to_rfc3339());
        self.publish(&run);
        info!(
            "Run finished: status={:?} cancelled={} ticks={} participants={} failed_clients={}",
            run.status,
            run.cancelled,
            run.ticks,
            run.series.len(),
            run.failures.len()
        );
        run
    }

    async fn drive(
        &self,
        run: &mut TestRun,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), RunFailure> {
        run.plan
            .validate()
            .map_err(|source| RunFailure::InvalidPlan { source })?;
        let legs = run
            .plan
            .legs()
            .map_err(|source| RunFailure::InvalidPlan { source })?;
        let ctx = RunContext::new(&run.plan, legs);
        info!(
            "Starting {} run: server={} clients={} duration={}s",
            run.plan.mode,
            ctx.server.base_url,
            ctx.clients.len(),
            run.plan.duration_sec
        );
        if is_cancelled(cancel) {
            return Err(RunFailure::Cancelled);
        }

        run.enter(Phase::StartingServers);
        self.publish(run);
        self.start_servers(&ctx, run.plan.keep_servers_open).await?;
        if is_cancelled(cancel) {
            self.stop_servers(&ctx, run.plan.keep_servers_open).await;
            return Err(RunFailure::Cancelled);
        }

        run.enter(Phase::StartingClients);
        self.publish(run);
        let first_stages: &[Stage] = match run.plan.mode {
            Mode::Bidir | Mode::UpOnly | Mode::DownOnly => &[Stage::Main],
            Mode::Dual => &[Stage::Upload, Stage::Download],
            Mode::TwoPhase => &[Stage::Upload],
        };
        let mut active = self.start_clients(&ctx, run, first_stages, None).await;
        if active.is_empty() {
            self.stop_servers(&ctx, run.plan.keep_servers_open).await;
            return Err(RunFailure::AllClientsFailed {
                count: ctx.clients.len(),
            });
        }
        if is_cancelled(cancel) {
            self.stop_clients(&ctx, &active).await;
            self.stop_servers(&ctx, run.plan.keep_servers_open).await;
            return Err(RunFailure::Cancelled);
        }

        let routes = poll::Routes::new(&ctx, run, &active);
        let durations = run.plan.phase_durations();
        let mut dropped = Vec::new();
        if run.plan.mode == Mode::TwoPhase {
            let upload = durations.first().copied().unwrap_or_default();
            let download = durations.get(1).copied().unwrap_or_default();
            let mut cancelled = self
                .run_phase(&ctx, &routes, run, Phase::RunningUpload, upload, cancel)
                .await;
            if !cancelled {
                self.stop_clients(&ctx, &active).await;
                // The download legs reuse the upload keys; collect the upload tail first.
                self.poll_once(&routes, run).await;
                let started = self
                    .start_clients(&ctx, run, &[Stage::Download], Some(&active))
                    .await;
                dropped = active
                    .keys()
                    .filter(|index| !started.contains_key(index))
                    .copied()
                    .collect();
                if started.is_empty() {
                    routes.exclude_clients(run, &dropped);
                    self.stop_servers(&ctx, run.plan.keep_servers_open).await;
                    return Err(RunFailure::AllClientsFailed {
                        count: ctx.clients.len(),
                    });
                }
                active = started;
                cancelled = self
                    .run_phase(&ctx, &routes, run, Phase::RunningDownload, download, cancel)
                    .await;
            }
            run.cancelled = cancelled;
        } else {
            let duration = durations.first().copied().unwrap_or(run.plan.duration_sec);
            run.cancelled = self
                .run_phase(&ctx, &routes, run, Phase::Running, duration, cancel)
                .await;
        }

        run.enter(Phase::Stopping);
        self.publish(run);
        self.stop_clients(&ctx, &active).await;
        self.stop_servers(&ctx, run.plan.keep_servers_open).await;
        self.poll_once(&routes, run).await;
        routes.exclude_clients(run, &dropped);
        self.publish(run);
        Ok(())
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}
