use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::remote::{AgentControlPort, AgentEndpoint};
use crate::wire::{MetricsSince, Role, SessionKey};

use super::run::{AgentSeries, Phase, PhaseWindow, TestRun};
use super::{ActiveSessions, Orchestrator, RunContext};

/// Where samples returned by each polled agent belong.
pub(super) struct Routes {
    agents: Vec<AgentEndpoint>,
    series_of_agent: Vec<Vec<usize>>,
    by_session: HashMap<(usize, SessionKey), usize>,
    client_series: HashMap<usize, usize>,
}

impl Routes {
    /// Builds one series for the server and one per started client.
    pub(super) fn new(ctx: &RunContext, run: &mut TestRun, active: &ActiveSessions) -> Self {
        let mut routes = Self {
            agents: Vec::new(),
            series_of_agent: Vec::new(),
            by_session: HashMap::new(),
            client_series: HashMap::new(),
        };
        run.series.clear();

        let server_keys: Vec<SessionKey> = ctx
            .server_request
            .ports
            .iter()
            .map(|port| SessionKey::server(*port))
            .collect();
        routes.add_series(run, &ctx.server, "server".to_owned(), Role::Server, server_keys);

        for index in active.keys() {
            let Some(endpoint) = ctx.clients.get(*index) else {
                continue;
            };
            let mut keys: Vec<SessionKey> = ctx
                .legs
                .iter()
                .filter(|leg| leg.client == *index)
                .map(super::plan::Leg::key)
                .collect();
            keys.dedup();
            let name = run.plan.client_name(*index);
            routes.client_series.insert(*index, run.series.len());
            routes.add_series(run, endpoint, name, Role::Client, keys);
        }
        routes
    }

    /// Removes the series of `clients` from the run. Consumes the routes
    /// since series indices shift afterwards.
    pub(super) fn exclude_clients(self, run: &mut TestRun, clients: &[usize]) {
        let excluded: Vec<usize> = clients
            .iter()
            .filter_map(|client| self.client_series.get(client).copied())
            .collect();
        if excluded.is_empty() {
            return;
        }
        let mut position = 0_usize;
        run.series.retain(|_| {
            let keep = !excluded.contains(&position);
            position = position.saturating_add(1);
            keep
        });
    }

    fn add_series(
        &mut self,
        run: &mut TestRun,
        endpoint: &AgentEndpoint,
        name: String,
        role: Role,
        sessions: Vec<SessionKey>,
    ) {
        let agent = self
            .agents
            .iter()
            .position(|known| known.base_url == endpoint.base_url)
            .unwrap_or_else(|| {
                self.agents.push(endpoint.clone());
                self.series_of_agent.push(Vec::new());
                self.agents.len().saturating_sub(1)
            });
        let series = run.series.len();
        for key in &sessions {
            self.by_session.insert((agent, *key), series);
        }
        if let Some(owned) = self.series_of_agent.get_mut(agent) {
            owned.push(series);
        }
        run.series.push(AgentSeries {
            name,
            agent: endpoint.base_url.clone(),
            role,
            sessions,
            samples: Vec::new(),
            poll_failures: 0,
        });
    }
}

impl<TPort> Orchestrator<TPort>
where
    TPort: AgentControlPort + Sync,
{
    /// Polls on the plan's tick until `secs` have elapsed or the run is
    /// cancelled. The first poll fires immediately. Returns whether the run
    /// was cancelled.
    pub(super) async fn run_phase(
        &self,
        ctx: &RunContext,
        routes: &Routes,
        run: &mut TestRun,
        phase: Phase,
        secs: u64,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        run.enter(phase);
        self.publish(run);
        let start_ms = ctx.elapsed_ms();
        let now = Instant::now();
        let deadline = now.checked_add(Duration::from_secs(secs)).unwrap_or(now);
        info!("Phase {:?} running for {}s", phase, secs);

        let mut ticker = tokio::time::interval(run.plan.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cancel_open = true;
        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(routes, run).await;
                    run.ticks = run.ticks.saturating_add(1);
                    self.publish(run);
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    } else if *cancel.borrow_and_update() {
                        info!("Run cancelled during {:?}", phase);
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        run.phases.push(PhaseWindow {
            phase,
            start_ms,
            end_ms: ctx.elapsed_ms(),
        });
        cancelled
    }

    /// One concurrent `metrics` call per distinct agent. A failed poll only
    /// counts against that agent's series.
    pub(super) async fn poll_once(&self, routes: &Routes, run: &mut TestRun) {
        let results = join_all(
            routes
                .agents
                .iter()
                .map(|endpoint| self.port.metrics(endpoint, MetricsSince::Last)),
        )
        .await;

        for (agent, result) in results.into_iter().enumerate() {
            match result {
                Ok(response) => {
                    for (key, samples) in response.metrics {
                        let series = routes
                            .by_session
                            .get(&(agent, key))
                            .and_then(|series| run.series.get_mut(*series));
                        if let Some(series) = series {
                            series.samples.extend(samples);
                        }
                    }
                }
                Err(err) => {
                    debug!("Metrics poll failed: {}", err);
                    let owned = routes.series_of_agent.get(agent).map_or(&[][..], Vec::as_slice);
                    for series in owned {
                        if let Some(series) = run.series.get_mut(*series) {
                            series.poll_failures = series.poll_failures.saturating_add(1);
                        }
                    }
                }
            }
        }
    }
}
