use futures_util::future::join_all;
use tracing::{info, warn};

use crate::error::{RunFailure, TransportError};
use crate::remote::AgentControlPort;
use crate::wire::SessionKey;

use super::plan::Stage;
use super::run::{ClientFailure, TestRun};
use super::{ActiveSessions, Orchestrator, RunContext};

impl<TPort> Orchestrator<TPort>
where
    TPort: AgentControlPort + Sync,
{
    /// Opens every server port of the plan. Ports already open count as
    /// started.
    pub(super) async fn start_servers(
        &self,
        ctx: &RunContext,
        keep_open: bool,
    ) -> Result<(), RunFailure> {
        let request = &ctx.server_request;
        let agent = ctx.server.base_url.clone();
        let response = match self.port.server_start(&ctx.server, request).await {
            Ok(response) => response,
            Err(source) if source.is_retryable() => {
                return Err(RunFailure::ServerUnreachable { agent, source });
            }
            Err(source) => {
                return Err(RunFailure::ServerStartRejected {
                    agent,
                    ports: format!("{:?} ({})", request.ports, source),
                });
            }
        };

        let failed: Vec<String> = request
            .ports
            .iter()
            .filter(|port| {
                !response.started.contains(port) && !response.already_running.contains(port)
            })
            .map(|port| {
                response
                    .errors
                    .get(&port.to_string())
                    .map_or_else(|| port.to_string(), |message| format!("{} ({})", port, message))
            })
            .collect();
        if failed.is_empty() {
            info!(
                "server/start on {}: started={:?} already_running={:?}",
                agent, response.started, response.already_running
            );
            return Ok(());
        }

        if !keep_open && !response.started.is_empty() {
            self.stop_server_ports(ctx, response.started.clone()).await;
        }
        Err(RunFailure::ServerStartRejected {
            agent,
            ports: failed.join(", "),
        })
    }

    /// Starts the legs of `stages` on every client, or only on the clients
    /// in `only`. Clients that fail are recorded in `run.failures` and left
    /// out of the returned sessions.
    pub(super) async fn start_clients(
        &self,
        ctx: &RunContext,
        run: &mut TestRun,
        stages: &[Stage],
        only: Option<&ActiveSessions>,
    ) -> ActiveSessions {
        let candidates: Vec<usize> = (0..ctx.clients.len())
            .filter(|index| only.is_none_or(|active| active.contains_key(index)))
            .collect();
        let results = join_all(
            candidates
                .iter()
                .map(|index| self.start_client(ctx, *index, stages)),
        )
        .await;

        let mut active = ActiveSessions::new();
        for (index, result) in candidates.into_iter().zip(results) {
            let name = run.plan.client_name(index);
            match result {
                Ok(keys) => {
                    info!("{} started {:?}", name, keys);
                    active.insert(index, keys);
                }
                Err(err) => {
                    warn!("{} failed to start: {}", name, err);
                    run.failures.push(ClientFailure {
                        name,
                        agent: ctx
                            .clients
                            .get(index)
                            .map(|endpoint| endpoint.base_url.clone())
                            .unwrap_or_default(),
                        error: err.to_string(),
                    });
                }
            }
        }
        active
    }

    /// A client counts as started only when every one of its legs started;
    /// otherwise the legs that did start are stopped again.
    async fn start_client(
        &self,
        ctx: &RunContext,
        index: usize,
        stages: &[Stage],
    ) -> Result<Vec<SessionKey>, TransportError> {
        let Some(endpoint) = ctx.clients.get(index) else {
            return Ok(Vec::new());
        };
        let mut started = Vec::new();
        for leg in ctx
            .legs
            .iter()
            .filter(|leg| leg.client == index && stages.contains(&leg.stage))
        {
            match self.port.client_start(endpoint, &leg.request).await {
                Ok(response) => started.push(response.key),
                Err(err) => {
                    if !started.is_empty() {
                        self.stop_client_keys(endpoint, started).await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(started)
    }
}
