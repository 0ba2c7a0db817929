use futures_util::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::remote::{AgentControlPort, AgentEndpoint};
use crate::wire::{ClientStopRequest, ServerStopRequest, SessionKey};

use super::{ActiveSessions, Orchestrator, RunContext};

impl<TPort> Orchestrator<TPort>
where
    TPort: AgentControlPort + Sync,
{
    /// Stops every active client session. Each stop is bounded by the stop
    /// grace period; sessions on agents that do not answer in time are left
    /// running and logged.
    pub(super) async fn stop_clients(&self, ctx: &RunContext, active: &ActiveSessions) {
        let stops = active.iter().filter_map(|(index, keys)| {
            ctx.clients
                .get(*index)
                .map(|endpoint| self.stop_client_keys(endpoint, keys.clone()))
        });
        join_all(stops).await;
    }

    pub(super) async fn stop_client_keys(&self, endpoint: &AgentEndpoint, keys: Vec<SessionKey>) {
        let request = ClientStopRequest { keys: Some(keys) };
        match timeout(self.config.stop_grace, self.port.client_stop(endpoint, &request)).await {
            Ok(Ok(ack)) => debug!("client/stop on {}: {:?}", endpoint.base_url, ack.stopped),
            Ok(Err(err)) => warn!(
                "client/stop on {} failed: {}; sessions {:?} may need manual cleanup",
                endpoint.base_url, err, request.keys
            ),
            Err(_elapsed) => warn!(
                "client/stop on {} timed out after {:?}; sessions {:?} may need manual cleanup",
                endpoint.base_url, self.config.stop_grace, request.keys
            ),
        }
    }

    pub(super) async fn stop_servers(&self, ctx: &RunContext, keep_open: bool) {
        if keep_open {
            info!(
                "Leaving server ports {:?} open on {}",
                ctx.server_request.ports, ctx.server.base_url
            );
            return;
        }
        self.stop_server_ports(ctx, ctx.server_request.ports.clone())
            .await;
    }

    pub(super) async fn stop_server_ports(&self, ctx: &RunContext, ports: Vec<u16>) {
        let request = ServerStopRequest { ports: Some(ports) };
        match timeout(
            self.config.stop_grace,
            self.port.server_stop(&ctx.server, &request),
        )
        .await
        {
            Ok(Ok(ack)) => info!("server/stop on {}: {:?}", ctx.server.base_url, ack.stopped),
            Ok(Err(err)) => warn!(
                "server/stop on {} failed: {}; ports {:?} may need manual cleanup",
                ctx.server.base_url, err, request.ports
            ),
            Err(_elapsed) => warn!(
                "server/stop on {} timed out after {:?}; ports {:?} may need manual cleanup",
                ctx.server.base_url, self.config.stop_grace, request.ports
            ),
        }
    }
}
