//! Calls into remote agents: a pooled HTTP client for the control plane
//! and the broadcast discovery client.
mod client;
mod discovery;

#[cfg(test)]
mod tests;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::wire::{
    ClientStartRequest, ClientStartResponse, ClientStopRequest, ClientStopResponse,
    MetricsResponse, MetricsSince, ServerStartRequest, ServerStartResponse, ServerStopRequest,
    ServerStopResponse, StatusResponse,
};

pub use client::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_POLL_TIMEOUT, RemoteClient, RemoteConfig};
pub use discovery::{DiscoveryOptions, discover_agents};

/// Where an agent lives and which token to present to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl AgentEndpoint {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: None,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.is_empty());
        self
    }
}

/// The control-plane operations the orchestrator drives. Every call is
/// bounded by a timeout; failures are reported, never retried indefinitely.
#[async_trait]
pub trait AgentControlPort {
    async fn server_start(
        &self,
        agent: &AgentEndpoint,
        request: &ServerStartRequest,
    ) -> Result<ServerStartResponse, TransportError>;

    async fn server_stop(
        &self,
        agent: &AgentEndpoint,
        request: &ServerStopRequest,
    ) -> Result<ServerStopResponse, TransportError>;

    async fn client_start(
        &self,
        agent: &AgentEndpoint,
        request: &ClientStartRequest,
    ) -> Result<ClientStartResponse, TransportError>;

    async fn client_stop(
        &self,
        agent: &AgentEndpoint,
        request: &ClientStopRequest,
    ) -> Result<ClientStopResponse, TransportError>;

    async fn metrics(
        &self,
        agent: &AgentEndpoint,
        since: MetricsSince,
    ) -> Result<MetricsResponse, TransportError>;

    async fn status(&self, agent: &AgentEndpoint) -> Result<StatusResponse, TransportError>;

    /// Releases pooled connections.
    async fn shutdown(&self);
}
