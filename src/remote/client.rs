use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::wire::{
    API_KEY_HEADER, ClientStartRequest, ClientStartResponse, ClientStopRequest,
    ClientStopResponse, ErrorBody, MetricsResponse, MetricsSince, ServerStartRequest,
    ServerStartResponse, ServerStopRequest, ServerStopResponse, StatusResponse,
};

use super::{AgentControlPort, AgentEndpoint};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1_500);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(6);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 4;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Bound on `metrics` and `status` calls.
    pub poll_timeout: Duration,
    /// Bound on start/stop calls.
    pub command_timeout: Duration,
    /// Token sent to agents whose endpoint carries none.
    pub default_api_key: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            default_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    ServerStart,
    ServerStop,
    ClientStart,
    ClientStop,
    Metrics(MetricsSince),
    Status,
}

impl Operation {
    const fn name(self) -> &'static str {
        match self {
            Self::ServerStart => "server/start",
            Self::ServerStop => "server/stop",
            Self::ClientStart => "client/start",
            Self::ClientStop => "client/stop",
            Self::Metrics(_) => "metrics",
            Self::Status => "status",
        }
    }

    const fn is_poll(self) -> bool {
        matches!(self, Self::Metrics(_) | Self::Status)
    }

    fn method(self) -> Method {
        if self.is_poll() { Method::GET } else { Method::POST }
    }

    fn path(self) -> String {
        match self {
            Self::Metrics(since) => format!("/metrics?since={}", since.as_query()),
            Self::ServerStart | Self::ServerStop | Self::ClientStart | Self::ClientStop | Self::Status => {
                format!("/{}", self.name())
            }
        }
    }
}

/// One pooled keep-alive client per agent address.
#[derive(Debug, Default)]
pub struct RemoteClient {
    config: RemoteConfig,
    pool: Mutex<HashMap<String, Client>>,
}

impl RemoteClient {
    #[must_use]
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(HashMap::new()),
        }
    }

    fn pool(&self) -> MutexGuard<'_, HashMap<String, Client>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client_for(&self, base_url: &str) -> Result<Client, TransportError> {
        if let Some(client) = self.pool().get(base_url) {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .tcp_nodelay(true)
            .build()
            .map_err(|source| TransportError::BuildClient { source })?;
        self.pool()
            .entry(base_url.to_owned())
            .or_insert_with(|| client.clone());
        Ok(client)
    }

    fn evict(&self, base_url: &str) {
        if self.pool().remove(base_url).is_some() {
            debug!("Evicted pooled connection to {}", base_url);
        }
    }

    /// Number of agents with a pooled client.
    #[must_use]
    pub fn pooled_agents(&self) -> usize {
        self.pool().len()
    }

    async fn call<TRequest, TResponse>(
        &self,
        agent: &AgentEndpoint,
        operation: Operation,
        payload: Option<&TRequest>,
    ) -> Result<TResponse, TransportError>
    where
        TRequest: Serialize + Sync,
        TResponse: DeserializeOwned,
    {
        match self.call_once(agent, operation, payload).await {
            Err(TransportError::Connection { source, .. }) if source.is_connect() => {
                debug!(
                    "{} on {} could not connect; retrying on a fresh connection",
                    operation.name(),
                    agent.base_url
                );
                self.evict(&agent.base_url);
                self.call_once(agent, operation, payload).await
            }
            other => other,
        }
    }

    async fn call_once<TRequest, TResponse>(
        &self,
        agent: &AgentEndpoint,
        operation: Operation,
        payload: Option<&TRequest>,
    ) -> Result<TResponse, TransportError>
    where
        TRequest: Serialize + Sync,
        TResponse: DeserializeOwned,
    {
        let url = endpoint_url(&agent.base_url, &operation.path())?;
        let timeout = if operation.is_poll() {
            self.config.poll_timeout
        } else {
            self.config.command_timeout
        };
        let client = self.client_for(&agent.base_url)?;
        let mut request = client.request(operation.method(), url).timeout(timeout);
        if let Some(key) = agent
            .api_key
            .as_deref()
            .or(self.config.default_api_key.as_deref())
        {
            request = request.header(API_KEY_HEADER, key);
        }
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        let transport = |source: reqwest::Error| {
            if source.is_timeout() {
                TransportError::Timeout {
                    agent: agent.base_url.clone(),
                    operation: operation.name(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
            } else {
                TransportError::Connection {
                    agent: agent.base_url.clone(),
                    operation: operation.name(),
                    source,
                }
            }
        };

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!("{} on {} rejected the API key", operation.name(), agent.base_url);
            return Err(TransportError::Unauthorized {
                agent: agent.base_url.clone(),
                operation: operation.name(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.map_err(transport)?;
            let (kind, message) = match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => (body.kind, body.error),
                Err(_) => (None, text.trim().to_owned()),
            };
            return Err(TransportError::Status {
                agent: agent.base_url.clone(),
                operation: operation.name(),
                status: status.as_u16(),
                kind,
                message,
            });
        }
        response.json::<TResponse>().await.map_err(|source| {
            if source.is_timeout() {
                transport(source)
            } else {
                TransportError::Decode {
                    agent: agent.base_url.clone(),
                    operation: operation.name(),
                    source,
                }
            }
        })
    }
}

pub(super) fn endpoint_url(base_url: &str, path: &str) -> Result<url::Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidAgentUrl {
        value: base_url.to_owned(),
        reason,
    };
    let base = url::Url::parse(base_url).map_err(|err| invalid(err.to_string()))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", base.scheme())));
    }
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    url::Url::parse(&joined).map_err(|err| invalid(err.to_string()))
}

/// Request type of calls that send no body.
type NoBody = ();

#[async_trait]
impl AgentControlPort for RemoteClient {
    async fn server_start(
        &self,
        agent: &AgentEndpoint,
        request: &ServerStartRequest,
    ) -> Result<ServerStartResponse, TransportError> {
        self.call(agent, Operation::ServerStart, Some(request)).await
    }

    async fn server_stop(
        &self,
        agent: &AgentEndpoint,
        request: &ServerStopRequest,
    ) -> Result<ServerStopResponse, TransportError> {
        self.call(agent, Operation::ServerStop, Some(request)).await
    }

    async fn client_start(
        &self,
        agent: &AgentEndpoint,
        request: &ClientStartRequest,
    ) -> Result<ClientStartResponse, TransportError> {
        self.call(agent, Operation::ClientStart, Some(request)).await
    }

    async fn client_stop(
        &self,
        agent: &AgentEndpoint,
        request: &ClientStopRequest,
    ) -> Result<ClientStopResponse, TransportError> {
        self.call(agent, Operation::ClientStop, Some(request)).await
    }

    async fn metrics(
        &self,
        agent: &AgentEndpoint,
        since: MetricsSince,
    ) -> Result<MetricsResponse, TransportError> {
        self.call::<NoBody, _>(agent, Operation::Metrics(since), None)
            .await
    }

    async fn status(&self, agent: &AgentEndpoint) -> Result<StatusResponse, TransportError> {
        self.call::<NoBody, _>(agent, Operation::Status, None).await
    }

    async fn shutdown(&self) {
        let released = {
            let mut pool = self.pool();
            let count = pool.len();
            pool.clear();
            count
        };
        debug!("Released {} pooled agent connection(s)", released);
    }
}
