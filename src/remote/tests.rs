use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::agent::{Agent, AgentSettings};
use crate::error::{AppError, AppResult, TransportError};
use crate::shutdown::ShutdownSender;
use crate::shutdown_handlers::shutdown_channel;
use crate::wire::{ClientStartRequest, ClientStopRequest, MetricsSince, Protocol};

use super::client::endpoint_url;
use super::{
    AgentControlPort, AgentEndpoint, DiscoveryOptions, RemoteClient, RemoteConfig, discover_agents,
};

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::agent(format!("Failed to build runtime: {}", err)))?;
    runtime.block_on(future)
}

struct TestAgent {
    endpoint: AgentEndpoint,
    discovery: Option<SocketAddr>,
    shutdown_tx: ShutdownSender,
    handle: JoinHandle<()>,
    _log_dir: tempfile::TempDir,
}

impl TestAgent {
    async fn start(api_key: Option<&str>, discovery: bool) -> AppResult<Self> {
        let log_dir = tempfile::tempdir()?;
        let settings = AgentSettings {
            listen_host: "127.0.0.1".to_owned(),
            control_port: 0,
            generator: "/nonexistent/iperf3".to_owned(),
            advertise_ip: Some("127.0.0.1".to_owned()),
            api_key: api_key.map(str::to_owned),
            log_dir: log_dir.path().to_path_buf(),
            discovery_port: 0,
            discovery_enabled: discovery,
            name: Some("loopback".to_owned()),
            ..AgentSettings::default()
        };
        let agent = Agent::bind(settings).await?;
        let addr = agent.local_addr()?;
        let discovery_addr = agent.discovery_addr();
        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        let handle = tokio::spawn(agent.serve(shutdown_rx));
        Ok(Self {
            endpoint: AgentEndpoint::new(format!("http://{}", addr)),
            discovery: discovery_addr,
            shutdown_tx,
            handle,
            _log_dir: log_dir,
        })
    }

    async fn stop(self) -> AppResult<()> {
        if self.shutdown_tx.send(()).is_err() {
            return Err(AppError::agent("Agent already stopped"));
        }
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .map_err(|err| AppError::agent(format!("Agent did not stop: {}", err)))??;
        Ok(())
    }
}

#[test]
fn endpoint_url_requires_http_scheme() -> AppResult<()> {
    let url = endpoint_url("http://10.0.0.5:9001/", "/metrics?since=last")
        .map_err(AppError::transport)?;
    if url.as_str() != "http://10.0.0.5:9001/metrics?since=last" {
        return Err(AppError::agent(format!("Unexpected URL: {}", url)));
    }
    for bad in ["10.0.0.5:9001", "ftp://10.0.0.5", ""] {
        match endpoint_url(bad, "/status") {
            Err(TransportError::InvalidAgentUrl { .. }) => {}
            other => {
                return Err(AppError::agent(format!(
                    "Expected invalid URL for '{}', got {:?}",
                    bad, other
                )));
            }
        }
    }
    Ok(())
}

#[test]
fn status_round_trip_pools_one_client_per_agent() -> AppResult<()> {
    run_async_test(async {
        let agent = TestAgent::start(None, false).await?;
        let client = RemoteClient::default();

        let status = client
            .status(&agent.endpoint)
            .await
            .map_err(AppError::transport)?;
        if status.identity.name.as_deref() != Some("loopback") || !status.sessions.is_empty() {
            return Err(AppError::agent(format!("Unexpected status: {:?}", status)));
        }
        let metrics = client
            .metrics(&agent.endpoint, MetricsSince::Last)
            .await
            .map_err(AppError::transport)?;
        if !metrics.metrics.is_empty() {
            return Err(AppError::agent("Fresh agent must report no metrics"));
        }
        if client.pooled_agents() != 1 {
            return Err(AppError::agent("Expected a single pooled client"));
        }

        client.shutdown().await;
        if client.pooled_agents() != 0 {
            return Err(AppError::agent("Shutdown must release pooled clients"));
        }
        agent.stop().await
    })
}

#[test]
fn wrong_token_maps_to_unauthorized() -> AppResult<()> {
    run_async_test(async {
        let agent = TestAgent::start(Some("secret"), false).await?;
        let client = RemoteClient::default();

        let wrong = agent.endpoint.clone().with_api_key(Some("nope".to_owned()));
        match client.status(&wrong).await {
            Err(TransportError::Unauthorized { .. }) => {}
            other => {
                return Err(AppError::agent(format!(
                    "Expected unauthorized, got {:?}",
                    other
                )));
            }
        }

        let keyed = RemoteClient::new(RemoteConfig {
            default_api_key: Some("secret".to_owned()),
            ..RemoteConfig::default()
        });
        keyed
            .status(&agent.endpoint)
            .await
            .map_err(AppError::transport)?;
        agent.stop().await
    })
}

#[test]
fn agent_error_kinds_survive_the_wire() -> AppResult<()> {
    run_async_test(async {
        let agent = TestAgent::start(None, false).await?;
        let client = RemoteClient::default();

        let mut udp = ClientStartRequest::new("127.0.0.1", 5211);
        udp.proto = Protocol::Udp;
        udp.bidir = true;
        match client.client_start(&agent.endpoint, &udp).await {
            Err(TransportError::Status {
                status: 400,
                kind: Some(kind),
                ..
            }) if kind == "validation" => {}
            other => {
                return Err(AppError::agent(format!(
                    "Expected validation error, got {:?}",
                    other
                )));
            }
        }

        let tcp = ClientStartRequest::new("127.0.0.1", 5211);
        match client.client_start(&agent.endpoint, &tcp).await {
            Err(TransportError::Status {
                status: 500,
                kind: Some(kind),
                ..
            }) if kind == "spawn" => {}
            other => {
                return Err(AppError::agent(format!(
                    "Expected spawn error, got {:?}",
                    other
                )));
            }
        }

        let ack = client
            .client_stop(&agent.endpoint, &ClientStopRequest::default())
            .await
            .map_err(AppError::transport)?;
        if !ack.stopped.is_empty() {
            return Err(AppError::agent("Nothing was running; stop must ack empty"));
        }
        agent.stop().await
    })
}

#[test]
fn unreachable_agent_is_a_retryable_connection_error() -> AppResult<()> {
    run_async_test(async {
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = closed.local_addr()?;
        drop(closed);

        let client = RemoteClient::default();
        match client
            .status(&AgentEndpoint::new(format!("http://{}", addr)))
            .await
        {
            Err(err @ TransportError::Connection { .. }) if err.is_retryable() => Ok(()),
            other => Err(AppError::agent(format!(
                "Expected connection error, got {:?}",
                other
            ))),
        }
    })
}

#[test]
fn discovery_finds_loopback_agent_once() -> AppResult<()> {
    run_async_test(async {
        let agent = TestAgent::start(None, true).await?;
        let port = agent
            .discovery
            .ok_or_else(|| AppError::agent("Discovery socket was not bound"))?
            .port();

        let options = DiscoveryOptions {
            target: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            timeout: Duration::from_millis(500),
            retries: 3,
        };
        let replies = discover_agents(&options).await?;
        match replies.as_slice() {
            [reply] if reply.name == "loopback" && reply.mgmt == "127.0.0.1" => {}
            other => {
                return Err(AppError::agent(format!(
                    "Expected one de-duplicated reply, got {:?}",
                    other
                )));
            }
        }
        agent.stop().await
    })
}
