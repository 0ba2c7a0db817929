//! The host-local agent: control plane, discovery responder, and the
//! supervisor that owns generator sessions.
mod control;
mod discovery;
mod handlers;
mod http;
mod identity;
mod normalize;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

use crate::error::{AgentError, AppError, AppResult};
use crate::shutdown::{ShutdownReceiver, ShutdownSender};
use crate::supervisor::{
    DEFAULT_MAX_CLIENTS, DEFAULT_MAX_SERVERS, DEFAULT_STOP_GRACE, GeneratorConfig, SessionParams,
    Supervisor, probe_version, resolve_generator,
};
use crate::wire::{AGENT_VERSION, AgentIdentity, DEFAULT_CONTROL_PORT, DEFAULT_DISCOVERY_PORT};

pub use identity::{advertise_ip, host_name};
#[cfg(feature = "fuzzing")]
pub(crate) use normalize::normalize_client_start;
pub(crate) use normalize::validate_bitrate;

/// Resolved agent settings (CLI flags merged over the config file).
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub listen_host: String,
    pub control_port: u16,
    pub generator: String,
    pub autostart: Vec<u16>,
    pub advertise_ip: Option<String>,
    pub api_key: Option<String>,
    pub log_dir: PathBuf,
    pub discovery_port: u16,
    pub discovery_enabled: bool,
    pub stop_grace: Duration,
    pub max_servers: usize,
    pub max_clients: usize,
    pub name: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_owned(),
            control_port: DEFAULT_CONTROL_PORT,
            generator: "iperf3".to_owned(),
            autostart: Vec::new(),
            advertise_ip: None,
            api_key: None,
            log_dir: default_log_dir(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_enabled: true,
            stop_grace: DEFAULT_STOP_GRACE,
            max_servers: DEFAULT_MAX_SERVERS,
            max_clients: DEFAULT_MAX_CLIENTS,
            name: None,
        }
    }
}

#[must_use]
pub fn default_log_dir() -> PathBuf {
    std::env::temp_dir().join("iperf-mesh").join("logs")
}

/// State shared by every connection handler and the discovery responder.
#[derive(Debug)]
pub(crate) struct AgentState {
    supervisor: Supervisor,
    identity: AgentIdentity,
    control_port: u16,
    api_key: Option<String>,
    log_dir: PathBuf,
    log_dir_writable: bool,
    generator: String,
}

/// A bound agent that has not started serving yet.
pub struct Agent {
    state: Arc<AgentState>,
    listener: TcpListener,
    discovery: Option<UdpSocket>,
    autostart: Vec<u16>,
}

impl Agent {
    /// Binds the control listener and, when enabled, the discovery socket.
    ///
    /// # Errors
    ///
    /// Returns an error when the control listener cannot be bound.
    pub async fn bind(settings: AgentSettings) -> AppResult<Self> {
        let addr = format!("{}:{}", settings.listen_host, settings.control_port);
        let listener = TcpListener::bind(&addr).await.map_err(|err| {
            AppError::agent(AgentError::Bind {
                addr: addr.clone(),
                source: err,
            })
        })?;
        let control_port = listener
            .local_addr()
            .map_err(|err| {
                AppError::agent(AgentError::Io {
                    context: "read control listener address",
                    source: err,
                })
            })?
            .port();

        let discovery = if settings.discovery_enabled {
            bind_discovery(&settings.listen_host, settings.discovery_port).await
        } else {
            None
        };

        let log_dir_writable = prepare_log_dir(&settings.log_dir).await;
        let program = resolve_generator(&settings.generator).unwrap_or_else(|| {
            warn!(
                "{}; sessions will fail to spawn until it is installed",
                AgentError::GeneratorNotFound {
                    program: settings.generator.clone(),
                }
            );
            PathBuf::from(&settings.generator)
        });
        let generator = probe_version(&program).await.map_or_else(
            || program.display().to_string(),
            |version| format!("{} ({})", program.display(), version),
        );

        let mut generator_config = GeneratorConfig::new(program);
        generator_config.log_dir = log_dir_writable.then(|| settings.log_dir.clone());
        generator_config.stop_grace = settings.stop_grace;
        generator_config.max_servers = settings.max_servers;
        generator_config.max_clients = settings.max_clients;

        let mgmt_ip = advertise_ip(settings.advertise_ip.as_deref(), &settings.listen_host);
        let identity = AgentIdentity {
            base_url: control_base_url(&mgmt_ip, control_port),
            mgmt_ip,
            version: AGENT_VERSION.to_owned(),
            name: Some(settings.name.clone().unwrap_or_else(host_name)),
        };

        let state = AgentState {
            supervisor: Supervisor::new(generator_config),
            identity,
            control_port,
            api_key: settings.api_key.filter(|key| !key.is_empty()),
            log_dir: settings.log_dir,
            log_dir_writable,
            generator,
        };

        Ok(Self {
            state: Arc::new(state),
            listener,
            discovery,
            autostart: settings.autostart,
        })
    }

    /// # Errors
    ///
    /// Returns an error when the listener address cannot be read.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        self.listener.local_addr().map_err(|err| {
            AppError::agent(AgentError::Io {
                context: "read control listener address",
                source: err,
            })
        })
    }

    #[must_use]
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    #[must_use]
    pub fn identity(&self) -> &AgentIdentity {
        &self.state.identity
    }

    /// Serves control requests until shutdown, then stops every session.
    pub async fn serve(self, shutdown_rx: ShutdownReceiver) {
        let Self {
            state,
            listener,
            discovery,
            autostart,
        } = self;
        info!(
            "Agent {} serving control plane on {} (auth={})",
            state.identity.base_url,
            listener
                .local_addr()
                .map_or_else(|_err| "unknown".to_owned(), |addr| addr.to_string()),
            state.api_key.is_some()
        );

        let discovery_handle = discovery.map(|socket| {
            tokio::spawn(discovery::run_discovery_responder(
                Arc::clone(&state),
                socket,
                shutdown_rx.resubscribe(),
            ))
        });
        if !autostart.is_empty() {
            tokio::spawn(autostart_servers(Arc::clone(&state), autostart));
        }

        accept_connections(Arc::clone(&state), listener, shutdown_rx).await;

        info!("Agent shutting down; stopping sessions");
        state.supervisor.shutdown().await;
        if let Some(handle) = discovery_handle
            && handle.await.is_err()
        {
            warn!("Discovery responder ended abnormally");
        }
    }
}

/// Runs the agent until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the control listener cannot be bound.
pub async fn run_agent(settings: AgentSettings, shutdown_tx: &ShutdownSender) -> AppResult<()> {
    let agent = Agent::bind(settings).await?;
    agent.serve(shutdown_tx.subscribe()).await;
    Ok(())
}

async fn accept_connections(
    state: Arc<AgentState>,
    listener: TcpListener,
    mut shutdown_rx: ShutdownReceiver,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(result) => result,
                Err(err) => {
                    warn!("Failed to accept control connection: {}", err);
                    continue;
                }
            },
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let peer = peer.to_string();
            handlers::handle_connection(state, socket, &peer).await;
        });
    }
}

fn control_base_url(host: &str, port: u16) -> String {
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("http://[{}]:{}", host, port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

async fn bind_discovery(host: &str, port: u16) -> Option<UdpSocket> {
    let addr = format!("{}:{}", host, port);
    match UdpSocket::bind(&addr).await {
        Ok(socket) => {
            if let Err(err) = socket.set_broadcast(true) {
                warn!("Cannot enable broadcast on discovery socket: {}", err);
            }
            Some(socket)
        }
        Err(err) => {
            warn!("Discovery disabled: cannot bind udp://{}: {}", addr, err);
            None
        }
    }
}

async fn prepare_log_dir(path: &std::path::Path) -> bool {
    if let Err(err) = tokio::fs::create_dir_all(path).await {
        warn!(
            "{} ({})",
            AgentError::LogDirUnavailable {
                path: path.display().to_string(),
            },
            err
        );
        return false;
    }
    let probe = path.join(".write-test");
    match tokio::fs::write(&probe, b"ok").await {
        Ok(()) => {
            if let Err(err) = tokio::fs::remove_file(&probe).await {
                warn!("Failed to remove {}: {}", probe.display(), err);
            }
            true
        }
        Err(err) => {
            warn!(
                "{} ({})",
                AgentError::LogDirUnavailable {
                    path: path.display().to_string(),
                },
                err
            );
            false
        }
    }
}

/// Boot-time server sessions; failures are logged and the agent keeps going.
async fn autostart_servers(state: Arc<AgentState>, ports: Vec<u16>) {
    for port in ports {
        match state
            .supervisor
            .start(SessionParams::Server { port, bind: None })
            .await
        {
            Ok(key) => info!("Autostarted {}", key),
            Err(err) => warn!("Autostart of server port {} failed: {}", port, err),
        }
    }
}
