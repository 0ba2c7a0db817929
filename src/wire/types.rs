use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::metrics::MetricSample;

use super::key::{Role, SessionKey};

/// Magic prefix of a discovery request datagram.
pub const DISCOVERY_MAGIC: &str = "IPERF3_DISCOVER";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_CONTROL_PORT: u16 = 9001;
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;
pub const DEFAULT_BASE_PORT: u16 = 5211;
/// Port used by `server/start` when the request names none.
pub const DEFAULT_SERVER_PORT: u16 = 5201;
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl LifecycleState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

/// Which part of a session's sample sequence a `metrics` call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsSince {
    /// Whole sequence; the read cursor does not move.
    #[default]
    Start,
    /// Samples appended since the previous `Last` fetch.
    Last,
}

impl MetricsSince {
    #[must_use]
    pub const fn as_query(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Last => "last",
        }
    }
}

/// How an agent is addressed and what it reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub base_url: String,
    pub mgmt_ip: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AgentIdentity {
    /// Identity for an agent known only by its configured URL.
    #[must_use]
    pub fn from_base_url(base_url: &str) -> Self {
        let mgmt_ip = url::Url::parse(base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            mgmt_ip,
            version: String::new(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStartRequest {
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bind_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStartResponse {
    pub started: Vec<u16>,
    #[serde(default)]
    pub already_running: Vec<u16>,
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStopRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStopResponse {
    pub stopped: Vec<u16>,
}

/// Canonical `client/start` parameters, after alias normalisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStartRequest {
    pub target: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub proto: Protocol,
    #[serde(default = "default_parallel")]
    pub parallel: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default)]
    pub bidir: bool,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

const fn default_parallel() -> u32 {
    1
}

impl ClientStartRequest {
    #[must_use]
    pub fn new(target: impl Into<String>, port: u16) -> Self {
        Self {
            target: target.into(),
            port,
            duration: None,
            proto: Protocol::Tcp,
            parallel: 1,
            bitrate: None,
            bidir: false,
            reverse: false,
            omit: None,
            length: None,
            window: None,
            bind: None,
            interval: None,
        }
    }

    /// Rejects parameter combinations the generator cannot honour.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty target, port 0, zero parallelism, or a
    /// UDP session that asks for more than one stream or for `--bidir`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.target.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "target" });
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidPort {
                value: self.port.to_string(),
            });
        }
        if self.parallel == 0 {
            return Err(ValidationError::ValueTooSmall { min: 1 });
        }
        if self.proto == Protocol::Udp {
            if self.bidir {
                return Err(ValidationError::UdpBidirectional);
            }
            if self.parallel > 1 {
                return Err(ValidationError::UdpParallel {
                    parallel: self.parallel,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStartResponse {
    pub key: SessionKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStopRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<SessionKey>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStopResponse {
    pub stopped: Vec<SessionKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub metrics: BTreeMap<SessionKey, Vec<MetricSample>>,
    #[serde(default)]
    pub states: BTreeMap<SessionKey, LifecycleState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub key: SessionKey,
    pub role: Role,
    pub port: u16,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
    pub samples: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub identity: AgentIdentity,
    pub sessions: Vec<SessionStatus>,
    pub log_dir: String,
    pub log_dir_writable: bool,
    pub generator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReply {
    pub name: String,
    pub base: String,
    pub port: u16,
    pub mgmt: String,
    pub version: String,
    #[serde(default)]
    pub servers: Vec<u16>,
}

impl DiscoveryReply {
    #[must_use]
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            base_url: self.base.clone(),
            mgmt_ip: self.mgmt.clone(),
            version: self.version.clone(),
            name: Some(self.name.clone()),
        }
    }
}
