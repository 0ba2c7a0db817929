use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::validate_bitrate;
use crate::error::ValidationError;
use crate::wire::{ClientStartRequest, DEFAULT_BASE_PORT, Protocol, SessionKey};

const MIN_PORT: u32 = 1024;
const MAX_PORT: u32 = 65_535;
const MIN_POLL_INTERVAL_MS: u64 = 200;

/// Direction layout of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Bidir,
    UpOnly,
    DownOnly,
    /// Two concurrent sessions per client, one per direction.
    Dual,
    /// Upload for the first half of the duration, then download.
    TwoPhase,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bidir => "bidir",
            Self::UpOnly => "up_only",
            Self::DownOnly => "down_only",
            Self::Dual => "dual",
            Self::TwoPhase => "two_phase",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bidir" => Ok(Self::Bidir),
            "up_only" | "up" => Ok(Self::UpOnly),
            "down_only" | "down" => Ok(Self::DownOnly),
            "dual" => Ok(Self::Dual),
            "two_phase" => Ok(Self::TwoPhase),
            _ => Err(ValidationError::InvalidMode {
                value: value.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bind_map: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// One client agent and the parameters that override the plan defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientEntry {
    #[serde(default)]
    pub name: String,
    pub agent: String,
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bidir: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Orchestrator input, read from the plan JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    pub server: ServerEntry,
    pub clients: Vec<ClientEntry>,
    #[serde(default)]
    pub mode: Mode,
    pub duration_sec: u64,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_keep_servers_open")]
    pub keep_servers_open: bool,
    #[serde(default)]
    pub proto: Protocol,
    #[serde(default = "default_parallel")]
    pub parallel: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omit: Option<u32>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_sec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

const fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

const fn default_keep_servers_open() -> bool {
    true
}

const fn default_parallel() -> u32 {
    1
}

const fn default_poll_interval() -> f64 {
    1.0
}

impl Default for TestPlan {
    fn default() -> Self {
        Self {
            server: ServerEntry::default(),
            clients: Vec::new(),
            mode: Mode::default(),
            duration_sec: 0,
            base_port: default_base_port(),
            keep_servers_open: default_keep_servers_open(),
            proto: Protocol::Tcp,
            parallel: default_parallel(),
            bitrate: None,
            omit: None,
            poll_interval_sec: default_poll_interval(),
            api_key: None,
        }
    }
}

/// Which part of a run a client session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Runs for the whole duration.
    Main,
    Upload,
    Download,
}

/// One generator session the plan asks a client agent to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leg {
    pub client: usize,
    pub stage: Stage,
    pub request: ClientStartRequest,
}

impl Leg {
    #[must_use]
    pub const fn key(&self) -> SessionKey {
        SessionKey::client(self.request.port)
    }
}

impl TestPlan {
    /// # Errors
    ///
    /// Returns the first constraint the plan violates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.clients.is_empty() {
            return Err(ValidationError::NoClients);
        }
        if self.duration_sec == 0 {
            return Err(ValidationError::DurationZero);
        }
        if self.mode == Mode::TwoPhase && self.duration_sec < 2 {
            return Err(ValidationError::TwoPhaseTooShort {
                duration_sec: self.duration_sec,
            });
        }
        let min_interval = Duration::from_millis(MIN_POLL_INTERVAL_MS).as_secs_f64();
        if !self.poll_interval_sec.is_finite() || self.poll_interval_sec < min_interval {
            return Err(ValidationError::PollIntervalTooSmall {
                min_ms: MIN_POLL_INTERVAL_MS,
            });
        }
        validate_agent_url(&self.server.agent)?;

        let first = u32::from(self.base_port);
        let port_count = u32::try_from(self.clients.len())
            .unwrap_or(u32::MAX)
            .saturating_mul(u32::from(self.ports_per_client()));
        let last = first.saturating_add(port_count).saturating_sub(1);
        if first < MIN_PORT || last > MAX_PORT {
            return Err(ValidationError::PortRangeOutOfBounds { first, last });
        }

        for (index, client) in self.clients.iter().enumerate() {
            self.validate_client(index, client)
                .map_err(|err| ValidationError::for_client(self.client_name(index), err))?;
        }
        Ok(())
    }

    fn validate_client(&self, index: usize, client: &ClientEntry) -> Result<(), ValidationError> {
        validate_agent_url(&client.agent)?;
        if client.target.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "target" });
        }
        if let Some(bitrate) = client.bitrate.as_deref().or(self.bitrate.as_deref()) {
            validate_bitrate(bitrate)?;
        }
        for leg in self.legs_for(index)? {
            leg.request.validate()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_sec)
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_millis(MIN_POLL_INTERVAL_MS))
    }

    /// Seconds of each running phase: one entry, or two for `two_phase`.
    #[must_use]
    pub fn phase_durations(&self) -> Vec<u64> {
        if self.mode == Mode::TwoPhase {
            let upload = self.duration_sec / 2;
            vec![upload, self.duration_sec.saturating_sub(upload)]
        } else {
            vec![self.duration_sec]
        }
    }

    const fn ports_per_client(&self) -> u16 {
        if matches!(self.mode, Mode::Dual) { 2 } else { 1 }
    }

    /// Server ports covering every client leg, in client order.
    #[must_use]
    pub fn server_ports(&self) -> Vec<u16> {
        let total = self
            .clients
            .len()
            .saturating_mul(usize::from(self.ports_per_client()));
        (0..total)
            .filter_map(|offset| {
                u16::try_from(offset)
                    .ok()
                    .and_then(|offset| self.base_port.checked_add(offset))
            })
            .collect()
    }

    #[must_use]
    pub fn client_name(&self, index: usize) -> String {
        self.clients
            .get(index)
            .map(|client| client.name.trim())
            .filter(|name| !name.is_empty())
            .map_or_else(|| format!("client{}", index), str::to_owned)
    }

    /// Every session the plan runs, across all clients and stages.
    ///
    /// # Errors
    ///
    /// Returns an error when a client's port falls outside the port space.
    pub fn legs(&self) -> Result<Vec<Leg>, ValidationError> {
        let mut legs = Vec::new();
        for index in 0..self.clients.len() {
            legs.extend(self.legs_for(index)?);
        }
        Ok(legs)
    }

    fn legs_for(&self, index: usize) -> Result<Vec<Leg>, ValidationError> {
        let Some(client) = self.clients.get(index) else {
            return Ok(Vec::new());
        };
        let durations = self.phase_durations();
        let first_secs = durations.first().copied().unwrap_or(self.duration_sec);
        let per_client = u32::from(self.ports_per_client());
        let offset = u32::try_from(index)
            .ok()
            .and_then(|index| index.checked_mul(per_client));
        let port = |extra: u32| -> Result<u16, ValidationError> {
            offset
                .and_then(|offset| offset.checked_add(extra))
                .and_then(|offset| u32::from(self.base_port).checked_add(offset))
                .and_then(|port| u16::try_from(port).ok())
                .ok_or_else(|| ValidationError::InvalidPort {
                    value: format!("{}+{}", self.base_port, index),
                })
        };

        let legs = match self.mode {
            Mode::Bidir | Mode::UpOnly | Mode::DownOnly => {
                let mut request = self.client_request(client, port(0)?, first_secs);
                request.bidir = client.bidir.unwrap_or(self.mode == Mode::Bidir);
                request.reverse = client.reverse.unwrap_or(self.mode == Mode::DownOnly);
                vec![Leg {
                    client: index,
                    stage: Stage::Main,
                    request,
                }]
            }
            Mode::Dual => {
                let upload = self.client_request(client, port(0)?, first_secs);
                let mut download = self.client_request(client, port(1)?, first_secs);
                download.reverse = true;
                vec![
                    Leg {
                        client: index,
                        stage: Stage::Upload,
                        request: upload,
                    },
                    Leg {
                        client: index,
                        stage: Stage::Download,
                        request: download,
                    },
                ]
            }
            Mode::TwoPhase => {
                let down_secs = durations.get(1).copied().unwrap_or(first_secs);
                let upload = self.client_request(client, port(0)?, first_secs);
                let mut download = self.client_request(client, port(0)?, down_secs);
                download.reverse = true;
                vec![
                    Leg {
                        client: index,
                        stage: Stage::Upload,
                        request: upload,
                    },
                    Leg {
                        client: index,
                        stage: Stage::Download,
                        request: download,
                    },
                ]
            }
        };
        Ok(legs)
    }

    fn client_request(&self, client: &ClientEntry, port: u16, duration: u64) -> ClientStartRequest {
        let mut request = ClientStartRequest::new(client.target.trim(), port);
        request.duration = Some(duration);
        request.proto = client.proto.unwrap_or(self.proto);
        request.parallel = client.parallel.unwrap_or(self.parallel);
        request.bitrate = client.bitrate.clone().or_else(|| self.bitrate.clone());
        request.omit = self.omit;
        request.bind = client.bind.clone();
        request
    }
}

fn validate_agent_url(value: &str) -> Result<(), ValidationError> {
    let valid = url::Url::parse(value.trim())
        .ok()
        .is_some_and(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidAgentUrl {
            value: value.to_owned(),
        })
    }
}
