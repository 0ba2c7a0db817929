use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::args::parsers::{parse_duration_arg, parse_port_list};
use crate::error::{ConfigError, ValidationError};

/// Agent settings read from `iperf-mesh.toml` / `iperf-mesh.json`. Every
/// field is optional; flags given on the command line win.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfigFile {
    #[serde(alias = "bind_host")]
    pub listen_host: Option<String>,
    #[serde(alias = "control_port")]
    pub port: Option<u16>,
    #[serde(alias = "iperf3_path")]
    pub generator: Option<String>,
    pub autostart: Option<PortsValue>,
    pub advertise_ip: Option<String>,
    #[serde(alias = "api_token")]
    pub api_key: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub discovery_port: Option<u16>,
    pub discovery: Option<bool>,
    pub stop_grace: Option<DurationValue>,
    pub max_servers: Option<usize>,
    pub max_clients: Option<usize>,
    pub name: Option<String>,
}

/// Either `[5211, 5212]` or `"5211,5212"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortsValue {
    List(Vec<u16>),
    Text(String),
}

impl PortsValue {
    pub(crate) fn to_ports(&self) -> Result<Vec<u16>, ConfigError> {
        match self {
            Self::List(ports) => {
                if let Some(zero) = ports.iter().find(|port| **port == 0) {
                    return Err(ConfigError::InvalidAutostartPort {
                        value: format!("{:?}", ports),
                        source: ValidationError::InvalidPort {
                            value: zero.to_string(),
                        },
                    });
                }
                Ok(ports.clone())
            }
            Self::Text(text) => {
                parse_port_list(text).map_err(|source| ConfigError::InvalidAutostartPort {
                    value: text.clone(),
                    source,
                })
            }
        }
    }
}

/// Whole seconds, or text with a unit such as `"1500ms"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub(crate) fn to_duration(&self, field: &'static str) -> Result<Duration, ConfigError> {
        let parsed = match self {
            Self::Seconds(0) => Err(ValidationError::DurationZero),
            Self::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            Self::Text(text) => parse_duration_arg(text),
        };
        parsed.map_err(|source| ConfigError::InvalidField { field, source })
    }
}
