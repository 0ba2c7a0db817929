use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use super::parsers::{parse_bool_env, parse_duration_arg, parse_port};

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Coordinate iperf3 throughput tests across many hosts: run an agent on each host, then drive servers and clients from one controller."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging (debug level unless IPERF_MESH_LOG/RUST_LOG say otherwise)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Disable color output
    #[arg(long = "no-color", env = "NO_COLOR", value_parser = parse_bool_env, global = true)]
    pub no_color: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the host agent until SIGINT/SIGTERM
    Agent(AgentArgs),
    /// Drive one test run from a plan file
    Run(RunArgs),
    /// Find agents on the local network
    Discover(DiscoverArgs),
    /// Print one agent's status document
    Status(StatusArgs),
}

#[derive(Debug, Args, Clone)]
pub struct AgentArgs {
    /// Agent config file (.toml or .json); defaults to iperf-mesh.toml/.json in the working directory
    #[arg(long)]
    pub config: Option<String>,

    /// Address the control plane listens on
    #[arg(long = "listen-host", alias = "host", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Control plane port
    #[arg(long, short = 'p', default_value_t = crate::wire::DEFAULT_CONTROL_PORT)]
    pub port: u16,

    /// iperf3 binary, resolved against PATH
    #[arg(long, default_value = "iperf3")]
    pub generator: String,

    /// Server ports opened at boot (comma separated)
    #[arg(long, value_delimiter = ',', value_parser = parse_port)]
    pub autostart: Vec<u16>,

    /// Address advertised to controllers; detected when unset
    #[arg(long = "advertise-ip", env = "AGENT_MGMT_IP")]
    pub advertise_ip: Option<String>,

    /// Token required on every control request
    #[arg(long = "api-key", env = AGENT_API_KEY_ENV, hide_env_values = true)]
    pub api_key: Option<String>,

    /// Directory for per-session generator logs
    #[arg(long = "log-dir", env = "AGENT_LOGDIR")]
    pub log_dir: Option<PathBuf>,

    /// UDP port of the discovery responder
    #[arg(long = "discovery-port", default_value_t = crate::wire::DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    /// Do not answer discovery broadcasts
    #[arg(long = "no-discovery")]
    pub no_discovery: bool,

    /// Time a session gets to exit after SIGTERM before it is killed (ms/s/m/h)
    #[arg(long = "stop-grace", default_value = "2s", value_parser = parse_duration_arg)]
    pub stop_grace: Duration,

    /// Maximum concurrent server sessions
    #[arg(long = "max-servers", default_value_t = crate::supervisor::DEFAULT_MAX_SERVERS)]
    pub max_servers: usize,

    /// Maximum concurrent client sessions
    #[arg(long = "max-clients", default_value_t = crate::supervisor::DEFAULT_MAX_CLIENTS)]
    pub max_clients: usize,

    /// Display name reported in status and discovery replies
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Test plan (JSON)
    #[arg(long)]
    pub plan: String,

    /// Write the finished run as JSON to this path
    #[arg(long, short = 'o')]
    pub output: Option<String>,

    /// Token sent to agents whose plan entry carries none
    #[arg(long = "api-key", env = "IPERF_MESH_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Bound on each metrics poll (ms/s/m/h)
    #[arg(long = "poll-timeout", default_value = "1500ms", value_parser = parse_duration_arg)]
    pub poll_timeout: Duration,

    /// Bound on each start/stop call (ms/s/m/h)
    #[arg(long = "command-timeout", default_value = "6s", value_parser = parse_duration_arg)]
    pub command_timeout: Duration,

    /// Bound on each stop call during teardown (ms/s/m/h)
    #[arg(long = "stop-grace", default_value = "3s", value_parser = parse_duration_arg)]
    pub stop_grace: Duration,

    /// Skip the console summary
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Debug, Args, Clone)]
pub struct DiscoverArgs {
    /// Discovery port agents listen on
    #[arg(long, default_value_t = crate::wire::DEFAULT_DISCOVERY_PORT, value_parser = parse_port)]
    pub port: u16,

    /// How long to collect replies (ms/s/m/h)
    #[arg(long, default_value = "800ms", value_parser = parse_duration_arg)]
    pub timeout: Duration,

    /// Number of probes sent
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    pub retries: u32,

    /// Broadcast or unicast address to probe
    #[arg(long, default_value = "255.255.255.255")]
    pub target: IpAddr,

    /// Print replies as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct StatusArgs {
    /// Agent base URL, e.g. http://10.0.0.5:9001
    #[arg(long)]
    pub agent: String,

    /// Token presented to the agent
    #[arg(long = "api-key", env = "IPERF_MESH_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Request timeout (ms/s/m/h)
    #[arg(long, default_value = "6s", value_parser = parse_duration_arg)]
    pub timeout: Duration,

    /// Print the raw status document as JSON
    #[arg(long)]
    pub json: bool,
}

/// Where the agent reads its token; controllers fall back to it.
pub const AGENT_API_KEY_ENV: &str = "AGENT_API_KEY";

impl RunArgs {
    /// `--api-key` / `IPERF_MESH_API_KEY`, else `AGENT_API_KEY`.
    #[must_use]
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), agent_api_key_from_env)
    }
}

impl StatusArgs {
    /// `--api-key` / `IPERF_MESH_API_KEY`, else `AGENT_API_KEY`.
    #[must_use]
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), agent_api_key_from_env)
    }
}

fn agent_api_key_from_env() -> Option<String> {
    std::env::var(AGENT_API_KEY_ENV).ok()
}

/// Blank values count as unset on both sides.
pub(crate) fn resolve_api_key<F>(explicit: Option<&str>, fallback: F) -> Option<String>
where
    F: FnOnce() -> Option<String>,
{
    let non_blank = |key: &String| !key.trim().is_empty();
    explicit
        .map(str::to_owned)
        .filter(non_blank)
        .or_else(|| fallback().filter(non_blank))
}
