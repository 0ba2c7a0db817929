//! Entry points for the `fuzz/` targets. Only built with the `fuzzing`
//! feature.
use std::time::Duration;

use clap::{ArgMatches, CommandFactory};

use crate::agent::AgentSettings;
use crate::args::parsers::{parse_duration_arg, parse_port_list};
use crate::args::{AgentArgs, Cli};
use crate::config::agent_settings;
use crate::config::types::AgentConfigFile;
use crate::error::{AppError, AppResult, ConfigError};
use crate::metrics::{MetricSample, ParseContext, parse_line};
use crate::orchestrator::{Leg, TestPlan};
use crate::wire::{ClientStartRequest, SessionKey};

/// Parses a duration argument (e.g. `10s`, `500ms`).
///
/// # Errors
///
/// Returns an error when the duration is invalid.
pub fn parse_duration_input(input: &str) -> AppResult<Duration> {
    parse_duration_arg(input).map_err(AppError::from)
}

/// Parses a comma separated port list.
///
/// # Errors
///
/// Returns an error when any entry is not a port.
pub fn parse_ports_input(input: &str) -> AppResult<Vec<u16>> {
    parse_port_list(input).map_err(AppError::from)
}

/// Runs one line of generator output through the interval parser.
#[must_use]
pub fn parse_metrics_line(line: &str, reverse: bool, parallel: u32) -> Option<MetricSample> {
    let context = ParseContext {
        session: SessionKey::client(5201),
        reverse,
        parallel,
        timestamp_ms: 0,
    };
    parse_line(line, &context)
}

/// Normalises a `client/start` body the way the control plane does.
///
/// # Errors
///
/// Returns an error when the body is rejected.
pub fn normalize_client_start_input(body: &[u8]) -> AppResult<ClientStartRequest> {
    crate::agent::normalize_client_start(body).map_err(AppError::from)
}

/// Parses and validates a test plan, returning its legs.
///
/// # Errors
///
/// Returns an error when the plan does not parse or is rejected.
pub fn plan_legs_from_json(data: &[u8]) -> AppResult<Vec<Leg>> {
    let plan: TestPlan = serde_json::from_slice(data)?;
    plan.validate()?;
    plan.legs().map_err(AppError::from)
}

/// Resolves agent settings from a TOML config with no flags given.
///
/// # Errors
///
/// Returns an error when the config does not parse or holds invalid values.
pub fn agent_settings_from_toml(text: &str) -> AppResult<AgentSettings> {
    let config: AgentConfigFile = toml::from_str(text).map_err(|source| {
        AppError::config(ConfigError::ParseToml {
            path: "fuzz.toml".into(),
            source,
        })
    })?;
    let (args, matches) = default_agent_args()?;
    agent_settings(&args, &matches, Some(&config))
}

fn default_agent_args() -> AppResult<(AgentArgs, ArgMatches)> {
    use clap::FromArgMatches;

    let matches = Cli::command().try_get_matches_from(["iperf-mesh", "agent"])?;
    let agent_matches = matches
        .subcommand_matches("agent")
        .cloned()
        .unwrap_or_default();
    let args = AgentArgs::from_arg_matches(&agent_matches)?;
    Ok((args, agent_matches))
}
