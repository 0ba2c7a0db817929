use clap::ArgMatches;
use clap::parser::ValueSource;

use crate::agent::{AgentSettings, default_log_dir};
use crate::args::AgentArgs;
use crate::error::{AppError, AppResult};

use super::types::AgentConfigFile;

/// Resolves agent settings: flags and env values that were actually given
/// win over the config file, which wins over built-in defaults.
///
/// # Errors
///
/// Returns an error when a config file value is invalid.
pub fn agent_settings(
    args: &AgentArgs,
    matches: &ArgMatches,
    file: Option<&AgentConfigFile>,
) -> AppResult<AgentSettings> {
    let empty = AgentConfigFile::default();
    let file = file.unwrap_or(&empty);

    let mut settings = AgentSettings {
        listen_host: args.listen_host.clone(),
        control_port: args.port,
        generator: args.generator.clone(),
        autostart: args.autostart.clone(),
        advertise_ip: args.advertise_ip.clone(),
        api_key: args.api_key.clone(),
        log_dir: args.log_dir.clone().unwrap_or_else(default_log_dir),
        discovery_port: args.discovery_port,
        discovery_enabled: !args.no_discovery,
        stop_grace: args.stop_grace,
        max_servers: args.max_servers,
        max_clients: args.max_clients,
        name: args.name.clone(),
    };

    if !is_explicit(matches, "listen_host")
        && let Some(host) = file.listen_host.clone()
    {
        settings.listen_host = host;
    }
    if !is_explicit(matches, "port")
        && let Some(port) = file.port
    {
        settings.control_port = port;
    }
    if !is_explicit(matches, "generator")
        && let Some(generator) = file.generator.clone()
        && !generator.trim().is_empty()
    {
        settings.generator = generator;
    }
    if !is_explicit(matches, "autostart")
        && let Some(ports) = file.autostart.as_ref()
    {
        settings.autostart = ports.to_ports().map_err(AppError::config)?;
    }
    if !is_explicit(matches, "advertise_ip") && file.advertise_ip.is_some() {
        settings.advertise_ip.clone_from(&file.advertise_ip);
    }
    if !is_explicit(matches, "api_key") && file.api_key.is_some() {
        settings.api_key.clone_from(&file.api_key);
    }
    if !is_explicit(matches, "log_dir")
        && let Some(log_dir) = file.log_dir.clone()
    {
        settings.log_dir = log_dir;
    }
    if !is_explicit(matches, "discovery_port")
        && let Some(port) = file.discovery_port
    {
        settings.discovery_port = port;
    }
    if !is_explicit(matches, "no_discovery")
        && let Some(enabled) = file.discovery
    {
        settings.discovery_enabled = enabled;
    }
    if !is_explicit(matches, "stop_grace")
        && let Some(grace) = file.stop_grace.as_ref()
    {
        settings.stop_grace = grace.to_duration("stop_grace").map_err(AppError::config)?;
    }
    if !is_explicit(matches, "max_servers")
        && let Some(max) = file.max_servers
    {
        settings.max_servers = max;
    }
    if !is_explicit(matches, "max_clients")
        && let Some(max) = file.max_clients
    {
        settings.max_clients = max;
    }
    if !is_explicit(matches, "name") && file.name.is_some() {
        settings.name.clone_from(&file.name);
    }

    settings.api_key = non_blank(settings.api_key);
    settings.advertise_ip = non_blank(settings.advertise_ip);
    settings.name = non_blank(settings.name);
    Ok(settings)
}

fn is_explicit(matches: &ArgMatches, id: &str) -> bool {
    matches!(
        matches.value_source(id),
        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
    )
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
