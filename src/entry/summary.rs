use crate::orchestrator::TestRun;
use crate::wire::{DiscoveryReply, StatusResponse};

pub(crate) fn run_lines(run: &TestRun) -> Vec<String> {
    let mut lines = Vec::new();
    let cancelled = if run.cancelled { " (cancelled)" } else { "" };
    lines.push(format!(
        "Run {}{}: mode={} duration={}s ticks={}",
        run.phase.as_str(),
        cancelled,
        run.plan.mode,
        run.plan.duration_sec,
        run.ticks
    ));
    for window in &run.phases {
        lines.push(format!(
            "  {}: {} .. {}",
            window.phase.as_str(),
            format_ms(window.start_ms),
            format_ms(window.end_ms)
        ));
    }

    if !run.series.is_empty() {
        lines.push(format!(
            "{:<16} {:<28} {:>8} {:>10} {:>10} {:>6}",
            "participant", "agent", "samples", "up_mbps", "down_mbps", "misses"
        ));
    }
    for series in &run.series {
        let (up, down) = series.mean_mbps();
        lines.push(format!(
            "{:<16} {:<28} {:>8} {:>10} {:>10} {:>6}",
            series.name,
            series.agent,
            series.samples.len(),
            format_mbps(up),
            format_mbps(down),
            series.poll_failures
        ));
    }

    if !run.failures.is_empty() {
        lines.push("Clients that did not start:".to_owned());
        for failure in &run.failures {
            lines.push(format!(
                "  {} ({}): {}",
                failure.name, failure.agent, failure.error
            ));
        }
    }
    if let Some(error) = run.error.as_deref() {
        lines.push(format!("Error: {}", error));
    }
    lines
}

pub(crate) fn discovery_lines(replies: &[DiscoveryReply]) -> Vec<String> {
    if replies.is_empty() {
        return vec!["No agents answered.".to_owned()];
    }
    let mut lines = vec![format!(
        "{:<20} {:<28} {:<10} servers",
        "name", "base", "version"
    )];
    for reply in replies {
        lines.push(format!(
            "{:<20} {:<28} {:<10} {}",
            reply.name,
            reply.base,
            reply.version,
            format_ports(&reply.servers)
        ));
    }
    lines
}

pub(crate) fn status_lines(status: &StatusResponse) -> Vec<String> {
    let identity = &status.identity;
    let mut lines = vec![
        format!(
            "Agent {} at {} (version {})",
            identity.name.as_deref().unwrap_or("unnamed"),
            identity.base_url,
            identity.version
        ),
        format!("generator: {}", status.generator),
        format!(
            "log_dir: {}{}",
            status.log_dir,
            if status.log_dir_writable {
                ""
            } else {
                " (not writable)"
            }
        ),
    ];
    if status.sessions.is_empty() {
        lines.push("sessions: none".to_owned());
    }
    for session in &status.sessions {
        let detail = session
            .error
            .as_deref()
            .map(|error| format!(" error={}", error))
            .or_else(|| session.exit_code.map(|code| format!(" exit={}", code)))
            .unwrap_or_default();
        lines.push(format!(
            "  {:<14} {:<9} samples={}{}",
            session.key.to_string(),
            session.state.as_str(),
            session.samples,
            detail
        ));
    }
    lines
}

fn format_mbps(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_owned(), |mbps| format!("{:.1}", mbps))
}

fn format_ms(ms: u64) -> String {
    format!("{}.{:03}s", ms / 1_000, ms % 1_000)
}

fn format_ports(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "-".to_owned();
    }
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
