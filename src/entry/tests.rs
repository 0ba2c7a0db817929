use super::summary::{discovery_lines, run_lines, status_lines};
use crate::error::{AppError, AppResult};
use crate::metrics::MetricSample;
use crate::orchestrator::{
    AgentSeries, ClientEntry, ClientFailure, Mode, Phase, PhaseWindow, RunStatus, ServerEntry,
    TestPlan, TestRun,
};
use crate::wire::{
    AgentIdentity, DiscoveryReply, LifecycleState, Role, SessionKey, SessionStatus,
    StatusResponse,
};

fn sample(up: Option<f64>, down: Option<f64>) -> MetricSample {
    MetricSample {
        session: SessionKey::client(5211),
        timestamp_ms: 0,
        interval_start: 0.0,
        interval_end: 1.0,
        up_mbps: up,
        down_mbps: down,
        jitter_ms: None,
        loss_pct: None,
    }
}

fn finished_run() -> TestRun {
    let plan = TestPlan {
        server: ServerEntry {
            agent: "http://10.0.0.1:9001".to_owned(),
            ..ServerEntry::default()
        },
        clients: vec![ClientEntry {
            name: "edge-1".to_owned(),
            agent: "http://10.0.0.2:9001".to_owned(),
            target: "10.0.0.1".to_owned(),
            ..ClientEntry::default()
        }],
        mode: Mode::Bidir,
        duration_sec: 10,
        ..TestPlan::default()
    };
    let mut run = TestRun::new(plan);
    run.phase = Phase::Completed;
    run.status = RunStatus::Completed;
    run.ticks = 11;
    run.phases.push(PhaseWindow {
        phase: Phase::Running,
        start_ms: 40,
        end_ms: 10_040,
    });
    run.series.push(AgentSeries {
        name: "edge-1".to_owned(),
        agent: "http://10.0.0.2:9001".to_owned(),
        role: Role::Client,
        sessions: vec![SessionKey::client(5211)],
        samples: vec![sample(Some(900.0), Some(100.0)), sample(Some(950.0), Some(300.0))],
        poll_failures: 1,
    });
    run
}

#[test]
fn run_summary_reports_participants() -> AppResult<()> {
    let lines = run_lines(&finished_run());
    let text = lines.join("\n");
    let expected = [
        "Run completed: mode=bidir duration=10s ticks=11",
        "running: 0.040s .. 10.040s",
        "925.0",
        "200.0",
    ];
    for needle in expected {
        if !text.contains(needle) {
            return Err(AppError::config(format!("Missing '{}' in:\n{}", needle, text)));
        }
    }
    let Some(row) = lines.iter().find(|line| line.starts_with("edge-1")) else {
        return Err(AppError::config("Missing participant row"));
    };
    if !row.trim_end().ends_with('1') {
        return Err(AppError::config(format!("Unexpected poll failures in {}", row)));
    }
    Ok(())
}

#[test]
fn run_summary_lists_failures_and_error() -> AppResult<()> {
    let mut run = finished_run();
    run.series.clear();
    run.phase = Phase::Failed;
    run.status = RunStatus::Failed;
    run.cancelled = true;
    run.failures.push(ClientFailure {
        name: "edge-2".to_owned(),
        agent: "http://10.0.0.3:9001".to_owned(),
        error: "timed out".to_owned(),
    });
    run.error = Some("All 1 clients failed to start.".to_owned());

    let text = run_lines(&run).join("\n");
    let expected = [
        "Run failed (cancelled)",
        "edge-2 (http://10.0.0.3:9001): timed out",
        "Error: All 1 clients failed to start.",
    ];
    for needle in expected {
        if !text.contains(needle) {
            return Err(AppError::config(format!("Missing '{}' in:\n{}", needle, text)));
        }
    }
    if text.contains("participant") {
        return Err(AppError::config("Header printed without participants"));
    }
    Ok(())
}

#[test]
fn discovery_lines_show_servers() -> AppResult<()> {
    if discovery_lines(&[]) != vec!["No agents answered.".to_owned()] {
        return Err(AppError::config("Unexpected empty discovery output"));
    }
    let reply = DiscoveryReply {
        name: "lab-a".to_owned(),
        base: "http://10.0.0.5:9001".to_owned(),
        port: 9001,
        mgmt: "10.0.0.5".to_owned(),
        version: "0.3.0".to_owned(),
        servers: vec![5211, 5212],
    };
    let lines = discovery_lines(&[reply]);
    let Some(row) = lines.get(1) else {
        return Err(AppError::config("Missing reply row"));
    };
    if !row.starts_with("lab-a") || !row.ends_with("5211,5212") {
        return Err(AppError::config(format!("Unexpected row {}", row)));
    }
    Ok(())
}

#[test]
fn status_lines_show_sessions() -> AppResult<()> {
    let status = StatusResponse {
        identity: AgentIdentity {
            base_url: "http://10.0.0.5:9001".to_owned(),
            mgmt_ip: "10.0.0.5".to_owned(),
            version: "0.3.0".to_owned(),
            name: None,
        },
        sessions: vec![SessionStatus {
            key: SessionKey::server(5211),
            role: Role::Server,
            port: 5211,
            state: LifecycleState::Error,
            exit_code: Some(1),
            error: Some("bind failed".to_owned()),
            started_at: None,
            stopped_at: None,
            samples: 0,
            log_path: None,
        }],
        log_dir: "/tmp/iperf-mesh/logs".to_owned(),
        log_dir_writable: false,
        generator: "iperf3".to_owned(),
    };
    let text = status_lines(&status).join("\n");
    let expected = [
        "Agent unnamed at http://10.0.0.5:9001",
        "(not writable)",
        "server:5211",
        "samples=0 error=bind failed",
    ];
    for needle in expected {
        if !text.contains(needle) {
            return Err(AppError::config(format!("Missing '{}' in:\n{}", needle, text)));
        }
    }
    Ok(())
}
