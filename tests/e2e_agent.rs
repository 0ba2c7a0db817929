#![cfg(unix)]


use std::time::Duration;

use iperf_mesh::orchestrator::{
    ClientEntry, Mode, Orchestrator, OrchestratorConfig, Phase, RunStatus, ServerEntry, TestPlan,
};
use iperf_mesh::remote::{AgentControlPort, AgentEndpoint, RemoteClient, RemoteConfig};
use iperf_mesh::wire::{
    ClientStartRequest, ClientStopRequest, LifecycleState, MetricsSince, Role, ServerStartRequest,
    ServerStopRequest, SessionKey,
};
use tokio::sync::watch;

use support_agent::{TestAgent, run_async, run_iperf_mesh};

const SERVER_PORT: u16 = 15_211;

fn log_files(agent: &TestAgent) -> Result<Vec<String>, String> {
    let entries = std::fs::read_dir(&agent.log_dir)
        .map_err(|err| format!("read log dir failed: {}", err))?;
    Ok(entries
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect())
}

#[test]
fn e2e_agent_sessions_over_http() -> Result<(), String> {
    run_async(async {
        let agent = TestAgent::start(Some("lab-token")).await?;
        let client = RemoteClient::new(RemoteConfig {
            default_api_key: Some("lab-token".to_owned()),
            ..RemoteConfig::default()
        });
        let endpoint = AgentEndpoint::new(agent.base_url.clone());

        let started = client
            .server_start(
                &endpoint,
                &ServerStartRequest {
                    ports: vec![SERVER_PORT],
                    ..ServerStartRequest::default()
                },
            )
            .await
            .map_err(|err| format!("server/start failed: {}", err))?;
        if started.started != vec![SERVER_PORT] {
            return Err(format!("Unexpected server/start response {:?}", started));
        }
        let again = client
            .server_start(
                &endpoint,
                &ServerStartRequest {
                    ports: vec![SERVER_PORT],
                    ..ServerStartRequest::default()
                },
            )
            .await
            .map_err(|err| format!("second server/start failed: {}", err))?;
        if again.already_running != vec![SERVER_PORT] {
            return Err(format!("Expected already running, got {:?}", again));
        }

        let mut request = ClientStartRequest::new("127.0.0.1", SERVER_PORT);
        request.duration = Some(5);
        request.bidir = true;
        let key = client
            .client_start(&endpoint, &request)
            .await
            .map_err(|err| format!("client/start failed: {}", err))?
            .key;
        if key != SessionKey::client(SERVER_PORT) {
            return Err(format!("Unexpected key {}", key));
        }

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let metrics = client
            .metrics(&endpoint, MetricsSince::Start)
            .await
            .map_err(|err| format!("metrics failed: {}", err))?;
        let client_samples = metrics.metrics.get(&key).map_or(0, Vec::len);
        let server_samples = metrics
            .metrics
            .get(&SessionKey::server(SERVER_PORT))
            .map_or(0, Vec::len);
        if client_samples < 2 || server_samples < 2 {
            return Err(format!(
                "Expected samples, got client={} server={}",
                client_samples, server_samples
            ));
        }
        let bidir_split = metrics.metrics.get(&key).is_some_and(|samples| {
            samples.iter().any(|sample| sample.up_mbps.is_some())
                && samples.iter().any(|sample| sample.down_mbps.is_some())
        });
        if !bidir_split {
            return Err("Expected upload and download samples from a bidir client".to_owned());
        }
        if metrics.states.get(&key) != Some(&LifecycleState::Running) {
            return Err(format!("Unexpected client state {:?}", metrics.states.get(&key)));
        }

        let status = client
            .status(&endpoint)
            .await
            .map_err(|err| format!("status failed: {}", err))?;
        if !status.generator.contains("fake generator") {
            return Err(format!("Version probe missing from {}", status.generator));
        }
        if status.sessions.len() != 2 || !status.log_dir_writable {
            return Err(format!("Unexpected status {:?}", status));
        }

        let stopped = client
            .client_stop(&endpoint, &ClientStopRequest { keys: None })
            .await
            .map_err(|err| format!("client/stop failed: {}", err))?;
        if stopped.stopped != vec![key] {
            return Err(format!("Unexpected client/stop {:?}", stopped));
        }
        let stopped = client
            .server_stop(&endpoint, &ServerStopRequest { ports: None })
            .await
            .map_err(|err| format!("server/stop failed: {}", err))?;
        if stopped.stopped != vec![SERVER_PORT] {
            return Err(format!("Unexpected server/stop {:?}", stopped));
        }

        let status = client
            .status(&endpoint)
            .await
            .map_err(|err| format!("status failed: {}", err))?;
        if status
            .sessions
            .iter()
            .any(|session| session.state.is_active())
        {
            return Err(format!("Sessions still active: {:?}", status.sessions));
        }

        let files = log_files(&agent)?;
        let has_server_log = files.iter().any(|name| name.starts_with("server_15211_"));
        let has_client_log = files
            .iter()
            .any(|name| name.starts_with("client_127.0.0.1_15211_"));
        if !has_server_log || !has_client_log {
            return Err(format!("Missing session logs in {:?}", files));
        }

        client.shutdown().await;
        agent.stop().await
    })
}

#[test]
fn e2e_orchestrated_run_collects_both_sides() -> Result<(), String> {
    run_async(async {
        let agent = TestAgent::start(None).await?;
        let plan = TestPlan {
            server: ServerEntry {
                agent: agent.base_url.clone(),
                ..ServerEntry::default()
            },
            clients: vec![ClientEntry {
                name: "loopback".to_owned(),
                agent: agent.base_url.clone(),
                target: "127.0.0.1".to_owned(),
                ..ClientEntry::default()
            }],
            mode: Mode::UpOnly,
            duration_sec: 2,
            base_port: 15_311,
            keep_servers_open: false,
            poll_interval_sec: 0.5,
            ..TestPlan::default()
        };
        let orchestrator = Orchestrator::new(
            RemoteClient::new(RemoteConfig::default()),
            OrchestratorConfig::default(),
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let run = orchestrator.execute(plan, cancel_rx).await;
        orchestrator.shutdown().await;

        if run.status != RunStatus::Completed || run.phase != Phase::Completed {
            return Err(format!("Run did not complete: {:?} {:?}", run.status, run.error));
        }
        if run.ticks < 4 {
            return Err(format!("Expected at least 4 ticks, got {}", run.ticks));
        }
        let server = run
            .series_named("server")
            .ok_or_else(|| "Missing server series".to_owned())?;
        let client = run
            .series_named("loopback")
            .ok_or_else(|| "Missing client series".to_owned())?;
        if server.role != Role::Server || client.role != Role::Client {
            return Err("Series roles mixed up".to_owned());
        }
        if server.samples.is_empty() || client.samples.is_empty() {
            return Err(format!(
                "Expected samples on both sides, got server={} client={}",
                server.samples.len(),
                client.samples.len()
            ));
        }
        if client.samples.iter().any(|sample| sample.up_mbps.is_none()) {
            return Err("Upload-only client produced download samples".to_owned());
        }
        agent.stop().await
    })
}

#[test]
fn e2e_cli_run_writes_output() -> Result<(), String> {
    run_async(async {
        let agent = TestAgent::start(None).await?;
        let dir = tempfile::tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
        let plan_path = dir.path().join("plan.json");
        let output_path = dir.path().join("run.json");
        let plan = serde_json::json!({
            "server": {"agent": agent.base_url},
            "clients": [{"name": "cli", "agent": agent.base_url, "target": "127.0.0.1"}],
            "mode": "down_only",
            "duration_sec": 1,
            "base_port": 15411,
            "keep_servers_open": false,
            "poll_interval_sec": 0.5
        });
        std::fs::write(&plan_path, plan.to_string())
            .map_err(|err| format!("write plan failed: {}", err))?;

        let args = vec![
            "run".to_owned(),
            "--plan".to_owned(),
            plan_path.to_string_lossy().into_owned(),
            "--output".to_owned(),
            output_path.to_string_lossy().into_owned(),
        ];
        let output = tokio::task::spawn_blocking(move || run_iperf_mesh(args))
            .await
            .map_err(|err| format!("join failed: {}", err))??;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(format!(
                "stdout: {}\nstderr: {}",
                stdout,
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        if !stdout.contains("Run completed") || !stdout.contains("cli") {
            return Err(format!("Unexpected summary: {}", stdout));
        }

        let written = std::fs::read_to_string(&output_path)
            .map_err(|err| format!("read output failed: {}", err))?;
        let run: serde_json::Value =
            serde_json::from_str(&written).map_err(|err| format!("bad output: {}", err))?;
        if run.get("status").and_then(serde_json::Value::as_str) != Some("completed") {
            return Err(format!("Unexpected run output: {}", written));
        }

        let status_args = vec!["status".to_owned(), "--agent".to_owned(), agent.base_url.clone()];
        let status = tokio::task::spawn_blocking(move || run_iperf_mesh(status_args))
            .await
            .map_err(|err| format!("join failed: {}", err))??;
        let status_out = String::from_utf8_lossy(&status.stdout).into_owned();
        if !status.status.success() || !status_out.contains("Agent e2e") {
            return Err(format!("Unexpected status output: {}", status_out));
        }
        agent.stop().await
    })
}

#[test]
fn e2e_cli_rejects_invalid_plan() -> Result<(), String> {
    let dir = tempfile::tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let plan_path = dir.path().join("plan.json");
    let plan = serde_json::json!({
        "server": {"agent": "http://127.0.0.1:1"},
        "clients": [],
        "duration_sec": 5
    });
    std::fs::write(&plan_path, plan.to_string())
        .map_err(|err| format!("write plan failed: {}", err))?;

    let plan_arg = plan_path.to_string_lossy().into_owned();
    let output = run_iperf_mesh(["run", "--plan", plan_arg.as_str()])?;
    if output.status.success() {
        return Err("Expected a plan without clients to fail".to_owned());
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.contains("at least one client") {
        return Err(format!("Unexpected output: {}", stdout));
    }
    Ok(())
}
