use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;

use crate::error::{AppError, AppResult};
use crate::shutdown_handlers::shutdown_channel;
use crate::supervisor::{GeneratorConfig, Supervisor};
use crate::wire::{AgentIdentity, DISCOVERY_MAGIC, DiscoveryReply};

use super::AgentState;
use super::discovery::{discovery_reply, is_discovery_request, run_discovery_responder};
use super::handlers::{CONNECTION_IDLE_TIMEOUT, dispatch, handle_connection};
use super::http::{HttpRequest, read_http_request};

const IO_TIMEOUT: Duration = Duration::from_secs(2);

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::agent(format!("Failed to build runtime: {}", err)))?;
    runtime.block_on(future)
}

fn test_state(api_key: Option<&str>) -> AgentState {
    AgentState {
        supervisor: Supervisor::new(GeneratorConfig::new("/nonexistent/iperf3")),
        identity: AgentIdentity {
            base_url: "http://192.0.2.10:9001".to_owned(),
            mgmt_ip: "192.0.2.10".to_owned(),
            version: "test".to_owned(),
            name: Some("lab-1".to_owned()),
        },
        control_port: 9001,
        api_key: api_key.map(str::to_owned),
        log_dir: PathBuf::from("/tmp/iperf-mesh-test"),
        log_dir_writable: false,
        generator: "/nonexistent/iperf3".to_owned(),
    }
}

fn request(method: &str, path: &str, body: &str) -> HttpRequest {
    HttpRequest {
        method: method.to_owned(),
        path: path.to_owned(),
        query: HashMap::new(),
        headers: HashMap::new(),
        body: body.as_bytes().to_vec(),
    }
}

#[test]
fn pipelined_requests_are_read_one_at_a_time() -> AppResult<()> {
    run_async_test(async {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let raw = concat!(
            "POST /client/stop HTTP/1.1\r\nHost: a\r\nContent-Length: 11\r\n\r\n{\"keys\":[]}",
            "GET /metrics?since=last HTTP/1.1\r\nX-API-Key: k\r\n\r\n"
        );
        client.write_all(raw.as_bytes()).await?;
        drop(client);

        let mut buffer = Vec::new();
        let first = read_http_request(&mut server, &mut buffer)
            .await
            .map_err(|err| AppError::agent(err.message))?
            .ok_or_else(|| AppError::agent("Expected first request"))?;
        if first.method != "POST" || first.path != "/client/stop" || first.body != b"{\"keys\":[]}" {
            return Err(AppError::agent("First request parsed incorrectly"));
        }

        let second = read_http_request(&mut server, &mut buffer)
            .await
            .map_err(|err| AppError::agent(err.message))?
            .ok_or_else(|| AppError::agent("Expected second request"))?;
        if second.path != "/metrics"
            || second.query.get("since").map(String::as_str) != Some("last")
            || second.header("x-api-key") != Some("k")
        {
            return Err(AppError::agent("Second request parsed incorrectly"));
        }

        let end = read_http_request(&mut server, &mut buffer)
            .await
            .map_err(|err| AppError::agent(err.message))?;
        if end.is_some() {
            return Err(AppError::agent("Expected clean end of connection"));
        }
        Ok(())
    })
}

#[test]
fn query_values_are_percent_decoded() -> AppResult<()> {
    run_async_test(async {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET /metrics?Since=l%61st&note=a+b HTTP/1.1\r\n\r\n")
            .await?;
        let mut buffer = Vec::new();
        let parsed = read_http_request(&mut server, &mut buffer)
            .await
            .map_err(|err| AppError::agent(err.message))?
            .ok_or_else(|| AppError::agent("Expected a request"))?;
        if parsed.query.get("since").map(String::as_str) != Some("last")
            || parsed.query.get("note").map(String::as_str) != Some("a b")
        {
            return Err(AppError::agent(format!("Unexpected query {:?}", parsed.query)));
        }
        Ok(())
    })
}

#[test]
fn idle_connection_is_closed() -> AppResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|err| AppError::agent(format!("Failed to build runtime: {}", err)))?;
    runtime.block_on(async {
        let (client, server) = tokio::io::duplex(1024);
        let state = Arc::new(test_state(None));
        let started = tokio::time::Instant::now();
        let limit = CONNECTION_IDLE_TIMEOUT
            .checked_add(Duration::from_secs(5))
            .ok_or_else(|| AppError::agent("Timeout overflow"))?;
        tokio::time::timeout(limit, handle_connection(state, server, "idle-peer"))
            .await
            .map_err(|_elapsed| AppError::agent("Idle connection was kept open"))?;
        if started.elapsed() < CONNECTION_IDLE_TIMEOUT {
            return Err(AppError::agent("Connection closed before the idle timeout"));
        }
        drop(client);
        Ok(())
    })
}

#[test]
fn oversized_body_is_rejected() -> AppResult<()> {
    run_async_test(async {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"POST /server/start HTTP/1.1\r\nContent-Length: 99999999\r\n\r\n")
            .await?;
        let mut buffer = Vec::new();
        match read_http_request(&mut server, &mut buffer).await {
            Err(err) if err.status == StatusCode::PAYLOAD_TOO_LARGE => Ok(()),
            Err(err) => Err(AppError::agent(format!("Unexpected error: {}", err.message))),
            Ok(_) => Err(AppError::agent("Expected payload too large")),
        }
    })
}

#[test]
fn missing_or_wrong_token_is_unauthorized() -> AppResult<()> {
    run_async_test(async {
        let state = test_state(Some("secret"));
        let mut anonymous = request("GET", "/status", "");
        match dispatch(&state, &anonymous).await {
            Err(err) if err.status == StatusCode::UNAUTHORIZED => {}
            other => {
                return Err(AppError::agent(format!(
                    "Expected 401 without token, got {:?}",
                    other.map_err(|err| err.message)
                )));
            }
        }

        anonymous
            .headers
            .insert("x-api-key".to_owned(), "wrong".to_owned());
        if dispatch(&state, &anonymous).await.is_ok() {
            return Err(AppError::agent("Wrong token must be rejected"));
        }

        let mut keyed = request("GET", "/status", "");
        keyed
            .headers
            .insert("x-api-key".to_owned(), "secret".to_owned());
        dispatch(&state, &keyed)
            .await
            .map_err(|err| AppError::agent(err.message))?;

        let mut bearer = request("GET", "/status", "");
        bearer
            .headers
            .insert("authorization".to_owned(), "Bearer secret".to_owned());
        dispatch(&state, &bearer)
            .await
            .map_err(|err| AppError::agent(err.message))?;
        Ok(())
    })
}

#[test]
fn unauthorized_request_has_no_side_effect() -> AppResult<()> {
    run_async_test(async {
        let state = test_state(Some("secret"));
        let start = request("POST", "/server/start", r#"{"ports":[5211]}"#);
        if dispatch(&state, &start).await.is_ok() {
            return Err(AppError::agent("Expected unauthorized"));
        }
        if !state.supervisor.sessions().is_empty() {
            return Err(AppError::agent("Rejected request must not create sessions"));
        }
        Ok(())
    })
}

#[test]
fn udp_client_start_is_rejected_before_spawning() -> AppResult<()> {
    run_async_test(async {
        let state = test_state(None);
        for body in [
            r#"{"target":"10.0.0.1","port":5211,"proto":"udp","bidir":true}"#,
            r#"{"target":"10.0.0.1","port":5211,"proto":"udp","parallel":4}"#,
        ] {
            match dispatch(&state, &request("POST", "/client/start", body)).await {
                Err(err) if err.status == StatusCode::BAD_REQUEST && err.kind == "validation" => {}
                other => {
                    return Err(AppError::agent(format!(
                        "Expected validation error, got {:?}",
                        other.map_err(|err| err.message)
                    )));
                }
            }
        }
        if !state.supervisor.sessions().is_empty() {
            return Err(AppError::agent("Validation failure must not spawn"));
        }
        Ok(())
    })
}

#[test]
fn spawn_failure_is_reported_with_session_identity() -> AppResult<()> {
    run_async_test(async {
        let state = test_state(None);
        let body = r#"{"target":"10.0.0.1","port":5211}"#;
        match dispatch(&state, &request("POST", "/client/start", body)).await {
            Err(err) if err.kind == "spawn" && err.message.contains("client:5211") => Ok(()),
            other => Err(AppError::agent(format!(
                "Expected spawn error, got {:?}",
                other.map_err(|err| err.message)
            ))),
        }
    })
}

#[test]
fn server_start_reports_per_port_failures() -> AppResult<()> {
    run_async_test(async {
        let state = test_state(None);
        let body = r#"{"ports":[5211,5212]}"#;
        let response = dispatch(&state, &request("POST", "/server/start", body))
            .await
            .map_err(|err| AppError::agent(err.message))?;
        let errors = response
            .get("errors")
            .and_then(serde_json::Value::as_object)
            .ok_or_else(|| AppError::agent("Missing errors map"))?;
        if errors.len() != 2 || !errors.contains_key("5211") {
            return Err(AppError::agent(format!("Unexpected response: {}", response)));
        }
        Ok(())
    })
}

#[test]
fn unknown_routes_and_cursors_are_rejected() -> AppResult<()> {
    run_async_test(async {
        let state = test_state(None);
        match dispatch(&state, &request("DELETE", "/server/start", "")).await {
            Err(err) if err.status == StatusCode::NOT_FOUND => {}
            other => {
                return Err(AppError::agent(format!(
                    "Expected 404, got {:?}",
                    other.map_err(|err| err.message)
                )));
            }
        }
        let mut metrics = request("GET", "/metrics", "");
        metrics
            .query
            .insert("since".to_owned(), "yesterday".to_owned());
        if dispatch(&state, &metrics).await.is_ok() {
            return Err(AppError::agent("Unknown cursor must be rejected"));
        }
        Ok(())
    })
}

#[test]
fn stop_without_sessions_is_an_empty_ack() -> AppResult<()> {
    run_async_test(async {
        let state = test_state(None);
        let response = dispatch(&state, &request("POST", "/client/stop", ""))
            .await
            .map_err(|err| AppError::agent(err.message))?;
        if response != serde_json::json!({ "stopped": [] }) {
            return Err(AppError::agent(format!("Unexpected ack: {}", response)));
        }
        Ok(())
    })
}

#[test]
fn discovery_payload_recognition() -> AppResult<()> {
    if !is_discovery_request(DISCOVERY_MAGIC.as_bytes())
        || !is_discovery_request(b"  IPERF3_DISCOVER v2\n")
        || is_discovery_request(b"HELLO")
        || is_discovery_request(b"")
    {
        return Err(AppError::agent("Discovery payload recognition is wrong"));
    }
    let reply = discovery_reply(&test_state(None));
    if reply.base != "http://192.0.2.10:9001" || reply.port != 9001 || reply.name != "lab-1" {
        return Err(AppError::agent(format!("Unexpected reply: {:?}", reply)));
    }
    Ok(())
}

#[test]
fn discovery_responder_answers_only_the_magic() -> AppResult<()> {
    run_async_test(async {
        let responder = UdpSocket::bind("127.0.0.1:0").await?;
        let responder_addr = responder.local_addr()?;
        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        let handle = tokio::spawn(run_discovery_responder(
            Arc::new(test_state(None)),
            responder,
            shutdown_rx,
        ));

        let probe = UdpSocket::bind("127.0.0.1:0").await?;
        probe.send_to(b"NOT_DISCOVERY", responder_addr).await?;
        probe.send_to(DISCOVERY_MAGIC.as_bytes(), responder_addr).await?;
        let mut buffer = [0u8; 2048];
        let (bytes, _) = tokio::time::timeout(IO_TIMEOUT, probe.recv_from(&mut buffer))
            .await
            .map_err(|err| AppError::agent(format!("No discovery reply: {}", err)))??;
        let payload = buffer
            .get(..bytes)
            .ok_or_else(|| AppError::agent("Invalid reply length"))?;
        let reply: DiscoveryReply = serde_json::from_slice(payload)?;
        if reply.mgmt != "192.0.2.10" || !reply.servers.is_empty() {
            return Err(AppError::agent(format!("Unexpected reply: {:?}", reply)));
        }

        if shutdown_tx.send(()).is_err() {
            return Err(AppError::agent("Failed to send shutdown"));
        }
        tokio::time::timeout(IO_TIMEOUT, handle)
            .await
            .map_err(|err| AppError::agent(format!("Responder did not stop: {}", err)))??;
        Ok(())
    })
}
