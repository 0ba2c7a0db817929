use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::supervisor::SessionParams;
use crate::wire::{
    API_KEY_HEADER, ClientStartResponse, ClientStopResponse, MetricsSince, Role,
    ServerStartResponse, ServerStopResponse, SessionKey, StatusResponse,
};

use super::AgentState;
use super::control::ControlError;
use super::http::{HttpRequest, read_http_request, write_error_response, write_json_response};
use super::normalize::{
    normalize_client_start, normalize_client_stop, normalize_server_start, normalize_server_stop,
};

/// How long a keep-alive connection may sit without a complete request.
pub(super) const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Serves requests on one connection until the peer closes it, asks to, or
/// stays idle past [`CONNECTION_IDLE_TIMEOUT`].
pub(super) async fn handle_connection<S>(state: Arc<AgentState>, mut socket: S, peer: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = Vec::new();
    loop {
        let read = timeout(
            CONNECTION_IDLE_TIMEOUT,
            read_http_request(&mut socket, &mut buffer),
        )
        .await;
        let request = match read {
            Err(_elapsed) => {
                debug!("Closing idle control connection from {}", peer);
                break;
            }
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                debug!("Rejecting request from {}: {}", peer, err.message);
                if write_error_response(&mut socket, &err, true).await.is_err() {
                    // Socket closed while writing error response.
                }
                break;
            }
        };

        let close = request.wants_close();
        let written = match dispatch(&state, &request).await {
            Ok(body) => write_json_response(&mut socket, StatusCode::OK, &body, close).await,
            Err(err) => {
                if err.status.is_server_error() {
                    warn!("{} {} failed: {}", request.method, request.path, err.message);
                } else {
                    debug!("{} {} rejected: {}", request.method, request.path, err.message);
                }
                write_error_response(&mut socket, &err, close).await
            }
        };
        if written.is_err() || close {
            break;
        }
    }
}

pub(super) async fn dispatch(state: &AgentState, request: &HttpRequest) -> Result<Value, ControlError> {
    authorize(state, request)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/server/start") => server_start(state, &request.body).await,
        ("POST", "/server/stop") => server_stop(state, &request.body).await,
        ("POST", "/client/start") => client_start(state, &request.body).await,
        ("POST", "/client/stop") => client_stop(state, &request.body).await,
        ("GET", "/metrics") => metrics(state, request),
        ("GET", "/status") => status(state),
        (method, path) => Err(ControlError::not_found(method, path)),
    }
}

fn authorize(state: &AgentState, request: &HttpRequest) -> Result<(), ControlError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(());
    };
    let provided = request.header(API_KEY_HEADER).or_else(|| {
        request
            .header("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
    });
    if provided.map(str::trim) == Some(expected) {
        Ok(())
    } else {
        Err(ControlError::unauthorized())
    }
}

fn to_body<T>(value: &T) -> Result<Value, ControlError>
where
    T: Serialize,
{
    serde_json::to_value(value)
        .map_err(|err| ControlError::internal(format!("Failed to encode response: {}", err)))
}

async fn server_start(state: &AgentState, body: &[u8]) -> Result<Value, ControlError> {
    let request = normalize_server_start(body)?;
    info!("server/start ports={:?}", request.ports);
    let launches = request.ports.iter().map(|port| {
        let bind = request
            .bind_map
            .get(&port.to_string())
            .cloned()
            .or_else(|| request.bind.clone());
        let params = SessionParams::Server { port: *port, bind };
        async move { (*port, state.supervisor.start(params).await) }
    });

    let mut response = ServerStartResponse::default();
    for (port, result) in join_all(launches).await {
        match result {
            Ok(_) => response.started.push(port),
            Err(SessionError::Conflict { .. }) => response.already_running.push(port),
            Err(err) => {
                response.errors.insert(port.to_string(), err.to_string());
            }
        }
    }
    to_body(&response)
}

async fn server_stop(state: &AgentState, body: &[u8]) -> Result<Value, ControlError> {
    let request = normalize_server_stop(body)?;
    let keys = request.ports.map(|ports| {
        ports
            .into_iter()
            .map(SessionKey::server)
            .collect::<Vec<_>>()
    });
    let stopped = stop_keys(state, Role::Server, keys).await;
    info!("server/stop stopped={:?}", stopped);
    to_body(&ServerStopResponse {
        stopped: stopped.iter().map(|key| key.port).collect(),
    })
}

async fn client_start(state: &AgentState, body: &[u8]) -> Result<Value, ControlError> {
    let request = normalize_client_start(body)?;
    info!(
        "client/start target={} port={} proto={} parallel={} bidir={} reverse={}",
        request.target,
        request.port,
        request.proto,
        request.parallel,
        request.bidir,
        request.reverse
    );
    let key = state.supervisor.start(SessionParams::Client(request)).await?;
    to_body(&ClientStartResponse { key })
}

async fn client_stop(state: &AgentState, body: &[u8]) -> Result<Value, ControlError> {
    let request = normalize_client_stop(body)?;
    let stopped = stop_keys(state, Role::Client, request.keys).await;
    info!("client/stop stopped={:?}", stopped);
    to_body(&ClientStopResponse { stopped })
}

/// `None` means every active session of the role.
async fn stop_keys(state: &AgentState, role: Role, keys: Option<Vec<SessionKey>>) -> Vec<SessionKey> {
    let Some(keys) = keys else {
        return state.supervisor.stop_all(Some(role)).await;
    };
    let results = join_all(keys.iter().map(|key| state.supervisor.stop(*key))).await;
    keys.into_iter()
        .zip(results)
        .filter_map(|(key, stopped)| stopped.then_some(key))
        .collect()
}

fn metrics(state: &AgentState, request: &HttpRequest) -> Result<Value, ControlError> {
    let since = match request.query.get("since").map(String::as_str) {
        None | Some("" | "start") => MetricsSince::Start,
        Some("last") => MetricsSince::Last,
        Some(other) => {
            return Err(ControlError::new(
                StatusCode::BAD_REQUEST,
                "validation",
                format!("Unknown metrics cursor '{}'. Use 'start' or 'last'.", other),
            ));
        }
    };
    to_body(&state.supervisor.metrics_all(since))
}

fn status(state: &AgentState) -> Result<Value, ControlError> {
    to_body(&StatusResponse {
        identity: state.identity.clone(),
        sessions: state.supervisor.sessions(),
        log_dir: state.log_dir.display().to_string(),
        log_dir_writable: state.log_dir_writable,
        generator: state.generator.clone(),
    })
}
