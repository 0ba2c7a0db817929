use std::collections::HashMap;

use http::StatusCode;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AgentError, AppError, AppResult};
use crate::wire::ErrorBody;

use super::control::ControlError;

const MAX_REQUEST_BYTES: usize = 1024 * 1024;
const READ_CHUNK_BYTES: usize = 4096;

pub(super) struct HttpRequest {
    pub(super) method: String,
    pub(super) path: String,
    pub(super) query: HashMap<String, String>,
    pub(super) headers: HashMap<String, String>,
    pub(super) body: Vec<u8>,
}

impl HttpRequest {
    pub(super) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// HTTP/1.1 defaults to keep-alive unless the peer asks otherwise.
    pub(super) fn wants_close(&self) -> bool {
        self.header("connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
    }
}

/// Reads one request from a keep-alive connection. Bytes past the end of the
/// request stay in `buffer` for the next call. `Ok(None)` means the peer
/// closed the connection between requests.
pub(super) async fn read_http_request<S>(
    socket: &mut S,
    buffer: &mut Vec<u8>,
) -> Result<Option<HttpRequest>, ControlError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    let header_end = loop {
        if let Some(pos) = find_header_end(buffer) {
            break pos;
        }
        let bytes = socket.read(&mut chunk).await.map_err(|err| {
            ControlError::bad_request(format!("Failed to read request: {}", err))
        })?;
        if bytes == 0 {
            if buffer.iter().all(u8::is_ascii_whitespace) {
                return Ok(None);
            }
            return Err(ControlError::bad_request("Truncated request"));
        }
        let read_slice = chunk
            .get(..bytes)
            .ok_or_else(|| ControlError::bad_request("Invalid read length"))?;
        buffer.extend_from_slice(read_slice);
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err(ControlError::too_large("Request too large"));
        }
    };

    let header_bytes = buffer
        .get(..header_end)
        .ok_or_else(|| ControlError::bad_request("Malformed request headers"))?;
    let header_text = std::str::from_utf8(header_bytes)
        .map_err(|err| ControlError::bad_request(format!("Invalid request encoding: {}", err)))?;
    let mut lines = header_text.trim_start().split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| ControlError::bad_request("Missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ControlError::bad_request("Missing HTTP method"))?
        .to_ascii_uppercase();
    let target = parts
        .next()
        .ok_or_else(|| ControlError::bad_request("Missing request path"))?;
    let (path, query) = split_target(target);

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(ControlError::bad_request("Malformed header"));
        };
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|err| ControlError::bad_request(format!("Invalid Content-Length: {}", err)))?,
        None => 0,
    };
    if content_length > MAX_REQUEST_BYTES {
        return Err(ControlError::too_large("Request body too large"));
    }
    let body_start = header_end
        .checked_add(4)
        .ok_or_else(|| ControlError::bad_request("Malformed request headers"))?;
    let request_end = body_start
        .checked_add(content_length)
        .ok_or_else(|| ControlError::too_large("Request body too large"))?;
    while buffer.len() < request_end {
        let bytes = socket.read(&mut chunk).await.map_err(|err| {
            ControlError::bad_request(format!("Failed to read body: {}", err))
        })?;
        if bytes == 0 {
            return Err(ControlError::bad_request("Truncated request body"));
        }
        let read_slice = chunk
            .get(..bytes)
            .ok_or_else(|| ControlError::bad_request("Invalid read length"))?;
        buffer.extend_from_slice(read_slice);
    }

    let body = buffer
        .get(body_start..request_end)
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    buffer.drain(..request_end);

    Ok(Some(HttpRequest {
        method,
        path,
        query,
        headers,
        body,
    }))
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, raw_query) = target.split_once('?').unwrap_or((target, ""));
    let query = url::form_urlencoded::parse(raw_query.as_bytes())
        .map(|(key, value)| (key.to_ascii_lowercase(), value.into_owned()))
        .collect();
    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    (path.to_owned(), query)
}

pub(super) async fn write_json_response<S, T>(
    socket: &mut S,
    status: StatusCode,
    response: &T,
    close: bool,
) -> AppResult<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(response).map_err(|err| {
        AppError::agent(AgentError::Serialize {
            context: "control response",
            source: err,
        })
    })?;
    write_response(socket, status, &body, close).await
}

pub(super) async fn write_error_response<S>(
    socket: &mut S,
    error: &ControlError,
    close: bool,
) -> AppResult<()>
where
    S: AsyncWrite + Unpin,
{
    let body = ErrorBody {
        error: error.message.clone(),
        kind: Some(error.kind.to_owned()),
    };
    write_json_response(socket, error.status, &body, close).await
}

async fn write_response<S>(
    socket: &mut S,
    status: StatusCode,
    body: &[u8],
    close: bool,
) -> AppResult<()>
where
    S: AsyncWrite + Unpin,
{
    let connection = if close { "close" } else { "keep-alive" };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown"),
        body.len(),
        connection
    );
    socket.write_all(head.as_bytes()).await.map_err(|err| {
        AppError::agent(AgentError::Io {
            context: "write control response",
            source: err,
        })
    })?;
    socket.write_all(body).await.map_err(|err| {
        AppError::agent(AgentError::Io {
            context: "write control response body",
            source: err,
        })
    })?;
    socket.flush().await.map_err(|err| {
        AppError::agent(AgentError::Io {
            context: "flush control response",
            source: err,
        })
    })?;
    Ok(())
}
