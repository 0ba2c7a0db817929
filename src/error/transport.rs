use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Agent URL '{value}' is invalid: {reason}")]
    InvalidAgentUrl { value: String, reason: String },
    #[error("Failed to build HTTP client: {source}")]
    BuildClient {
        #[source]
        source: reqwest::Error,
    },
    #[error("{operation} on {agent} timed out after {timeout_ms}ms.")]
    Timeout {
        agent: String,
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("{operation} on {agent} failed: {source}")]
    Connection {
        agent: String,
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{operation} on {agent} was rejected: unauthorized.")]
    Unauthorized {
        agent: String,
        operation: &'static str,
    },
    #[error("{operation} on {agent} returned HTTP {status}: {message}")]
    Status {
        agent: String,
        operation: &'static str,
        status: u16,
        kind: Option<String>,
        message: String,
    },
    #[error("{operation} on {agent} returned an unreadable body: {source}")]
    Decode {
        agent: String,
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl TransportError {
    /// Errors a later poll may recover from on its own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connection { .. })
    }
}
