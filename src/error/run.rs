use thiserror::Error;

use super::{TransportError, ValidationError};

#[derive(Debug, Error)]
pub enum RunFailure {
    #[error("Test plan rejected: {source}")]
    InvalidPlan {
        #[source]
        source: ValidationError,
    },
    #[error("Server agent {agent} failed to start ports {ports}.")]
    ServerStartRejected { agent: String, ports: String },
    #[error("Server agent {agent} unreachable: {source}")]
    ServerUnreachable {
        agent: String,
        #[source]
        source: TransportError,
    },
    #[error("All {count} clients failed to start.")]
    AllClientsFailed { count: usize },
    #[error("Run cancelled before traffic started.")]
    Cancelled,
    #[error("Run ended in failure: {message}")]
    Unsuccessful { message: String },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
