use thiserror::Error;

use super::{
    AgentError, ConfigError, RunFailure, SessionError, TransportError, ValidationError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CLI error: {source}")]
    Clap {
        #[from]
        source: clap::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Run failed: {0}")]
    Run(#[from] RunFailure),
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation<E>(error: E) -> Self
    where
        E: Into<ValidationError>,
    {
        error.into().into()
    }

    pub fn config<E>(error: E) -> Self
    where
        E: Into<ConfigError>,
    {
        error.into().into()
    }

    pub fn session<E>(error: E) -> Self
    where
        E: Into<SessionError>,
    {
        error.into().into()
    }

    pub fn transport<E>(error: E) -> Self
    where
        E: Into<TransportError>,
    {
        error.into().into()
    }

    pub fn run<E>(error: E) -> Self
    where
        E: Into<RunFailure>,
    {
        error.into().into()
    }

    pub fn agent<E>(error: E) -> Self
    where
        E: Into<AgentError>,
    {
        error.into().into()
    }
}
