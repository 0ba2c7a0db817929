mod agent;
mod app;
mod config;
mod run;
mod session;
mod transport;
mod validation;

#[cfg(test)]
mod test_support;

pub use agent::AgentError;
pub use app::{AppError, AppResult};
pub use config::ConfigError;
pub use run::RunFailure;
pub use session::SessionError;
pub use transport::TransportError;
pub use validation::ValidationError;
