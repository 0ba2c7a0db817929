use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session '{key}' is already active.")]
    Conflict { key: String },
    #[error("Maximum number of {role} sessions ({max}) reached.")]
    Capacity { role: &'static str, max: usize },
    #[error("Failed to launch '{program}' for session '{key}': {source}")]
    Spawn {
        key: String,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Generator for session '{key}' exited immediately (exit code {code:?}).")]
    ExitedImmediately { key: String, code: Option<i32> },
    #[error("Generator for session '{key}' did not expose its output stream.")]
    MissingStdout { key: String },
}
