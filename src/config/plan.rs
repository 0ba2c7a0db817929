use std::path::Path;

use crate::error::{AppError, AppResult, ConfigError};
use crate::orchestrator::{TestPlan, TestRun};

/// Reads a JSON test plan. Validation happens when the plan is executed.
///
/// # Errors
///
/// Returns an error when the file cannot be read or is not a plan document.
pub fn load_plan(path: &Path) -> AppResult<TestPlan> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        AppError::config(ConfigError::ReadPlan {
            path: path.to_path_buf(),
            source,
        })
    })?;
    serde_json::from_str(&content).map_err(|source| {
        AppError::config(ConfigError::ParsePlan {
            path: path.to_path_buf(),
            source,
        })
    })
}

/// Writes the finished run as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error when the run cannot be encoded or the file written.
pub fn write_run(path: &Path, run: &TestRun) -> AppResult<()> {
    let mut encoded = serde_json::to_string_pretty(run)
        .map_err(|source| AppError::config(ConfigError::EncodeOutput { source }))?;
    encoded.push('\n');
    std::fs::write(path, encoded).map_err(|source| {
        AppError::config(ConfigError::WriteOutput {
            path: path.to_path_buf(),
            source,
        })
    })
}
