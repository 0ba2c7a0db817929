use super::{AgentError, ConfigError, RunFailure};

impl From<&'static str> for AgentError {
    fn from(message: &'static str) -> Self {
        AgentError::TestExpectation { message }
    }
}

impl From<String> for AgentError {
    fn from(value: String) -> Self {
        AgentError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ConfigError {
    fn from(message: &'static str) -> Self {
        ConfigError::TestExpectation { message }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        ConfigError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for RunFailure {
    fn from(message: &'static str) -> Self {
        RunFailure::TestExpectation { message }
    }
}

impl From<String> for RunFailure {
    fn from(value: String) -> Self {
        RunFailure::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}
