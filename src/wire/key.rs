use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Server,
    Client,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a session on one agent: at most one active session per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SessionKey {
    pub role: Role,
    pub port: u16,
}

impl SessionKey {
    #[must_use]
    pub const fn server(port: u16) -> Self {
        Self {
            role: Role::Server,
            port,
        }
    }

    #[must_use]
    pub const fn client(port: u16) -> Self {
        Self {
            role: Role::Client,
            port,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.port)
    }
}

impl FromStr for SessionKey {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (role, port) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| ValidationError::InvalidNumber {
                field: "key".to_owned(),
                value: value.to_owned(),
            })?;
        let role = match role {
            "server" => Role::Server,
            "client" => Role::Client,
            _ => {
                return Err(ValidationError::InvalidNumber {
                    field: "key".to_owned(),
                    value: value.to_owned(),
                });
            }
        };
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| ValidationError::InvalidPort {
                value: port.to_owned(),
            })?;
        Ok(Self { role, port })
    }
}

impl From<SessionKey> for String {
    fn from(value: SessionKey) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for SessionKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};

    #[test]
    fn session_key_display_and_parse_agree() -> AppResult<()> {
        let key: SessionKey = "client:5211".parse()?;
        if key != SessionKey::client(5211) {
            return Err(AppError::agent(format!("Unexpected key: {}", key)));
        }
        if SessionKey::server(5300).to_string() != "server:5300" {
            return Err(AppError::agent("Unexpected server key rendering"));
        }
        Ok(())
    }

    #[test]
    fn session_key_rejects_unknown_role_and_zero_port() -> AppResult<()> {
        if "worker:5211".parse::<SessionKey>().is_ok() {
            return Err(AppError::agent("Expected unknown role to be rejected"));
        }
        if "client:0".parse::<SessionKey>().is_ok() {
            return Err(AppError::agent("Expected port 0 to be rejected"));
        }
        Ok(())
    }

    #[test]
    fn session_key_serializes_as_map_key() -> AppResult<()> {
        let mut map = std::collections::BTreeMap::new();
        map.insert(SessionKey::client(5212), 1_u32);
        let json = serde_json::to_string(&map)?;
        if json != r#"{"client:5212":1}"# {
            return Err(AppError::agent(format!("Unexpected json: {}", json)));
        }
        let back: std::collections::BTreeMap<SessionKey, u32> = serde_json::from_str(&json)?;
        if back != map {
            return Err(AppError::agent("Map did not survive decoding"));
        }
        Ok(())
    }
}
