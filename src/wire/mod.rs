//! Types shared by the agent control plane and its remote callers.
mod key;
mod types;

pub use key::{Role, SessionKey};
pub use types::*;
