//! Command-line surface of the `iperf-mesh` binary.
pub(crate) mod cli;
pub(crate) mod parsers;


pub use cli::{AGENT_API_KEY_ENV, AgentArgs, Cli, Command, DiscoverArgs, RunArgs, StatusArgs};
