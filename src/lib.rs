//! Core library for the `iperf-mesh` CLI.
//!
//! A host agent supervises iperf3 server and client processes and exposes
//! them over a small HTTP control plane; a controller drives many agents
//! through one synchronized run and aggregates their interval metrics. The
//! `iperf-mesh` binary is the primary interface; library APIs may evolve
//! with it.
pub mod agent;
pub mod args;
pub mod config;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod orchestrator;
pub mod remote;
pub mod shutdown;
pub mod shutdown_handlers;
pub mod supervisor;
pub mod wire;

mod entry;

pub use entry::run;

#[cfg(feature = "fuzzing")]
pub mod fuzzing;
