//! Tool to load test mqtt brokers. Spawns a configurable number of clients
//! against one broker, drives each through a fixed number of publishes or
//! subscribes, and reports the aggregate throughput of the run.
//!
//! - Every client gets its own session, identity and topic tree
//! - The timed window covers only the operations, not connect or disconnect
//! - A failed connect aborts the run, a failed operation doesn't

#[macro_use]
extern crate log;

pub mod bench;
pub mod cli;
pub mod client;
pub mod common;
