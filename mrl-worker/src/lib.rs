//! A MapReduce-lite worker node.
//!
//! The node keeps a WebSocket connection to the master, runs map and reduce
//! work on an isolated execution thread, partitions map output by key and
//! serves it to reducers on other nodes over TCP.

pub mod args;
pub mod config;
pub mod core;
pub mod executor;
pub mod job;
pub mod map;
pub mod master;
pub mod peer;
pub mod reduce;
pub mod retry;
pub mod shuffle;

pub use crate::config::NodeConfig;
pub use crate::core::{NodeController, NodeHandle, NodeStatus};
