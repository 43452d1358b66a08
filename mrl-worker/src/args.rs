use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The address of the master.
    #[arg(short = 'j', long = "join", default_value = "ws://127.0.0.1:8080/bsmr/")]
    pub address: String,

    /// WebSocket subprotocol to request from the master.
    #[arg(long, default_value = "worker")]
    pub protocol: String,

    /// Where to listen for shuffle fetches from other workers.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    pub listen: SocketAddr,

    /// Resource path advertised for shuffle fetches.
    #[arg(long, default_value = "/shuffle")]
    pub resource: String,

    /// Heartbeat period in milliseconds.
    #[arg(long = "heartbeat-ms", default_value_t = 5000)]
    pub heartbeat_ms: u64,

    /// Give up on a task that has not finished after this many seconds.
    #[arg(long = "task-timeout-secs")]
    pub task_timeout_secs: Option<u64>,

    /// Keep map output in this directory instead of in memory.
    #[arg(long = "store-dir")]
    pub store_dir: Option<PathBuf>,

    /// Only run work when asked to on stdin (`step`).
    #[arg(short, long)]
    pub interactive: bool,

    /// How many times to try reconnecting to the master. 0 stops the worker
    /// as soon as the master goes away.
    #[arg(long = "reconnect-attempts", default_value_t = 0)]
    pub reconnect_attempts: u32,

    /// Log level, unless overridden by `RUST_LOG`.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}
