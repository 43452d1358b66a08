use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use url::Url;

use crate::args::Args;
use crate::shuffle::{DiskStore, MemoryStore, ShuffleStore};

/// Validated node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// `ws://` or `wss://` address of the master.
    pub master: Url,

    /// Subprotocol requested from the master.
    pub protocol: String,

    pub listen: SocketAddr,

    /// Resource path of the shuffle service, starting with `/`.
    pub resource: String,

    pub heartbeat: Duration,
    pub task_timeout: Option<Duration>,

    /// Disk store location; map output stays in memory when `None`.
    pub store_dir: Option<PathBuf>,

    pub interactive: bool,
    pub reconnect_attempts: u32,
}

impl NodeConfig {
    /// Settings for a node joining `master`, everything else at its default.
    pub fn new(master: Url) -> Self {
        Self {
            master,
            protocol: "worker".to_string(),
            listen: SocketAddr::from(([0, 0, 0, 0], 0)),
            resource: "/shuffle".to_string(),
            heartbeat: Duration::from_millis(5000),
            task_timeout: None,
            store_dir: None,
            interactive: false,
            reconnect_attempts: 0,
        }
    }

    pub fn from_args(args: &Args) -> Result<Self, Error> {
        let master = Url::parse(&args.address)
            .with_context(|| format!("invalid master address `{}`", args.address))?;

        let config = Self {
            master,
            protocol: args.protocol.clone(),
            listen: args.listen,
            resource: args.resource.clone(),
            heartbeat: Duration::from_millis(args.heartbeat_ms),
            task_timeout: args.task_timeout_secs.map(Duration::from_secs),
            store_dir: args.store_dir.clone(),
            interactive: args.interactive,
            reconnect_attempts: args.reconnect_attempts,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !matches!(self.master.scheme(), "ws" | "wss") {
            bail!("master address must be a ws:// or wss:// url, got `{}`", self.master);
        }
        if self.protocol.is_empty() {
            bail!("subprotocol must not be empty");
        }
        if !self.resource.starts_with('/') {
            bail!("resource `{}` must start with `/`", self.resource);
        }
        if self.heartbeat.is_zero() {
            bail!("heartbeat period must be positive");
        }
        if self.task_timeout.is_some_and(|timeout| timeout.is_zero()) {
            bail!("task timeout must be positive");
        }
        Ok(())
    }

    /// Open the shuffle store these settings ask for.
    pub fn open_store(&self) -> Result<Box<dyn ShuffleStore>, Error> {
        match &self.store_dir {
            Some(dir) => Ok(Box::new(DiskStore::open(dir)?)),
            None => Ok(Box::new(MemoryStore::new())),
        }
    }
}
