//! Peer-to-peer shuffle transport.
//!
//! Reducers fetch a map split's bucket straight from the node that ran the
//! map task. One request per TCP connection; every frame is a JSON document
//! with a 4-byte big-endian length prefix.
//!
//! ```text
//! -> {"resource": "/shuffle", "partition": 1, "split": "s1"}
//! <- {"chunk": [["a", 1], ["a", 2]]}
//! <- {"chunk": [["a", 3]]}
//! <- {"end": null}
//! ```
//!
//! A request that cannot be served gets a single `{"error": "..."}` frame.

use std::net::SocketAddr;

use anyhow::{anyhow, bail, Context, Error};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use common::Record;

use crate::shuffle::ReplaySink;

/// What a reducer asks a peer for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub resource: String,
    pub partition: u32,
    pub split: String,
}

/// One response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchFrame {
    Chunk(Vec<Record>),
    End(()),
    Error(String),
}

/// A fetch handed to the node controller, which answers it on `reply`.
#[derive(Debug)]
pub struct PeerFetch {
    pub partition: u32,
    pub split: String,
    pub reply: mpsc::UnboundedSender<FetchFrame>,
}

/// Replay target that turns a partition replay into response frames.
pub struct FrameSink(pub mpsc::UnboundedSender<FetchFrame>);

impl ReplaySink for FrameSink {
    fn write(&mut self, records: Vec<Record>, has_more: bool) -> Result<(), Error> {
        if !records.is_empty() {
            self.0
                .send(FetchFrame::Chunk(records))
                .map_err(|_| anyhow!("peer went away"))?;
        }
        if !has_more {
            self.0
                .send(FetchFrame::End(()))
                .map_err(|_| anyhow!("peer went away"))?;
        }
        Ok(())
    }
}

/// Accepts fetches from other nodes and forwards them to the controller.
pub struct PeerListener {
    local_addr: SocketAddr,
    resource: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PeerListener {
    /// Bind to `addr` and serve fetches for `resource`.
    pub async fn bind(
        addr: SocketAddr,
        resource: impl Into<String>,
        fetches: mpsc::UnboundedSender<PeerFetch>,
    ) -> Result<Self, Error> {
        let resource = resource.into();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind peer listener to {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!("peer listener on {local_addr}, resource `{resource}`");

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let served = resource.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let fetches = fetches.clone();
                            let served = served.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve(stream, &served, fetches).await {
                                    warn!("peer {remote}: {e:#}");
                                }
                            });
                        }
                        Err(e) => warn!("failed to accept peer connection: {e}"),
                    },
                }
            }
            debug!("peer listener stopped");
        });

        Ok(Self {
            local_addr,
            resource,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Stop accepting connections. Fetches already in flight run to completion.
    pub fn close(&mut self) -> Result<(), Error> {
        let shutdown = self
            .shutdown
            .take()
            .ok_or_else(|| anyhow!("peer listener already closed"))?;
        if shutdown.send(()).is_err() {
            self.task.abort();
            bail!("peer listener task had already exited");
        }
        Ok(())
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    resource: &str,
    fetches: mpsc::UnboundedSender<PeerFetch>,
) -> Result<(), Error> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let frame = framed
        .next()
        .await
        .ok_or_else(|| anyhow!("connection closed before a request"))??;

    let request: FetchRequest = match serde_json::from_slice(&frame) {
        Ok(request) => request,
        Err(e) => {
            send_frame(&mut framed, &FetchFrame::Error(format!("bad request: {e}"))).await?;
            return Ok(());
        }
    };

    if request.resource != resource {
        let error = FetchFrame::Error(format!("unknown resource `{}`", request.resource));
        send_frame(&mut framed, &error).await?;
        return Ok(());
    }

    debug!(
        "fetch of partition {} split `{}`",
        request.partition, request.split
    );

    let (reply, mut frames) = mpsc::unbounded_channel();
    let fetch = PeerFetch {
        partition: request.partition,
        split: request.split,
        reply,
    };
    if fetches.send(fetch).is_err() {
        send_frame(&mut framed, &FetchFrame::Error("node is shutting down".into())).await?;
        return Ok(());
    }

    while let Some(frame) = frames.recv().await {
        send_frame(&mut framed, &frame).await?;
        if !matches!(frame, FetchFrame::Chunk(_)) {
            return Ok(());
        }
    }

    send_frame(&mut framed, &FetchFrame::Error("fetch aborted".into())).await
}

async fn send_frame(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    frame: &FetchFrame,
) -> Result<(), Error> {
    let bytes = serde_json::to_vec(frame)?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// The requesting side of the shuffle transport.
#[derive(Debug, Clone)]
pub struct PeerClient {
    resource: String,
}

impl PeerClient {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
        }
    }

    /// Fetch every record of `partition` for `split` from the peer at `addr`.
    pub async fn fetch(&self, addr: &str, partition: u32, split: &str) -> Result<Vec<Record>, Error> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to peer {addr}"))?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let request = FetchRequest {
            resource: self.resource.clone(),
            partition,
            split: split.to_string(),
        };
        framed.send(Bytes::from(serde_json::to_vec(&request)?)).await?;

        let mut records = Vec::new();
        while let Some(frame) = framed.next().await {
            match serde_json::from_slice::<FetchFrame>(&frame?)? {
                FetchFrame::Chunk(chunk) => records.extend(chunk),
                FetchFrame::End(()) => return Ok(records),
                FetchFrame::Error(e) => bail!("peer {addr} refused fetch: {e}"),
            }
        }

        bail!("peer {addr} closed the connection mid-fetch")
    }
}
