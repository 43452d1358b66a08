//! The control connection to the master.
//!
//! A WebSocket carrying one JSON [`Message`] per text frame. A background task
//! owns the socket; the node talks to it through channels, so sending never
//! waits on the network.

use anyhow::{anyhow, Context, Error};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as Frame;
use tracing::{debug, info, warn};
use url::Url;

use common::message::Message;

/// Something that happened on the master connection.
#[derive(Debug, PartialEq)]
pub enum MasterEvent {
    Message(Message),

    /// A frame that did not decode as a message, with the reason.
    Malformed(String),

    /// The connection is gone, with the reason when one is known.
    Closed(Option<String>),
}

pub struct MasterChannel {
    outbound: Option<UnboundedSender<Message>>,
    inbound: UnboundedReceiver<MasterEvent>,
    task: Option<JoinHandle<()>>,
}

impl MasterChannel {
    /// Connect to the master at `url`, asking for the `protocol` subprotocol.
    pub async fn connect(url: &Url, protocol: &str) -> Result<Self, Error> {
        let mut request = url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid master url `{url}`"))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(protocol).context("invalid subprotocol")?,
        );

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .with_context(|| format!("failed to connect to master at {url}"))?;
        info!("connected to master at {url} ({protocol})");

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outgoing) = mpsc::unbounded_channel::<Message>();
        let (events, inbound) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outgoing.recv() => {
                        let Some(message) = message else {
                            // Closed locally.
                            let _ = sink.send(Frame::Close(None)).await;
                            let _ = sink.close().await;
                            break;
                        };

                        let text = match message.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("dropping unencodable `{}` message: {e}", message.kind());
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Frame::Text(text.into())).await {
                            let _ = events.send(MasterEvent::Closed(Some(e.to_string())));
                            break;
                        }
                    }
                    frame = stream.next() => {
                        let event = match frame {
                            Some(Ok(Frame::Text(text))) => match Message::decode(text.as_str()) {
                                Ok(message) => MasterEvent::Message(message),
                                Err(e) => MasterEvent::Malformed(e.to_string()),
                            },
                            Some(Ok(Frame::Binary(bytes))) => {
                                warn!("ignoring {} byte binary frame from master", bytes.len());
                                continue;
                            }
                            Some(Ok(Frame::Close(frame))) => {
                                let reason = frame.map(|frame| frame.reason.as_str().to_string());
                                let _ = events.send(MasterEvent::Closed(reason));
                                break;
                            }
                            // Ping and pong are answered by tungstenite.
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = events.send(MasterEvent::Closed(Some(e.to_string())));
                                break;
                            }
                            None => {
                                let _ = events.send(MasterEvent::Closed(None));
                                break;
                            }
                        };

                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("master connection task finished");
        });

        Ok(Self {
            outbound: Some(outbound),
            inbound,
            task: Some(task),
        })
    }

    /// Wrap channel ends standing in for a master connection.
    pub fn from_parts(
        outbound: UnboundedSender<Message>,
        inbound: UnboundedReceiver<MasterEvent>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            task: None,
        }
    }

    /// Queue `message` for the master.
    pub fn send(&self, message: Message) -> Result<(), Error> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| anyhow!("master channel is closed"))?;
        outbound
            .send(message)
            .map_err(|_| anyhow!("master connection is gone"))
    }

    /// Next event from the master. Once the connection is gone this keeps
    /// returning [`MasterEvent::Closed`].
    pub async fn recv(&mut self) -> MasterEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or(MasterEvent::Closed(None))
    }

    /// Close the connection. Queued messages are still sent first.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.outbound.take() {
            Some(outbound) => {
                drop(outbound);
                Ok(())
            }
            None => {
                if let Some(task) = self.task.take() {
                    task.abort();
                }
                Err(anyhow!("master channel already closed"))
            }
        }
    }
}
