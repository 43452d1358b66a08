//! The message envelope shared by the master channel and the execution channel.
//!
//! On the master channel messages travel as JSON text:
//!
//! ```text
//! { "type": "HB" | "DO" | "ACK" | "UPL" | "LOG" | "CTL",
//!   "payload": { "action": "...", ...action specific fields } }
//! ```
//!
//! On the execution channel the same [`Message`] values are passed as-is.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::job::{Extra, JobSpec, MapStatus, ReduceStatus, Role};
use crate::Record;

/// Wire tags of the six message kinds.
pub const KINDS: [&str; 6] = ["HB", "DO", "ACK", "UPL", "LOG", "CTL"];

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no `type` field")]
    MissingType,

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A message, tagged by kind, each kind with its own payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// Liveness signal from the execution thread, relayed to the master.
    #[serde(rename = "HB")]
    Heartbeat(Heartbeat),

    /// Work assignment from the master.
    #[serde(rename = "DO")]
    Assign(Assign),

    /// Acknowledgement: greeting or task completion.
    #[serde(rename = "ACK")]
    Ack(Ack),

    /// Intermediate output from the execution thread.
    #[serde(rename = "UPL")]
    Upload(Upload),

    /// Diagnostic line from the execution thread. Never relayed.
    #[serde(rename = "LOG")]
    Log(LogLine),

    /// Control directive to the execution thread.
    #[serde(rename = "CTL")]
    Control(Control),
}

impl Message {
    /// Parse a message received as text.
    ///
    /// An unrecognised `type` or `action` is reported as an error rather than
    /// coerced into some fallback variant.
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let raw: Value = serde_json::from_str(text)?;
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingType)?
            .to_string();

        if !KINDS.contains(&kind.as_str()) {
            return Err(MessageError::UnknownType(kind));
        }

        serde_json::from_value(raw).map_err(|source| MessageError::InvalidPayload { kind, source })
    }

    /// Serialize to the JSON text form used on the master channel.
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The wire tag of this message's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Heartbeat(_) => "HB",
            Message::Assign(_) => "DO",
            Message::Ack(_) => "ACK",
            Message::Upload(_) => "UPL",
            Message::Log(_) => "LOG",
            Message::Control(_) => "CTL",
        }
    }

    /// The payload's `action`, if the kind has one.
    pub fn action(&self) -> Option<&'static str> {
        match self {
            Message::Heartbeat(_) | Message::Log(_) => None,
            Message::Assign(assign) => Some(assign.action()),
            Message::Ack(ack) => Some(ack.action()),
            Message::Upload(Upload::MapOutput(_)) => Some("mapOutput"),
            Message::Control(Control::Heartbeat) => Some("hb"),
            Message::Control(Control::Step) => Some("step"),
        }
    }

    pub fn heartbeat() -> Self {
        Message::Heartbeat(Heartbeat::new())
    }

    pub fn log(message: impl Into<String>) -> Self {
        Message::Log(LogLine {
            message: message.into(),
            extra: Extra::new(),
        })
    }
}

/// Heartbeat payload. Opaque to the node; relayed as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Heartbeat(pub Extra);

impl Heartbeat {
    pub fn new() -> Self {
        let mut fields = Extra::new();
        fields.insert("action".into(), Value::from("hb"));
        Heartbeat(fields)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// `DO` payloads, sent by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Assign {
    #[serde(rename = "mapTask")]
    MapTask(MapAssignment),

    #[serde(rename = "reduceTask")]
    ReduceTask(ReduceAssignment),

    #[serde(rename = "reduceSplit")]
    ReduceSplit(ReduceAssignment),

    #[serde(rename = "idle")]
    Idle(Extra),
}

impl Assign {
    pub fn action(&self) -> &'static str {
        match self {
            Assign::MapTask(_) => "mapTask",
            Assign::ReduceTask(_) => "reduceTask",
            Assign::ReduceSplit(_) => "reduceSplit",
            Assign::Idle(_) => "idle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapAssignment {
    pub job: JobSpec,

    #[serde(rename = "mapStatus")]
    pub map_status: MapStatus,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceAssignment {
    pub job: JobSpec,

    #[serde(rename = "reduceStatus")]
    pub reduce_status: ReduceStatus,

    #[serde(flatten)]
    pub extra: Extra,
}

/// `ACK` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Ack {
    /// Greeting: where this node's peer listener can be reached.
    #[serde(rename = "socket")]
    Socket(SocketAnnouncement),

    #[serde(rename = "mapTask")]
    MapTask(MapAck),

    #[serde(rename = "reduceSplit")]
    ReduceSplit(ReduceAck),

    #[serde(rename = "reduceTask")]
    ReduceTask(ReduceAck),

    /// Typed error report for a task that could not be completed.
    #[serde(rename = "taskFailed")]
    TaskFailed(TaskFailure),
}

impl Ack {
    pub fn action(&self) -> &'static str {
        match self {
            Ack::Socket(_) => "socket",
            Ack::MapTask(_) => "mapTask",
            Ack::ReduceSplit(_) => "reduceSplit",
            Ack::ReduceTask(_) => "reduceTask",
            Ack::TaskFailed(_) => "taskFailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketAnnouncement {
    pub protocol: String,
    pub port: u16,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapAck {
    #[serde(rename = "jobId")]
    pub job_id: u64,

    #[serde(rename = "mapStatus")]
    pub map_status: MapStatus,

    #[serde(flatten)]
    pub extra: Extra,
}

impl MapAck {
    pub fn new(job_id: u64, split_id: impl Into<String>) -> Self {
        Self {
            job_id,
            map_status: MapStatus::new(split_id),
            extra: Extra::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceAck {
    #[serde(rename = "jobId")]
    pub job_id: u64,

    #[serde(rename = "reduceStatus")]
    pub reduce_status: ReduceStatus,

    /// Reduce output, on `reduceTask` acknowledgements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(flatten)]
    pub extra: Extra,
}

impl ReduceAck {
    pub fn new(job_id: u64, reduce_status: ReduceStatus) -> Self {
        Self {
            job_id,
            reduce_status,
            output: None,
            extra: Extra::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    #[serde(rename = "jobId")]
    pub job_id: u64,

    pub role: Role,

    #[serde(rename = "splitId", default, skip_serializing_if = "Option::is_none")]
    pub split_id: Option<String>,

    #[serde(rename = "bucketId", default, skip_serializing_if = "Option::is_none")]
    pub bucket_id: Option<u32>,

    pub reason: String,
}

/// `UPL` payloads, sent by the execution thread to its node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Upload {
    #[serde(rename = "mapOutput")]
    MapOutput(MapOutputChunk),
}

/// One chunk of a split's map output. The last chunk has `more: false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapOutputChunk {
    #[serde(rename = "jobId")]
    pub job_id: u64,

    #[serde(rename = "splitId")]
    pub split_id: String,

    pub records: Vec<Record>,

    pub more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub message: String,

    #[serde(flatten)]
    pub extra: Extra,
}

/// `CTL` payloads, sent by the node to its execution thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Control {
    /// Start the heartbeat cadence.
    #[serde(rename = "hb")]
    Heartbeat,

    /// Perform one unit of work.
    #[serde(rename = "step")]
    Step,
}
