//! Job descriptors carried inside master assignments and acknowledgements.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Fields a message carried that this node does not interpret.
///
/// They are kept so that relayed messages stay field-for-field identical.
pub type Extra = Map<String, Value>;

/// The job a task belongs to, as described by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Master-assigned job id.
    #[serde(rename = "jobId")]
    pub job_id: u64,

    /// Number of map tasks (splits) of the job.
    #[serde(rename = "M")]
    pub maps: u32,

    /// Number of reduce tasks (buckets) of the job.
    #[serde(rename = "R")]
    pub reducers: u32,

    /// Name of the MapReduce application to run.
    #[serde(rename = "code")]
    pub workload: String,

    /// Auxiliary arguments to pass to the MapReduce application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Extra,
}

impl JobSpec {
    pub fn new(job_id: u64, maps: u32, reducers: u32, workload: impl Into<String>) -> Self {
        Self {
            job_id,
            maps,
            reducers,
            workload: workload.into(),
            args: None,
            extra: Extra::new(),
        }
    }

    pub fn aux(&self) -> &[String] {
        self.args.as_deref().unwrap_or_default()
    }
}

/// Map side status: which split a message is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapStatus {
    #[serde(rename = "splitId", deserialize_with = "split_id")]
    pub split_id: String,

    /// Inline split contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    /// Where to fetch the split contents from, when not inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(flatten)]
    pub extra: Extra,
}

impl MapStatus {
    pub fn new(split_id: impl Into<String>) -> Self {
        Self {
            split_id: split_id.into(),
            input: None,
            url: None,
            extra: Extra::new(),
        }
    }
}

/// Reduce side status: which bucket (and optionally which split of it) a
/// message is about, and where the split can be fetched from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceStatus {
    #[serde(rename = "bucketId")]
    pub bucket_id: u32,

    #[serde(
        rename = "splitId",
        default,
        deserialize_with = "optional_split_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub split_id: Option<String>,

    /// Peer addresses (`host:port`) of nodes holding the split.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Extra,
}

impl ReduceStatus {
    pub fn new(bucket_id: u32) -> Self {
        Self {
            bucket_id,
            split_id: None,
            locations: None,
            extra: Extra::new(),
        }
    }

    pub fn with_split(mut self, split_id: impl Into<String>) -> Self {
        self.split_id = Some(split_id.into());
        self
    }
}

/// A split id as masters send it: a string, or a plain integer.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireSplitId {
    Text(String),
    Number(u64),
}

impl From<WireSplitId> for String {
    fn from(id: WireSplitId) -> Self {
        match id {
            WireSplitId::Text(text) => text,
            WireSplitId::Number(n) => n.to_string(),
        }
    }
}

fn split_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    WireSplitId::deserialize(deserializer).map(String::from)
}

fn optional_split_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<WireSplitId>::deserialize(deserializer)?.map(String::from))
}

/// Which half of a job a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Map,
    Reduce,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Map => write!(f, "map"),
            Role::Reduce => write!(f, "reduce"),
        }
    }
}
