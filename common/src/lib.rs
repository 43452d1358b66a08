//! Shared types for MapReduce-lite worker nodes.
//!
//! Mapper output is a stream of [`Record`]s. Every record is assigned to one of
//! `R` reduce buckets by [`bucket_for`], which only looks at the characters of
//! the key so that every node in the cluster computes the same bucket for the
//! same key. Nodes talk to the master and to their execution thread with the
//! [`message::Message`] envelope.

use std::fmt;
use std::fmt::Formatter;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod job;
pub mod message;

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all records emitted at once) and lazy
/// (records only emitted when the iterator is consumed) map operations.
pub type MapOutput = anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Record>>>>;

/// A map function takes an input record and auxiliary arguments.
///
/// The input record is keyed by the split id and carries the split's text
/// as its value. It returns an iterator that yields intermediate records.
pub type MapFn = fn(input: Record, aux: &[String]) -> MapOutput;

/// A reduce function takes in a key, an iterator over values for that key,
/// and the auxiliary arguments. It returns an [`anyhow::Result`]
/// containing a single output value.
pub type ReduceFn = fn(
    key: &str,
    values: Box<dyn Iterator<Item = Value> + '_>,
    aux: &[String],
) -> anyhow::Result<Value>;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/////////////////////////////////////////////////////////////////////////////
// Records
/////////////////////////////////////////////////////////////////////////////

/// A single intermediate key-value pair.
///
/// On the wire a record is the JSON pair `[key, value]`.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(from = "(String, Value)", into = "(String, Value)")]
pub struct Record {
    /// The key.
    pub key: String,

    /// The value.
    pub value: Value,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key, self.value)
    }
}

impl Record {
    /// Construct a new record from the given key and value.
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Get the key of this record.
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the value of this record.
    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consumes the record and returns the key.
    #[inline]
    pub fn into_key(self) -> String {
        self.key
    }

    /// Consumes the record and returns the value.
    #[inline]
    pub fn into_value(self) -> Value {
        self.value
    }
}

impl From<(String, Value)> for Record {
    fn from((key, value): (String, Value)) -> Self {
        Self { key, value }
    }
}

impl From<Record> for (String, Value) {
    fn from(record: Record) -> Self {
        (record.key, record.value)
    }
}

/////////////////////////////////////////////////////////////////////////////
// Buckets
/////////////////////////////////////////////////////////////////////////////

/// Computes the reduce bucket of an intermediate key: the sum of the key's
/// UTF-16 code units modulo `reducers`.
///
/// The sum is reduced after every code unit, so arbitrarily long keys never
/// overflow and the result is always in `[0, reducers)`.
pub fn bucket_for(key: &str, reducers: NonZeroU32) -> u32 {
    let reducers = u64::from(reducers.get());
    let bucket = key
        .encode_utf16()
        .fold(0u64, |acc, unit| (acc + u64::from(unit)) % reducers);

    // `bucket < reducers <= u32::MAX`
    bucket as u32
}
