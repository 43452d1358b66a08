//! The shuffle engine.
//!
//! Map output is bucketed by key into the node's [`ShuffleStore`] while a map
//! task runs, and replayed bucket by bucket when a reducer asks for it.

use std::num::NonZeroU32;

use anyhow::{anyhow, Error};
use fnv::FnvHashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use common::{bucket_for, Record};

pub mod store;
pub use store::{DiskStore, MemoryStore, ShuffleStore};

/// Receives a replayed entry as a stream of writes.
///
/// Every stored chunk arrives with `has_more = true`. The stream always ends
/// with exactly one empty write with `has_more = false`.
pub trait ReplaySink {
    fn write(&mut self, records: Vec<Record>, has_more: bool) -> Result<(), Error>;
}

impl ReplaySink for Vec<(Vec<Record>, bool)> {
    fn write(&mut self, records: Vec<Record>, has_more: bool) -> Result<(), Error> {
        self.push((records, has_more));
        Ok(())
    }
}

/// Buckets the map output of one job and replays it for reducers.
///
/// The reducer count is fixed for the lifetime of a partitioner, since
/// entries already written (here or on other nodes) were bucketed with it.
pub struct Partitioner {
    reducers: NonZeroU32,
    store: Box<dyn ShuffleStore>,

    /// Split receiving writes. `None` before the first `begin_write` and
    /// once the split has been completed.
    split: Option<String>,

    /// Split ids whose output is complete, for the job owner.
    completed: UnboundedSender<String>,
}

impl Partitioner {
    /// Create a partitioner for a job with `reducers` buckets.
    ///
    /// Fails when `reducers` is zero.
    pub fn new(
        reducers: u32,
        store: Box<dyn ShuffleStore>,
        completed: UnboundedSender<String>,
    ) -> Result<Self, Error> {
        let reducers =
            NonZeroU32::new(reducers).ok_or_else(|| anyhow!("reducer count must be positive"))?;

        Ok(Self {
            reducers,
            store,
            split: None,
            completed,
        })
    }

    pub fn reducers(&self) -> u32 {
        self.reducers.get()
    }

    /// The bucket of `key` for this partitioner's reducer count.
    pub fn bucket(&self, key: &str) -> u32 {
        bucket_for(key, self.reducers)
    }

    /// The split currently receiving writes, if any.
    pub fn current_split(&self) -> Option<&str> {
        self.split.as_deref()
    }

    /// Direct subsequent writes to `split_id`.
    ///
    /// Whatever an earlier attempt stored for `split_id` is dropped first, as
    /// is the partial output of a split left unfinished.
    pub fn begin_write(&mut self, split_id: impl Into<String>) -> Result<(), Error> {
        let split_id = split_id.into();
        self.discard()?;
        self.store.remove_split(&split_id)?;

        debug!("writing split `{split_id}`");
        self.split = Some(split_id);
        Ok(())
    }

    /// Drop the split receiving writes, if any, along with what it stored so
    /// far. Returns its id.
    pub fn discard(&mut self) -> Result<Option<String>, Error> {
        let Some(split_id) = self.split.take() else {
            return Ok(None);
        };
        warn!("split `{split_id}` abandoned before completion, dropping its output");
        self.store.remove_split(&split_id)?;
        Ok(Some(split_id))
    }

    /// Append `records` to the current split, each to the entry of its bucket.
    ///
    /// Records of one call are grouped into a single chunk per bucket, keeping
    /// their relative order. `has_more = false` completes the split and
    /// notifies the job owner exactly once; further writes need a fresh
    /// [`Partitioner::begin_write`].
    pub fn write(&mut self, records: Vec<Record>, has_more: bool) -> Result<(), Error> {
        let split_id = self
            .split
            .as_deref()
            .ok_or_else(|| anyhow!("write without a split; call begin_write first"))?;

        let mut chunks: FnvHashMap<u32, Vec<Record>> = FnvHashMap::default();
        let mut order = Vec::new();
        for record in records {
            let bucket = bucket_for(record.key(), self.reducers);
            let chunk = chunks.entry(bucket).or_insert_with(|| {
                order.push(bucket);
                Vec::new()
            });
            chunk.push(record);
        }

        for bucket in order {
            if let Some(chunk) = chunks.remove(&bucket) {
                self.store.append(split_id, bucket, chunk)?;
            }
        }

        if !has_more {
            if let Some(split_id) = self.split.take() {
                debug!("split `{split_id}` complete");
                if self.completed.send(split_id).is_err() {
                    warn!("split completed but nobody is listening");
                }
            }
        }

        Ok(())
    }

    /// Stream the entry at `(split_id, partition)` into `sink`, in write
    /// order, followed by the empty terminating write.
    pub fn start_replay(
        &self,
        partition: u32,
        split_id: &str,
        sink: &mut dyn ReplaySink,
    ) -> Result<(), Error> {
        if partition >= self.reducers.get() {
            warn!(
                "replay of partition {partition} requested, only {} exist",
                self.reducers
            );
        }

        for chunk in self.store.chunks(split_id, partition)? {
            let chunk = chunk?;
            if !chunk.is_empty() {
                sink.write(chunk, true)?;
            }
        }
        sink.write(Vec::new(), false)
    }

    /// Drop every stored entry and any split in progress.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.split = None;
        self.store.clear()
    }

    /// Give the store back, e.g. to reuse it for the next job.
    pub fn into_store(self) -> Box<dyn ShuffleStore> {
        self.store
    }
}
