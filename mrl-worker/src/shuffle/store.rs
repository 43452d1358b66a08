//! Key-indexed append buffers for intermediate records.
//!
//! Every entry is addressed by `(split, bucket)` and holds the chunks
//! appended to it, in append order.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use fnv::FnvHashMap;
use tracing::debug;

use common::Record;

/// The chunks of one entry, oldest first.
pub type Chunks<'a> = Box<dyn Iterator<Item = Result<Vec<Record>, Error>> + 'a>;

pub trait ShuffleStore: Send {
    /// Append `chunk` to the entry at `(split_id, bucket)`, creating the entry
    /// on first write.
    fn append(&mut self, split_id: &str, bucket: u32, chunk: Vec<Record>) -> Result<(), Error>;

    /// Read back the entry at `(split_id, bucket)`. A missing entry yields no chunks.
    fn chunks(&self, split_id: &str, bucket: u32) -> Result<Chunks<'_>, Error>;

    /// Drop every entry of `split_id`, whatever its bucket.
    fn remove_split(&mut self, split_id: &str) -> Result<(), Error>;

    /// Drop every entry.
    fn clear(&mut self) -> Result<(), Error>;
}

/// Store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: FnvHashMap<(String, u32), Vec<Vec<Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShuffleStore for MemoryStore {
    fn append(&mut self, split_id: &str, bucket: u32, chunk: Vec<Record>) -> Result<(), Error> {
        self.entries
            .entry((split_id.to_string(), bucket))
            .or_default()
            .push(chunk);
        Ok(())
    }

    fn chunks(&self, split_id: &str, bucket: u32) -> Result<Chunks<'_>, Error> {
        let chunks = self
            .entries
            .get(&(split_id.to_string(), bucket))
            .map(|chunks| chunks.as_slice())
            .unwrap_or_default();
        Ok(Box::new(chunks.iter().cloned().map(Ok)))
    }

    fn remove_split(&mut self, split_id: &str) -> Result<(), Error> {
        self.entries.retain(|(split, _), _| split != split_id);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), Error> {
        self.entries.clear();
        Ok(())
    }
}

/// Subdirectory of the configured root holding the entries.
const ENTRIES_DIR: &str = "shuffle";

/// Store that writes each entry to its own file, one JSON chunk per line.
///
/// Layout: `<root>/shuffle/<base64url(split)>/<bucket>`. Nothing outside
/// `<root>/shuffle` is ever touched. Entries outlive the process and are
/// only removed by [`ShuffleStore::remove_split`] and [`ShuffleStore::clear`].
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Open (creating if needed) a store under `root`. Existing entries are kept.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = root.as_ref().join(ENTRIES_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create shuffle dir `{}`", dir.display()))?;
        Ok(Self { dir })
    }

    fn split_dir(&self, split_id: &str) -> PathBuf {
        self.dir.join(URL_SAFE.encode(split_id))
    }

    fn entry_path(&self, split_id: &str, bucket: u32) -> PathBuf {
        self.split_dir(split_id).join(bucket.to_string())
    }
}

impl ShuffleStore for DiskStore {
    fn append(&mut self, split_id: &str, bucket: u32, chunk: Vec<Record>) -> Result<(), Error> {
        let path = self.entry_path(split_id, bucket);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut line = serde_json::to_string(&chunk)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn chunks(&self, split_id: &str, bucket: u32) -> Result<Chunks<'_>, Error> {
        let path = self.entry_path(split_id, bucket);
        if !path.exists() {
            return Ok(Box::new(std::iter::empty()));
        }

        let reader = BufReader::new(File::open(&path)?);
        let chunks = reader
            .lines()
            .filter(|line| !matches!(line, Ok(line) if line.is_empty()))
            .map(|line| {
                let line = line?;
                serde_json::from_str::<Vec<Record>>(&line).map_err(Error::from)
            });
        Ok(Box::new(chunks))
    }

    fn remove_split(&mut self, split_id: &str) -> Result<(), Error> {
        let dir = self.split_dir(split_id);
        if dir.exists() {
            debug!("removing entries of split `{split_id}`");
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove `{}`", dir.display()))?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), Error> {
        debug!("clearing shuffle dir {}", self.dir.display());
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}
