//! Read-only data broadcast to every map task of a stage.
//!
//! The cache is written once by the orchestrator, loaded once per stage and
//! shared by reference. Each task reads it through its own `CacheReader`,
//! rewinding the reader before every input record.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CcvError, Result};

pub struct BroadcastCache<T> {
    entries: Arc<Vec<T>>,
}

impl<T> Clone for BroadcastCache<T> {
    fn clone(&self) -> Self {
        BroadcastCache {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Write the entries to `path`, replacing any earlier cache atomically.
pub fn publish<T: Serialize>(path: &Path, entries: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut writer = BufWriter::new(File::create(&tmp_path)?);
    bincode::serialize_into(&mut writer, entries)?;
    writer.flush()?;
    fs::rename(&tmp_path, path)?;
    debug!("Published {} cache entries to {}.", entries.len(), path.display());

    Ok(())
}

impl<T: DeserializeOwned> BroadcastCache<T> {
    /// Load a published cache.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CcvError::IncompleteDataset(path.to_path_buf()));
        }

        let reader = BufReader::new(File::open(path)?);
        let entries: Vec<T> = bincode::deserialize_from(reader)?;

        Ok(BroadcastCache {
            entries: Arc::new(entries),
        })
    }
}

impl<T> BroadcastCache<T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reader positioned at the first entry.
    pub fn reader(&self) -> CacheReader<T> {
        CacheReader {
            entries: Arc::clone(&self.entries),
            pos: 0,
        }
    }
}

/// Cursor over a broadcast cache.
pub struct CacheReader<T> {
    entries: Arc<Vec<T>>,
    pos: usize,
}

impl<T> CacheReader<T> {
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Next entry and its index in the cache.
    pub fn next_entry(&mut self) -> Option<(usize, &T)> {
        let entry = self.entries.get(self.pos)?;
        let idx = self.pos;
        self.pos += 1;
        Some((idx, entry))
    }
}
