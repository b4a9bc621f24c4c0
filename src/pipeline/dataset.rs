//! Key-value datasets connecting pipeline stages.
//!
//! A dataset is a directory of `bincode` partition files (`part-00000.bin`, ...)
//! plus a `_SUCCESS` marker. Writers fill a temporary sibling directory and
//! rename it into place on commit, so a dataset is either complete or absent.
//! Dropping an uncommitted writer discards the partial output.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CcvError, Result};

pub const SUCCESS_MARKER: &str = "_SUCCESS";
const PARTITION_PREFIX: &str = "part-";
const PARTITION_EXT: &str = "bin";

fn partition_name(idx: usize) -> String {
    format!("{PARTITION_PREFIX}{idx:05}.{PARTITION_EXT}")
}

/// Write records to a single `bincode` file.
pub fn write_records<K: Serialize, V: Serialize>(path: &Path, records: &[(K, V)]) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, records)?;
    Ok(())
}

/// Read records written by `write_records`.
pub fn read_records<K: DeserializeOwned, V: DeserializeOwned>(path: &Path) -> Result<Vec<(K, V)>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(reader)?)
}

/// A complete, read-only dataset.
pub struct Dataset<K, V> {
    path: PathBuf,
    partitions: Vec<PathBuf>,
    _records: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for Dataset<K, V> {
    fn clone(&self) -> Self {
        Dataset {
            path: self.path.clone(),
            partitions: self.partitions.clone(),
            _records: PhantomData,
        }
    }
}

impl<K, V> Dataset<K, V> {
    /// True if the directory holds a committed dataset.
    pub fn is_complete(path: &Path) -> bool {
        path.join(SUCCESS_MARKER).is_file()
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !Self::is_complete(path) {
            return Err(CcvError::IncompleteDataset(path.to_path_buf()));
        }

        let mut partitions: Vec<PathBuf> = fs::read_dir(path)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(PARTITION_PREFIX))
            })
            .collect();
        partitions.sort();

        Ok(Dataset {
            path: path.to_path_buf(),
            partitions,
            _records: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }
}

impl<K: DeserializeOwned, V: DeserializeOwned> Dataset<K, V> {
    pub fn read_partition(&self, idx: usize) -> Result<Vec<(K, V)>> {
        read_records(&self.partitions[idx])
    }

    /// All records, partition by partition.
    pub fn read_all(&self) -> Result<Vec<(K, V)>> {
        let mut records = Vec::new();
        for idx in 0..self.num_partitions() {
            records.extend(self.read_partition(idx)?);
        }

        Ok(records)
    }
}

/// Writer for a dataset that becomes visible only on `commit`.
pub struct DatasetWriter<K, V> {
    path: PathBuf,
    tmp_path: PathBuf,
    committed: bool,
    _records: PhantomData<fn(K, V)>,
}

impl<K: Serialize, V: Serialize> DatasetWriter<K, V> {
    pub fn create(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| CcvError::format("dataset path", path.display().to_string()))?;
        let tmp_path = path.with_file_name(format!("_tmp_{name}"));

        if tmp_path.exists() {
            debug!("Removing stale output {}", tmp_path.display());
            fs::remove_dir_all(&tmp_path)?;
        }
        fs::create_dir_all(&tmp_path)?;

        Ok(DatasetWriter {
            path: path.to_path_buf(),
            tmp_path,
            committed: false,
            _records: PhantomData,
        })
    }

    /// Write one partition. Partitions may be written concurrently.
    pub fn write_partition(&self, idx: usize, records: &[(K, V)]) -> Result<()> {
        write_records(&self.tmp_path.join(partition_name(idx)), records)
    }

    /// Mark the output complete and move it into place.
    pub fn commit(mut self) -> Result<Dataset<K, V>> {
        File::create(self.tmp_path.join(SUCCESS_MARKER))?;
        if self.path.exists() {
            fs::remove_dir_all(&self.path)?;
        }
        fs::rename(&self.tmp_path, &self.path)?;
        self.committed = true;

        Dataset::open(&self.path)
    }
}

impl<K, V> Drop for DatasetWriter<K, V> {
    fn drop(&mut self) {
        if !self.committed && self.tmp_path.exists() {
            if let Err(e) = fs::remove_dir_all(&self.tmp_path) {
                warn!("Failed to discard {}: {}", self.tmp_path.display(), e);
            }
        }
    }
}

/// Write records spread over `num_partitions` partitions and commit.
pub fn write_dataset<K: Serialize, V: Serialize>(
    path: &Path,
    records: Vec<(K, V)>,
    num_partitions: usize,
) -> Result<Dataset<K, V>> {
    let num_partitions = num_partitions.max(1);
    let per_partition = records.len().div_ceil(num_partitions).max(1);

    let writer = DatasetWriter::create(path)?;
    let mut records = records.into_iter().peekable();
    for idx in 0..num_partitions {
        let chunk: Vec<(K, V)> = records.by_ref().take(per_partition).collect();
        writer.write_partition(idx, &chunk)?;
        if records.peek().is_none() {
            break;
        }
    }

    writer.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_commit_and_read() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("counts");
        let records = vec![
            ("A".to_string(), 3u64),
            ("C".to_string(), 1),
            ("G".to_string(), 2),
        ];

        let dataset = write_dataset(&path, records.clone(), 2)?;
        assert!(Dataset::<String, u64>::is_complete(&path));
        assert_eq!(dataset.num_partitions(), 2);
        assert_eq!(dataset.read_all()?, records);

        Ok(())
    }

    #[test]
    fn test_uncommitted_output_is_discarded() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("pi");
        {
            let writer = DatasetWriter::<String, f64>::create(&path)?;
            writer.write_partition(0, &[("ACG".to_string(), 0.5)])?;
        }

        assert!(!path.exists());
        assert!(!dir.path().join("_tmp_pi").exists());
        assert!(matches!(
            Dataset::<String, f64>::open(&path),
            Err(CcvError::IncompleteDataset(_))
        ));

        Ok(())
    }
}
