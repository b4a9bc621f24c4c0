//! Ordered feature sets and the feature file.
//!
//! The position of a k-mer in the feature set is its row index in every
//! feature matrix and vector file built from it.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::{CcvError, Result};
use crate::io_utils::create_writer;
use crate::params::CcvParams;

#[derive(Serialize, Deserialize)]
struct FeatureFile {
    begin: usize,
    end: usize,
    features: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct FeatureSet {
    params: CcvParams,
    features: Vec<String>,
    index: FxHashMap<String, usize>,
}

impl PartialEq for FeatureSet {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params && self.features == other.features
    }
}

impl FeatureSet {
    /// Build a feature set, dropping repeated k-mers after their first position.
    pub fn new(params: CcvParams, kmers: Vec<String>) -> Self {
        let mut index = FxHashMap::default();
        let mut features = Vec::with_capacity(kmers.len());
        for kmer in kmers {
            if !index.contains_key(&kmer) {
                index.insert(kmer.clone(), features.len());
                features.push(kmer);
            }
        }

        FeatureSet {
            params,
            features,
            index,
        }
    }

    pub fn params(&self) -> &CcvParams {
        &self.params
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn index_of(&self, kmer: &str) -> Option<usize> {
        self.index.get(kmer).copied()
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.features.get(idx).map(String::as_str)
    }

    pub fn to_set(&self) -> FxHashSet<String> {
        self.features.iter().cloned().collect()
    }

    /// Write `{begin, end, features}` as JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = FeatureFile {
            begin: self.params.start(),
            end: self.params.end(),
            features: self.features.clone(),
        };

        let mut writer = create_writer(path)?;
        serde_json::to_writer_pretty(&mut writer, &file)?;
        writer.flush()?;

        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let file: FeatureFile = serde_json::from_reader(reader)?;
        let params = CcvParams::new(file.begin, file.end)?;

        if let Some(kmer) = file
            .features
            .iter()
            .find(|kmer| !(params.start()..=params.end()).contains(&kmer.len()))
        {
            return Err(CcvError::format(
                "feature file",
                format!(
                    "k-mer '{}' is outside the window range [{}, {}]",
                    kmer,
                    params.start(),
                    params.end()
                ),
            ));
        }

        Ok(FeatureSet::new(params, file.features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn kmers(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_order_and_dedup() -> Result<()> {
        let features = FeatureSet::new(CcvParams::new(3, 4)?, kmers(&["TTT", "ACG", "TTT", "ACGT"]));
        assert_eq!(features.features(), ["TTT", "ACG", "ACGT"]);
        assert_eq!(features.index_of("ACGT"), Some(2));
        assert_eq!(features.index_of("GGG"), None);
        assert_eq!(features.get(1), Some("ACG"));

        Ok(())
    }

    #[test]
    fn test_json_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("features.json");
        let features = FeatureSet::new(CcvParams::new(3, 5)?, kmers(&["GGTAC", "ACG", "TTTT"]));

        features.write_json(&path)?;
        let loaded = FeatureSet::read_json(&path)?;
        assert_eq!(loaded, features);
        assert_eq!(loaded.params().end(), 5);

        Ok(())
    }

    #[test]
    fn test_json_rejects_out_of_range_kmer() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("features.json");
        std::fs::write(&path, r#"{"begin": 3, "end": 4, "features": ["ACG", "AC"]}"#)?;

        assert!(matches!(
            FeatureSet::read_json(&path),
            Err(CcvError::Format { .. })
        ));

        Ok(())
    }
}
