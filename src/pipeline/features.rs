//! FeatureVectors stage: sparse feature vectors of every sample.
//!
//! The ordered feature set is broadcast to every map task. For each window
//! record the task rewinds its reader and walks the whole feature list, so the
//! index of a feature is its position in the broadcast list.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::feature::FeatureSet;
use crate::matrix::FeatureMatrix;
use crate::pipeline::cache::{BroadcastCache, CacheReader};
use crate::pipeline::compvec::SampleWindow;
use crate::pipeline::dataset::Dataset;
use crate::pipeline::mapreduce::{Mapper, Output, Reducer, Shuffle};

/// Non-zero `(feature index, pi)` entries of one sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub sample_index: usize,
    pub entries: Vec<(usize, f64)>,
}

struct FeatureVectorMapper {
    features: CacheReader<String>,
}

impl Mapper<String, SampleWindow> for FeatureVectorMapper {
    type OutKey = String;
    type OutValue = SparseVector;

    fn map(&mut self, name: String, window: SampleWindow, out: &mut Output<String, SparseVector>) -> Result<()> {
        let mut entries = Vec::new();

        self.features.reset();
        while let Some((idx, kmer)) = self.features.next_entry() {
            if kmer.len() != window.vector.window() {
                continue;
            }

            let pi = window.vector.get(kmer);
            if pi != 0.0 {
                entries.push((idx, pi));
            }
        }

        out.collect(
            name,
            SparseVector {
                sample_index: window.sample_index,
                entries,
            },
        );

        Ok(())
    }
}

struct MergeWindows;

impl Reducer<String, SparseVector> for MergeWindows {
    type OutKey = String;
    type OutValue = SparseVector;

    fn reduce(&self, name: String, parts: Vec<SparseVector>, out: &mut Vec<(String, SparseVector)>) -> Result<()> {
        let mut merged = SparseVector::default();
        for part in parts {
            merged.sample_index = part.sample_index;
            merged.entries.extend(part.entries);
        }
        merged.entries.sort_unstable_by_key(|(idx, _)| *idx);
        out.push((name, merged));

        Ok(())
    }
}

pub fn feature_vectors(
    windows: &Dataset<String, SampleWindow>,
    features_cache: &Path,
    work_dir: &Path,
    reducers: usize,
    output: &Path,
) -> Result<Dataset<String, SparseVector>> {
    let features = BroadcastCache::<String>::load(features_cache)?;
    let mut shuffle = Shuffle::new("feature vectors", work_dir, reducers)?;
    shuffle.map(
        windows,
        || FeatureVectorMapper {
            features: features.reader(),
        },
        None,
    )?;
    shuffle.reduce(&MergeWindows, output)
}

/// Sample names and vectors ordered by sample index.
pub fn read_vectors(vectors: &Dataset<String, SparseVector>) -> Result<Vec<(String, SparseVector)>> {
    let mut records = vectors.read_all()?;
    records.sort_unstable_by_key(|(_, vector)| vector.sample_index);

    Ok(records)
}

/// Feature matrix with samples in index order.
pub fn feature_matrix(vectors: &Dataset<String, SparseVector>, features: FeatureSet) -> Result<FeatureMatrix> {
    let (names, columns): (Vec<String>, Vec<Vec<(usize, f64)>>) = read_vectors(vectors)?
        .into_iter()
        .map(|(name, vector)| (name, vector.entries))
        .unzip();

    FeatureMatrix::from_columns(features, names, columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CcvParams;
    use crate::pipeline::cache::publish;
    use crate::pipeline::dataset::write_dataset;
    use crate::vector::CompositionVector;
    use tempfile::tempdir;

    fn window(sample_index: usize, k: usize, values: &[(&str, f64)]) -> SampleWindow {
        let mut vector = CompositionVector::new(k);
        for (kmer, pi) in values {
            vector.insert(kmer.to_string(), *pi);
        }
        SampleWindow { sample_index, vector }
    }

    #[test]
    fn test_vectors_follow_feature_order() -> Result<()> {
        let dir = tempdir()?;
        let work = dir.path();
        let params = CcvParams::new(3, 4)?;
        let features = FeatureSet::new(
            params,
            ["TTTT", "ACG", "CGT", "ACGT"].iter().map(|k| k.to_string()).collect(),
        );
        let windows = write_dataset(
            &work.join("compvec"),
            vec![
                ("B".to_string(), window(1, 3, &[("CGT", -0.5)])),
                ("A".to_string(), window(0, 3, &[("ACG", 0.5), ("GGG", 1.0)])),
                ("A".to_string(), window(0, 4, &[("ACGT", 2.0), ("TTTT", 0.0)])),
                ("B".to_string(), window(1, 4, &[])),
            ],
            3,
        )?;

        let cache = work.join("cache").join("features.bin");
        publish(&cache, features.features())?;
        let vectors = feature_vectors(&windows, &cache, work, 2, &work.join("vectors"))?;

        let records = read_vectors(&vectors)?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, "A");
        assert_eq!(records[0].1.entries, vec![(1, 0.5), (3, 2.0)]);
        assert_eq!(records[1].1.entries, vec![(2, -0.5)]);

        let matrix = feature_matrix(&vectors, features)?;
        assert_eq!(matrix.names(), ["A", "B"]);
        assert_eq!(matrix.get(3, 0), 2.0);
        assert_eq!(matrix.get(2, 1), -0.5);

        Ok(())
    }
}
