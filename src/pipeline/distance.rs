//! DistanceMatrix stage.
//!
//! A first job computes the shift and scale of every feature row. The scaled
//! dense vectors of all samples, sorted by name, are then broadcast to every
//! map task. The task for a sample finds the sample in the cache and compares
//! it only with the samples after it. It emits its own partial row and, for
//! each partner, the single cell of the partner's row. Reducers merge the
//! pieces of each row, so every distance is computed once.

use std::path::Path;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::distance::{
    DistanceMatrix, Metric, cosine_distance, dot, euclidean, jaccard_from_sizes, manhattan, norm,
    squared_euclidean,
};
use crate::error::{CcvError, Result};
use crate::matrix::RowScale;
use crate::pipeline::cache::{self, BroadcastCache, CacheReader};
use crate::pipeline::dataset::Dataset;
use crate::pipeline::features::SparseVector;
use crate::pipeline::mapreduce::{Mapper, Output, Reducer, Shuffle};

/// Scaled dense vector of one sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedVector {
    pub name: String,
    pub sample_index: usize,
    pub values: Vec<f64>,
    pub norm: f64,
    /// Sorted indices of the non-zero features before scaling.
    pub support: Vec<usize>,
}

struct ScaleMapper;

impl Mapper<String, SparseVector> for ScaleMapper {
    type OutKey = usize;
    type OutValue = f64;

    fn map(&mut self, _: String, vector: SparseVector, out: &mut Output<usize, f64>) -> Result<()> {
        for (idx, pi) in vector.entries {
            out.collect(idx, pi);
        }

        Ok(())
    }
}

struct ScaleReducer {
    samples: usize,
}

impl Reducer<usize, f64> for ScaleReducer {
    type OutKey = usize;
    type OutValue = RowScale;

    fn reduce(&self, idx: usize, values: Vec<f64>, out: &mut Vec<(usize, RowScale)>) -> Result<()> {
        out.push((idx, RowScale::from_nonzeros(&values, self.samples)));
        Ok(())
    }
}

/// Scale of every feature row that has a non-zero value.
pub fn row_scales(
    vectors: &Dataset<String, SparseVector>,
    samples: usize,
    work_dir: &Path,
    reducers: usize,
    output: &Path,
) -> Result<Dataset<usize, RowScale>> {
    let mut shuffle = Shuffle::new("scales", work_dir, reducers)?;
    shuffle.map(vectors, || ScaleMapper, None)?;
    shuffle.reduce(&ScaleReducer { samples }, output)
}

/// Scale every sample vector and publish them to `path`, sorted by name.
pub fn publish_cache(
    vectors: &[(String, SparseVector)],
    scales: &Dataset<usize, RowScale>,
    num_features: usize,
    path: &Path,
) -> Result<()> {
    let out_of_range = |idx: usize| {
        CcvError::format(
            "feature vectors",
            format!("feature index {idx} but only {num_features} features exist"),
        )
    };

    let mut row_scales = vec![RowScale::from_nonzeros(&[], vectors.len()); num_features];
    for (idx, scale) in scales.read_all()? {
        *row_scales.get_mut(idx).ok_or_else(|| out_of_range(idx))? = scale;
    }

    let mut entries = Vec::with_capacity(vectors.len());
    for (name, vector) in vectors {
        let mut values: Vec<f64> = row_scales.iter().map(|scale| scale.apply(0.0)).collect();
        for &(idx, pi) in &vector.entries {
            let scale = row_scales.get(idx).ok_or_else(|| out_of_range(idx))?;
            values[idx] = scale.apply(pi);
        }

        entries.push(CachedVector {
            name: name.clone(),
            sample_index: vector.sample_index,
            norm: norm(ArrayView1::from(&values[..])),
            values,
            support: vector.entries.iter().map(|(idx, _)| *idx).collect(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    cache::publish(path, &entries)
}

/// Number of indices present in both sorted lists.
fn sorted_intersection(a: &[usize], b: &[usize]) -> usize {
    let (mut i, mut j, mut common) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                common += 1;
                i += 1;
                j += 1;
            }
        }
    }

    common
}

pub fn pair_distance(metric: Metric, u: &CachedVector, v: &CachedVector) -> f64 {
    let (a, b) = (ArrayView1::from(&u.values[..]), ArrayView1::from(&v.values[..]));
    match metric {
        Metric::Euclidean => euclidean(a, b),
        Metric::SquaredEuclidean => squared_euclidean(a, b),
        Metric::Manhattan => manhattan(a, b),
        Metric::Cosine => cosine_distance(dot(a, b), u.norm, v.norm),
        Metric::Jaccard => {
            let common = sorted_intersection(&u.support, &v.support);
            jaccard_from_sizes(common, u.support.len() + v.support.len() - common)
        }
    }
}

/// Row cells `(column, distance)` keyed by row.
type Cells = Vec<(usize, f64)>;

struct DistanceMapper {
    metric: Metric,
    cache: CacheReader<CachedVector>,
}

impl Mapper<String, SparseVector> for DistanceMapper {
    type OutKey = usize;
    type OutValue = Cells;

    fn map(&mut self, name: String, _: SparseVector, out: &mut Output<usize, Cells>) -> Result<()> {
        self.cache.reset();

        let mut own = None;
        while let Some((_, entry)) = self.cache.next_entry() {
            if entry.name == name {
                own = Some(entry.clone());
                break;
            }
        }
        let own = own.ok_or_else(|| {
            CcvError::format("distance cache", format!("sample '{name}' is missing"))
        })?;

        let mut row = vec![(own.sample_index, 0.0)];
        while let Some((_, partner)) = self.cache.next_entry() {
            let d = pair_distance(self.metric, &own, partner);
            row.push((partner.sample_index, d));
            out.collect(partner.sample_index, vec![(own.sample_index, d)]);
        }
        out.collect(own.sample_index, row);

        Ok(())
    }
}

struct MergeRows {
    samples: usize,
}

impl Reducer<usize, Cells> for MergeRows {
    type OutKey = usize;
    type OutValue = Vec<f64>;

    fn reduce(&self, idx: usize, parts: Vec<Cells>, out: &mut Vec<(usize, Vec<f64>)>) -> Result<()> {
        let mut row = vec![0.0; self.samples];
        for (col, d) in parts.into_iter().flatten() {
            let cell = row.get_mut(col).ok_or_else(|| {
                CcvError::format("distance row", format!("column {col} of row {idx} is out of range"))
            })?;
            *cell = d;
        }
        out.push((idx, row));

        Ok(())
    }
}

/// Dense distance rows keyed by sample index.
pub fn distance_rows(
    vectors: &Dataset<String, SparseVector>,
    cache_path: &Path,
    metric: Metric,
    work_dir: &Path,
    reducers: usize,
    output: &Path,
) -> Result<Dataset<usize, Vec<f64>>> {
    let cache = BroadcastCache::<CachedVector>::load(cache_path)?;
    let samples = cache.len();
    let mut shuffle = Shuffle::new("distance", work_dir, reducers)?;
    shuffle.map(
        vectors,
        || DistanceMapper {
            metric,
            cache: cache.reader(),
        },
        None,
    )?;
    shuffle.reduce(&MergeRows { samples }, output)
}

/// Distance matrix with rows and columns in sample index order.
pub fn assemble(rows: &Dataset<usize, Vec<f64>>, names: Vec<String>) -> Result<DistanceMatrix> {
    let mut records = rows.read_all()?;
    records.sort_unstable_by_key(|(idx, _)| *idx);

    if records.iter().enumerate().any(|(i, (idx, _))| i != *idx) {
        return Err(CcvError::format(
            "distance rows",
            format!("expected rows 0..{} in {}", names.len(), rows.path().display()),
        ));
    }

    DistanceMatrix::from_rows(names, records.into_iter().map(|(_, row)| row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::distance_matrix;
    use crate::feature::FeatureSet;
    use crate::params::CcvParams;
    use crate::pipeline::dataset::write_dataset;
    use crate::pipeline::features::{feature_matrix, read_vectors};
    use clap::ValueEnum;
    use tempfile::tempdir;

    fn vectors() -> Vec<(String, SparseVector)> {
        let sparse = |sample_index, entries: &[(usize, f64)]| SparseVector {
            sample_index,
            entries: entries.to_vec(),
        };
        // names deliberately out of index order
        vec![
            ("delta".to_string(), sparse(0, &[(0, 0.5), (1, -0.2), (3, 1.5)])),
            ("alpha".to_string(), sparse(1, &[(0, 0.25), (2, 2.0)])),
            ("charlie".to_string(), sparse(2, &[(1, 0.7), (2, -1.0), (3, 0.1)])),
            ("bravo".to_string(), sparse(3, &[])),
        ]
    }

    #[test]
    fn test_matches_single_node() -> Result<()> {
        let dir = tempdir()?;
        let work = dir.path();
        let params = CcvParams::new(3, 4)?;
        let features = FeatureSet::new(
            params,
            ["ACG", "CGT", "TTT", "ACGT", "GGGG"].iter().map(|k| k.to_string()).collect(),
        );
        let dataset = write_dataset(&work.join("vectors"), vectors(), 3)?;
        let matrix = feature_matrix(&dataset, features.clone())?;
        let samples = read_vectors(&dataset)?;

        let scales = row_scales(&dataset, samples.len(), work, 2, &work.join("scales"))?;
        let cache = work.join("cache").join("distance.bin");
        publish_cache(&samples, &scales, features.len(), &cache)?;
        assert_eq!(BroadcastCache::<CachedVector>::load(&cache)?.len(), 4);

        for metric in Metric::value_variants() {
            let rows = distance_rows(&dataset, &cache, *metric, work, 2, &work.join("distance"))?;
            let distributed = assemble(&rows, matrix.names().to_vec())?;
            let single = distance_matrix(&matrix, *metric)?;

            assert_eq!(distributed.names(), single.names());
            for i in 0..4 {
                for j in 0..4 {
                    assert!(
                        (distributed.get(i, j) - single.get(i, j)).abs() < 1e-12,
                        "{metric:?} ({i}, {j})"
                    );
                    assert_eq!(distributed.get(i, j), distributed.get(j, i));
                }
                assert_eq!(distributed.get(i, i), 0.0);
            }
        }

        Ok(())
    }

    #[test]
    fn test_sorted_intersection() {
        assert_eq!(sorted_intersection(&[0, 2, 5, 7], &[1, 2, 7, 9]), 2);
        assert_eq!(sorted_intersection(&[], &[1]), 0);
    }
}
