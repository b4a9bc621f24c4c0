//! Pairwise distance matrices.
//!
//! Only the upper triangle is computed; each value is mirrored into the lower
//! triangle and the diagonal stays zero. Every metric except Jaccard works on
//! the normalized copy of the feature matrix. Jaccard compares the sets of
//! non-zero k-mers and ignores magnitudes.

use std::hash::Hash;
use std::io::Write;
use std::path::Path;

use clap::ValueEnum;
use log::info;
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::{CcvError, Result};
use crate::io_utils::create_writer;
use crate::matrix::{FeatureMatrix, allocate_dense};
use crate::vector::CompleteCompositionVector;

/// Width of sample names in PHYLIP output.
pub const PHYLIP_NAME_WIDTH: usize = 10;
pub const DEFAULT_DIGITS: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Metric {
    Euclidean,
    /// Squared Euclidean
    #[value(name = "es")]
    SquaredEuclidean,
    Manhattan,
    Cosine,
    Jaccard,
}

/// Dot product, summed in index order.
pub fn dot(u: ArrayView1<f64>, v: ArrayView1<f64>) -> f64 {
    u.iter().zip(v.iter()).fold(0.0, |acc, (a, b)| acc + a * b)
}

pub fn norm(u: ArrayView1<f64>) -> f64 {
    dot(u, u).sqrt()
}

pub fn euclidean(u: ArrayView1<f64>, v: ArrayView1<f64>) -> f64 {
    squared_euclidean(u, v).sqrt()
}

pub fn squared_euclidean(u: ArrayView1<f64>, v: ArrayView1<f64>) -> f64 {
    u.iter()
        .zip(v.iter())
        .fold(0.0, |acc, (a, b)| acc + (a - b) * (a - b))
}

pub fn manhattan(u: ArrayView1<f64>, v: ArrayView1<f64>) -> f64 {
    u.iter()
        .zip(v.iter())
        .fold(0.0, |acc, (a, b)| acc + (a - b).abs())
}

/// Cosine distance `(1 - cos) / 2`, clamped at zero. A zero-length vector has
/// a cosine similarity of 0.
pub fn cosine_distance(dot: f64, norm_u: f64, norm_v: f64) -> f64 {
    let denom = norm_u * norm_v;
    let similarity = if denom == 0.0 { 0.0 } else { dot / denom };

    ((1.0 - similarity) / 2.0).max(0.0)
}

/// `1 - |a ∩ b| / |a ∪ b|`; two empty sets have distance 0.
pub fn jaccard_distance<T: Eq + Hash>(a: &FxHashSet<T>, b: &FxHashSet<T>) -> f64 {
    let intersection = a.intersection(b).count();
    jaccard_from_sizes(intersection, a.len() + b.len() - intersection)
}

pub fn jaccard_from_sizes(intersection: usize, union: usize) -> f64 {
    if union == 0 {
        return 0.0;
    }

    1.0 - intersection as f64 / union as f64
}

#[derive(Clone, Debug, PartialEq)]
pub struct DistanceMatrix {
    names: Vec<String>,
    values: Array2<f64>,
}

impl DistanceMatrix {
    /// Compute `d(i, j)` for every `i < j` and mirror it.
    pub fn from_upper<F>(names: Vec<String>, distance: F) -> Result<Self>
    where
        F: Fn(usize, usize) -> f64 + Sync,
    {
        let n = names.len();
        let rows: Vec<Vec<f64>> = (0..n)
            .into_par_iter()
            .map(|i| ((i + 1)..n).map(|j| distance(i, j)).collect())
            .collect();

        let mut data = allocate_dense(n, n)?;
        for (i, row) in rows.into_iter().enumerate() {
            for (offset, d) in row.into_iter().enumerate() {
                let j = i + 1 + offset;
                data[i * n + j] = d;
                data[j * n + i] = d;
            }
        }

        Self::from_data(names, data)
    }

    /// Matrix from complete dense rows.
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        let n = names.len();
        if rows.len() != n || rows.iter().any(|row| row.len() != n) {
            return Err(CcvError::format(
                "distance matrix",
                format!("expected {n} rows of {n} values"),
            ));
        }

        Self::from_data(names, rows.into_iter().flatten().collect())
    }

    fn from_data(names: Vec<String>, data: Vec<f64>) -> Result<Self> {
        let n = names.len();
        let values = Array2::from_shape_vec((n, n), data)
            .map_err(|e| CcvError::format("distance matrix", e.to_string()))?;

        Ok(DistanceMatrix { names, values })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[[i, j]]
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Copy with rows and columns in the order of `names`.
    pub fn reorder(&self, names: &[String]) -> Result<Self> {
        let position: FxHashMap<&str, usize> = self
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let order = names
            .iter()
            .map(|name| {
                position.get(name.as_str()).copied().ok_or_else(|| {
                    CcvError::format("distance matrix", format!("unknown sample '{name}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let n = order.len();
        let values = Array2::from_shape_fn((n, n), |(i, j)| self.values[[order[i], order[j]]]);

        Ok(DistanceMatrix {
            names: names.to_vec(),
            values,
        })
    }

    /// Write in PHYLIP square format, names cut or padded to 10 characters.
    pub fn write_phylip(&self, path: &Path, digits: usize) -> Result<()> {
        let mut writer = create_writer(path)?;
        writeln!(writer, "\t{}", self.len())?;
        for (i, name) in self.names.iter().enumerate() {
            let label: String = name.chars().take(PHYLIP_NAME_WIDTH).collect();
            write!(writer, "{label:<PHYLIP_NAME_WIDTH$} ")?;
            let row: Vec<String> = self
                .values
                .row(i)
                .iter()
                .map(|d| format_distance(*d, digits))
                .collect();
            writeln!(writer, "{}", row.join(" "))?;
        }
        writer.flush()?;

        Ok(())
    }

    /// Write as a tab-separated table with a header of sample names.
    pub fn write_tsv(&self, path: &Path) -> Result<()> {
        let mut writer = create_writer(path)?;
        writeln!(writer, "\t{}", self.names.join("\t"))?;
        for (i, name) in self.names.iter().enumerate() {
            let row: Vec<String> = self.values.row(i).iter().map(|d| d.to_string()).collect();
            writeln!(writer, "{}\t{}", name, row.join("\t"))?;
        }
        writer.flush()?;

        Ok(())
    }
}

/// Fixed precision without trailing zeros.
fn format_distance(d: f64, digits: usize) -> String {
    let s = format!("{d:.digits$}");
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

/// Distance matrix over the samples (columns) of a feature matrix.
pub fn distance_matrix(matrix: &FeatureMatrix, metric: Metric) -> Result<DistanceMatrix> {
    info!(
        "Calculating {:?} distances between {} samples over {} features.",
        metric,
        matrix.num_samples(),
        matrix.num_features()
    );
    let names = matrix.names().to_vec();

    match metric {
        Metric::Jaccard => {
            let supports: Vec<FxHashSet<usize>> = (0..matrix.num_samples())
                .map(|col| matrix.column_support(col))
                .collect();
            DistanceMatrix::from_upper(names, |i, j| jaccard_distance(&supports[i], &supports[j]))
        }
        Metric::Euclidean => {
            let normalized = matrix.normalized()?;
            DistanceMatrix::from_upper(names, |i, j| {
                euclidean(normalized.column(i), normalized.column(j))
            })
        }
        Metric::SquaredEuclidean => {
            let normalized = matrix.normalized()?;
            DistanceMatrix::from_upper(names, |i, j| {
                squared_euclidean(normalized.column(i), normalized.column(j))
            })
        }
        Metric::Manhattan => {
            let normalized = matrix.normalized()?;
            DistanceMatrix::from_upper(names, |i, j| {
                manhattan(normalized.column(i), normalized.column(j))
            })
        }
        Metric::Cosine => {
            let normalized = matrix.normalized()?;
            let norms: Vec<f64> = normalized.columns().into_iter().map(norm).collect();
            DistanceMatrix::from_upper(names, |i, j| {
                cosine_distance(dot(normalized.column(i), normalized.column(j)), norms[i], norms[j])
            })
        }
    }
}

/// Jaccard distances over the non-zero k-mers of complete composition vectors,
/// optionally restricted to a subset of k-mers.
pub fn jaccard_distance_matrix(
    vectors: &[CompleteCompositionVector],
    subset: Option<&FxHashSet<String>>,
) -> Result<DistanceMatrix> {
    let sets: Vec<FxHashSet<&str>> = vectors
        .iter()
        .map(|vector| {
            let mut kmers = vector.nonzero_kmers();
            if let Some(subset) = subset {
                kmers.retain(|kmer| subset.contains(*kmer));
            }
            kmers
        })
        .collect();

    let names = vectors.iter().map(|v| v.name().to_string()).collect();
    DistanceMatrix::from_upper(names, |i, j| jaccard_distance(&sets[i], &sets[j]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureSet;
    use crate::params::CcvParams;
    use ndarray::array;
    use tempfile::tempdir;

    fn matrix() -> FeatureMatrix {
        let params = CcvParams::new(3, 4).unwrap();
        let features = FeatureSet::new(
            params,
            ["ACG", "CGT", "TTT", "ACGT"].iter().map(|k| k.to_string()).collect(),
        );
        FeatureMatrix::from_columns(
            features,
            ["A", "B", "C", "D"].iter().map(|k| k.to_string()).collect(),
            vec![
                vec![(0, 0.5), (1, -0.2), (3, 1.5)],
                vec![(0, 0.25), (2, 2.0)],
                vec![(1, 0.7), (2, -1.0), (3, 0.1)],
                vec![(0, 1.0), (1, -0.4), (3, 3.0)],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_symmetric_with_zero_diagonal() -> Result<()> {
        let m = matrix();
        for metric in Metric::value_variants() {
            let dist = distance_matrix(&m, *metric)?;
            assert_eq!(dist.len(), 4);
            for i in 0..dist.len() {
                assert_eq!(dist.get(i, i), 0.0);
                for j in 0..dist.len() {
                    assert_eq!(dist.get(i, j), dist.get(j, i));
                    assert!(dist.get(i, j) >= 0.0);
                }
            }
        }

        Ok(())
    }

    #[test]
    fn test_cosine_range() -> Result<()> {
        let dist = distance_matrix(&matrix(), Metric::Cosine)?;
        for i in 0..4 {
            for j in 0..4 {
                assert!((0.0..=1.0).contains(&dist.get(i, j)));
            }
        }

        Ok(())
    }

    #[test]
    fn test_metric_values() {
        let u = array![1.0, 2.0, 3.0];
        let v = array![2.0, 0.0, 3.0];
        assert_eq!(squared_euclidean(u.view(), v.view()), 5.0);
        assert_eq!(euclidean(u.view(), v.view()), 5.0f64.sqrt());
        assert_eq!(manhattan(u.view(), v.view()), 3.0);
        assert_eq!(dot(u.view(), v.view()), 11.0);

        // proportional vectors have zero cosine distance
        let w = array![2.0, 4.0, 6.0];
        let d = cosine_distance(dot(u.view(), w.view()), norm(u.view()), norm(w.view()));
        assert!(d.abs() < 1e-12);

        // opposite vectors are at distance 1
        let d = cosine_distance(-14.0, 14.0f64.sqrt(), 14.0f64.sqrt());
        assert!((d - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_jaccard() {
        let a: FxHashSet<&str> = ["ACG", "CGT", "TTT"].into_iter().collect();
        let b: FxHashSet<&str> = ["ACG", "GGG"].into_iter().collect();
        assert_eq!(jaccard_distance(&a, &b), 0.75);
        assert_eq!(jaccard_distance(&a, &a), 0.0);

        let empty = FxHashSet::<&str>::default();
        assert_eq!(jaccard_distance(&empty, &empty), 0.0);
    }

    #[test]
    fn test_jaccard_matrix_ignores_magnitudes() -> Result<()> {
        // A and D share the same support
        let dist = distance_matrix(&matrix(), Metric::Jaccard)?;
        assert_eq!(dist.get(0, 3), 0.0);
        assert_eq!(dist.get(0, 1), 0.75);

        Ok(())
    }

    #[test]
    fn test_reorder() -> Result<()> {
        let dist = distance_matrix(&matrix(), Metric::Euclidean)?;
        let names: Vec<String> = ["D", "A", "C", "B"].iter().map(|k| k.to_string()).collect();
        let reordered = dist.reorder(&names)?;

        assert_eq!(reordered.names(), names.as_slice());
        assert_eq!(reordered.get(0, 1), dist.get(3, 0));
        assert_eq!(reordered.get(2, 3), dist.get(2, 1));
        assert!(dist.reorder(&["X".to_string()]).is_err());

        Ok(())
    }

    #[test]
    fn test_writers() -> Result<()> {
        let dir = tempdir()?;
        let names = vec!["short".to_string(), "a_very_long_sample_name".to_string()];
        let dist = DistanceMatrix::from_rows(names, vec![vec![0.0, 0.125], vec![0.125, 0.0]])?;

        let phylip = dir.path().join("dist.phylip");
        dist.write_phylip(&phylip, DEFAULT_DIGITS)?;
        let text = std::fs::read_to_string(&phylip)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "\t2");
        assert_eq!(lines[1], "short      0 0.125");
        assert_eq!(lines[2], "a_very_lon 0.125 0");

        let tsv = dir.path().join("dist.tsv");
        dist.write_tsv(&tsv)?;
        let text = std::fs::read_to_string(&tsv)?;
        assert_eq!(text.lines().next(), Some("\tshort\ta_very_long_sample_name"));
        assert_eq!(text.lines().nth(1), Some("short\t0\t0.125"));

        Ok(())
    }

    #[test]
    fn test_from_rows_checks_shape() {
        let names = vec!["A".to_string(), "B".to_string()];
        assert!(DistanceMatrix::from_rows(names, vec![vec![0.0]]).is_err());
    }
}
