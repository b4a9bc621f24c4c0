//! Sparse feature matrices and the vector file.
//!
//! Rows follow the feature set order and columns follow the sample order given
//! by the caller. Cells hold pi-values; k-mers absent from a sample are
//! implicit zeros.
//!
//! The vector file is JSON:
//!
//! ```text
//! { "properties": { "begin": 3, "end": 9, "topNmers": 2 },
//!   "features": ["ACG", "TTTA"],
//!   "samples": [ { "name": "A", "data": { "0": 0.25, "1": -0.5 } } ] }
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use log::{debug, warn};
use ndarray::Array2;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};

use crate::error::{CcvError, Result};
use crate::feature::FeatureSet;
use crate::io_utils::create_writer;
use crate::params::CcvParams;
use crate::vector::CompleteCompositionVector;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Properties {
    begin: usize,
    end: usize,
    top_nmers: usize,
}

#[derive(Serialize, Deserialize)]
struct SampleEntry {
    name: String,
    data: BTreeMap<usize, f64>,
}

#[derive(Serialize, Deserialize)]
struct VectorFile {
    properties: Properties,
    features: Vec<String>,
    samples: Vec<SampleEntry>,
}

fn shifted_square(x: f64, shift: f64) -> f64 {
    (x - shift) * (x - shift)
}

/// Shift and scale applied to one feature row before computing distances.
///
/// For a row `x` over `n` samples, `shift = max|x| / n` and
/// `scale = max (x - shift)^2 / n`. Values map to `(x - shift) / scale`, or to
/// `x - shift` when the scale is zero.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowScale {
    pub shift: f64,
    pub scale: f64,
}

impl RowScale {
    /// Row scale from the non-zero values of a row over `n` samples.
    pub fn from_nonzeros(values: &[f64], n: usize) -> Self {
        let n_f = n as f64;
        let shift = values.iter().fold(0.0f64, |m, x| m.max(x.abs())) / n_f;

        let mut max_sq = values
            .iter()
            .fold(0.0f64, |m, x| m.max(shifted_square(*x, shift)));
        if values.len() < n {
            max_sq = max_sq.max(shifted_square(0.0, shift));
        }

        RowScale {
            shift,
            scale: max_sq / n_f,
        }
    }

    pub fn apply(&self, x: f64) -> f64 {
        if self.scale == 0.0 {
            x - self.shift
        } else {
            (x - self.shift) * (1.0 / self.scale)
        }
    }
}

/// Allocate a zeroed dense buffer, reporting failure instead of aborting.
pub fn allocate_dense(features: usize, samples: usize) -> Result<Vec<f64>> {
    let exhausted = CcvError::MemoryExhaustion { features, samples };
    let len = match features.checked_mul(samples) {
        Some(len) => len,
        None => return Err(exhausted),
    };

    let mut data = Vec::new();
    if data.try_reserve_exact(len).is_err() {
        return Err(exhausted);
    }
    data.resize(len, 0.0);

    Ok(data)
}

#[derive(Clone, Debug)]
pub struct FeatureMatrix {
    features: FeatureSet,
    names: Vec<String>,
    matrix: CsMat<f64>,
}

impl FeatureMatrix {
    /// Matrix of the given features over the samples, in the given order.
    pub fn assemble(features: &FeatureSet, vectors: &[CompleteCompositionVector]) -> Self {
        let mut columns = Vec::with_capacity(vectors.len());
        for vector in vectors {
            let column: Vec<(usize, f64)> = features
                .features()
                .iter()
                .enumerate()
                .map(|(row, kmer)| (row, vector.pi(kmer)))
                .filter(|(_, pi)| *pi != 0.0)
                .collect();
            columns.push(column);
        }

        let names = vectors.iter().map(|v| v.name().to_string()).collect();
        Self::build(features.clone(), names, columns)
    }

    /// Matrix from sparse `(row, value)` columns.
    pub fn from_columns(
        features: FeatureSet,
        names: Vec<String>,
        columns: Vec<Vec<(usize, f64)>>,
    ) -> Result<Self> {
        if names.len() != columns.len() {
            return Err(CcvError::format(
                "feature matrix",
                format!("{} sample names for {} columns", names.len(), columns.len()),
            ));
        }
        for (name, column) in names.iter().zip(&columns) {
            if let Some((row, _)) = column.iter().find(|(row, _)| *row >= features.len()) {
                return Err(CcvError::format(
                    "feature matrix",
                    format!(
                        "sample '{}' has feature index {} but only {} features exist",
                        name,
                        row,
                        features.len()
                    ),
                ));
            }
        }

        Ok(Self::build(features, names, columns))
    }

    fn build(features: FeatureSet, names: Vec<String>, columns: Vec<Vec<(usize, f64)>>) -> Self {
        let mut tri = TriMat::new((features.len(), names.len()));
        for (col, column) in columns.into_iter().enumerate() {
            for (row, value) in column {
                if value != 0.0 {
                    tri.add_triplet(row, col, value);
                }
            }
        }
        let matrix: CsMat<f64> = tri.to_csc();
        debug!(
            "Feature matrix: {} features x {} samples, {} non-zero",
            features.len(),
            names.len(),
            matrix.nnz()
        );

        FeatureMatrix {
            features,
            names,
            matrix,
        }
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn params(&self) -> &CcvParams {
        self.features.params()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn num_features(&self) -> usize {
        self.matrix.rows()
    }

    pub fn num_samples(&self) -> usize {
        self.matrix.cols()
    }

    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.matrix.get(row, col).copied().unwrap_or(0.0)
    }

    /// Non-zero `(row, value)` entries of a sample column.
    pub fn column(&self, col: usize) -> Vec<(usize, f64)> {
        self.matrix
            .outer_view(col)
            .map(|view| view.iter().map(|(row, v)| (row, *v)).collect())
            .unwrap_or_default()
    }

    /// Rows with a non-zero value in a sample column.
    pub fn column_support(&self, col: usize) -> FxHashSet<usize> {
        self.column(col).into_iter().map(|(row, _)| row).collect()
    }

    /// Non-zero values of every row.
    fn row_values(&self) -> Vec<Vec<f64>> {
        let mut rows = vec![Vec::new(); self.num_features()];
        for col_view in self.matrix.outer_iterator() {
            for (row, v) in col_view.iter() {
                rows[row].push(*v);
            }
        }

        rows
    }

    pub fn row_scales(&self) -> Vec<RowScale> {
        let n = self.num_samples();
        self.row_values()
            .iter()
            .map(|values| RowScale::from_nonzeros(values, n))
            .collect()
    }

    /// Dense copy with every row shifted and scaled; the matrix is unchanged.
    pub fn normalized(&self) -> Result<Array2<f64>> {
        let (rows, cols) = (self.num_features(), self.num_samples());
        let mut data = allocate_dense(rows, cols)?;

        let scales = self.row_scales();
        for (row, scale) in scales.iter().enumerate() {
            let zero = scale.apply(0.0);
            data[row * cols..(row + 1) * cols].fill(zero);
        }
        for (col, col_view) in self.matrix.outer_iterator().enumerate() {
            for (row, v) in col_view.iter() {
                data[row * cols + col] = scales[row].apply(*v);
            }
        }

        Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| CcvError::format("feature matrix", e.to_string()))
    }

    /// Write the vector file.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let samples = self
            .names
            .iter()
            .enumerate()
            .map(|(col, name)| SampleEntry {
                name: name.clone(),
                data: self.column(col).into_iter().collect(),
            })
            .collect();

        let file = VectorFile {
            properties: Properties {
                begin: self.params().start(),
                end: self.params().end(),
                top_nmers: self.num_features(),
            },
            features: self.features.features().to_vec(),
            samples,
        };

        let mut writer = create_writer(path)?;
        serde_json::to_writer(&mut writer, &file)?;
        writer.flush()?;

        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let file: VectorFile = serde_json::from_reader(reader)?;

        let params = CcvParams::new(file.properties.begin, file.properties.end)?;
        let features = FeatureSet::new(params, file.features);
        if file.properties.top_nmers != features.len() {
            warn!(
                "{}: topNmers is {} but {} features are listed",
                path.display(),
                file.properties.top_nmers,
                features.len()
            );
        }

        let (names, columns): (Vec<String>, Vec<Vec<(usize, f64)>>) = file
            .samples
            .into_iter()
            .map(|sample| (sample.name, sample.data.into_iter().collect::<Vec<_>>()))
            .unzip();

        Self::from_columns(features, names, columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn matrix() -> FeatureMatrix {
        let params = CcvParams::new(3, 4).unwrap();
        let features = FeatureSet::new(
            params,
            vec!["ACG".to_string(), "TTT".to_string(), "ACGT".to_string()],
        );
        FeatureMatrix::from_columns(
            features,
            vec!["A".to_string(), "B".to_string()],
            vec![vec![(0, 0.5), (2, -1.0)], vec![(0, 0.25), (1, 2.0)]],
        )
        .unwrap()
    }

    #[test]
    fn test_assemble_preserves_order() -> Result<()> {
        let params = CcvParams::new(3, 4)?;
        let mut a = CompleteCompositionVector::new(0, "A", params);
        a.insert("ACG".to_string(), 0.5);
        a.insert("GGG".to_string(), 1.5);
        let mut b = CompleteCompositionVector::new(1, "B", params);
        b.insert("TTTT".to_string(), -2.0);

        let features = FeatureSet::new(params, vec!["TTTT".to_string(), "ACG".to_string()]);
        let m = FeatureMatrix::assemble(&features, &[b, a]);

        assert_eq!(m.names(), ["B", "A"]);
        assert_eq!(m.get(0, 0), -2.0);
        assert_eq!(m.get(1, 1), 0.5);
        assert_eq!(m.get(1, 0), 0.0);
        assert_eq!(m.nnz(), 2);

        Ok(())
    }

    #[test]
    fn test_from_columns_rejects_bad_index() -> Result<()> {
        let features = FeatureSet::new(CcvParams::new(3, 4)?, vec!["ACG".to_string()]);
        let result = FeatureMatrix::from_columns(features, vec!["A".to_string()], vec![vec![(3, 1.0)]]);
        assert!(matches!(result, Err(CcvError::Format { .. })));

        Ok(())
    }

    #[test]
    fn test_row_scale() {
        // row [0.5, 0.25]: shift = 0.25, scale = max(0.0625, 0) / 2
        let scale = RowScale::from_nonzeros(&[0.5, 0.25], 2);
        assert_eq!(scale.shift, 0.25);
        assert_eq!(scale.scale, 0.03125);
        assert_eq!(scale.apply(0.5), 8.0);

        // row [2.0, 0.0]: zeros count towards the scale
        let scale = RowScale::from_nonzeros(&[2.0], 2);
        assert_eq!(scale.shift, 1.0);
        assert_eq!(scale.scale, 0.5);
        assert_eq!(scale.apply(0.0), -2.0);

        let scale = RowScale::from_nonzeros(&[], 3);
        assert_eq!(scale.apply(0.0), 0.0);
    }

    #[test]
    fn test_normalized_leaves_matrix_unchanged() -> Result<()> {
        let m = matrix();
        let dense = m.normalized()?;

        assert_eq!(dense.dim(), (3, 2));
        assert_eq!(dense[[0, 0]], 8.0);
        assert_eq!(dense[[1, 0]], -2.0);
        assert_eq!(m.get(0, 0), 0.5);

        Ok(())
    }

    #[test]
    fn test_vector_file_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("vectors.json");
        let m = matrix();

        m.write_json(&path)?;
        let loaded = FeatureMatrix::read_json(&path)?;

        assert_eq!(loaded.params(), m.params());
        assert_eq!(loaded.features(), m.features());
        assert_eq!(loaded.names(), m.names());
        for col in 0..m.num_samples() {
            assert_eq!(loaded.column(col), m.column(col));
        }

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(json["properties"]["topNmers"], 3);
        assert_eq!(json["samples"][1]["data"]["1"], 2.0);

        Ok(())
    }

    #[test]
    fn test_allocate_dense() -> Result<()> {
        assert_eq!(allocate_dense(3, 2)?, vec![0.0; 6]);
        assert!(allocate_dense(0, 5)?.is_empty());

        assert!(matches!(
            allocate_dense(usize::MAX, 2),
            Err(CcvError::MemoryExhaustion {
                features: usize::MAX,
                samples: 2
            })
        ));
        // no overflow, but far beyond any address space
        assert!(matches!(
            allocate_dense(1 << 60, 1),
            Err(CcvError::MemoryExhaustion { .. })
        ));

        Ok(())
    }
}
