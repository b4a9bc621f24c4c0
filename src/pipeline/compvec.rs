//! Pipeline input and the CompositionVectors stage.
//!
//! The input dataset holds one record per sample, keyed by sample name. The
//! CompositionVectors stage turns each sample into one record per window size
//! holding that window's composition vector.

use std::path::Path;

use log::{info, warn};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::distribution::CompositionDistribution;
use crate::error::{CcvError, Result};
use crate::params::CcvParams;
use crate::pipeline::dataset::{Dataset, write_dataset};
use crate::pipeline::mapreduce::{Mapper, Output, map_only};
use crate::sequence::Sequence;
use crate::vector::{CompleteCompositionVector, CompositionVector};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleInput {
    pub sample_index: usize,
    pub residues: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleWindow {
    pub sample_index: usize,
    pub vector: CompositionVector,
}

/// Write the sequences as the input dataset over `workers` partitions.
///
/// Sample names are dataset keys, so a repeated name is an error. Sequences
/// shorter than the end window size are skipped and do not get an index.
pub fn write_input(
    path: &Path,
    seqs: &[Sequence],
    params: &CcvParams,
    workers: usize,
) -> Result<Dataset<String, SampleInput>> {
    let mut names = FxHashSet::default();
    let mut records = Vec::with_capacity(seqs.len());
    for seq in seqs {
        if !names.insert(seq.name()) {
            return Err(CcvError::DuplicateSample(seq.name().to_string()));
        }

        if seq.len() < params.end() {
            warn!(
                "{} has length {}, which is smaller than the end window size ({}); skipping.",
                seq.name(),
                seq.len(),
                params.end()
            );
            continue;
        }

        let input = SampleInput {
            sample_index: records.len(),
            residues: seq.residues().to_string(),
        };
        records.push((seq.name().to_string(), input));
    }

    info!("Writing {} samples over {} partitions.", records.len(), workers);
    write_dataset(path, records, workers)
}

struct CompositionVectorMapper {
    params: CcvParams,
}

impl Mapper<String, SampleInput> for CompositionVectorMapper {
    type OutKey = String;
    type OutValue = SampleWindow;

    fn map(
        &mut self,
        name: String,
        input: SampleInput,
        out: &mut Output<String, SampleWindow>,
    ) -> Result<()> {
        let seq = Sequence::new(name.as_str(), input.residues)?;
        let dist = CompositionDistribution::from_sequence(self.params, &seq)?;
        let ccv = CompleteCompositionVector::from_distribution(input.sample_index, &name, &dist)?;

        for vector in ccv.into_vectors() {
            out.collect(
                name.clone(),
                SampleWindow {
                    sample_index: input.sample_index,
                    vector,
                },
            );
        }

        Ok(())
    }
}

pub fn composition_vectors(
    input: &Dataset<String, SampleInput>,
    params: CcvParams,
    output: &Path,
) -> Result<Dataset<String, SampleWindow>> {
    map_only(input, || CompositionVectorMapper { params }, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_names(input: &Dataset<String, SampleInput>) -> Result<Vec<String>> {
        let mut samples: Vec<(usize, String)> = input
            .read_all()?
            .into_iter()
            .map(|(name, input)| (input.sample_index, name))
            .collect();
        samples.sort_unstable();

        Ok(samples.into_iter().map(|(_, name)| name).collect())
    }

    fn seqs() -> Vec<Sequence> {
        vec![
            Sequence::new("A", "ACGTACGT").unwrap(),
            Sequence::new("short", "ACG").unwrap(),
            Sequence::new("B", "ACGTTTTT").unwrap(),
        ]
    }

    #[test]
    fn test_input_skips_short_sequences() -> Result<()> {
        let dir = tempdir()?;
        let params = CcvParams::new(3, 4)?;
        let input = write_input(&dir.path().join("input"), &seqs(), &params, 2)?;

        assert_eq!(sample_names(&input)?, vec!["A", "B"]);
        let records = input.read_all()?;
        assert_eq!(records[1].1.sample_index, 1);

        Ok(())
    }

    #[test]
    fn test_duplicate_names_rejected() -> Result<()> {
        let dir = tempdir()?;
        let params = CcvParams::new(3, 4)?;
        let mut seqs = seqs();
        seqs.push(Sequence::new("A", "TTTTACGA")?);

        let result = write_input(&dir.path().join("input"), &seqs, &params, 2);
        assert!(matches!(result, Err(CcvError::DuplicateSample(name)) if name == "A"));

        Ok(())
    }

    #[test]
    fn test_one_record_per_window() -> Result<()> {
        let dir = tempdir()?;
        let params = CcvParams::new(3, 4)?;
        let input = write_input(&dir.path().join("input"), &seqs(), &params, 2)?;
        let windows = composition_vectors(&input, params, &dir.path().join("compvec"))?;

        let records = windows.read_all()?;
        assert_eq!(records.len(), 4);

        let dist = CompositionDistribution::from_sequence(params, &seqs()[2])?;
        let expected = CompleteCompositionVector::from_distribution(1, "B", &dist)?;
        for (name, window) in records.iter().filter(|(name, _)| name == "B") {
            assert_eq!(name, "B");
            assert_eq!(window.sample_index, 1);
            assert_eq!(Some(&window.vector), expected.vector(window.vector.window()));
        }

        Ok(())
    }
}
