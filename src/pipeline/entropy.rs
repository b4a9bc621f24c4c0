//! Entropy, Sort and Selection stages.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::entropy::{EntropyScore, Selection, revised_relative_entropy, select_features, write_entropy_file};
use crate::error::{CcvError, Result};
use crate::feature::FeatureSet;
use crate::params::CcvParams;
use crate::pipeline::compvec::SampleWindow;
use crate::pipeline::dataset::Dataset;
use crate::pipeline::mapreduce::{Mapper, Output, Reducer, Shuffle};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntropyInput {
    Local { sample_index: usize, pi: f64 },
    Global(f64),
}

struct LocalPiMapper;

impl Mapper<String, SampleWindow> for LocalPiMapper {
    type OutKey = String;
    type OutValue = EntropyInput;

    fn map(&mut self, _: String, window: SampleWindow, out: &mut Output<String, EntropyInput>) -> Result<()> {
        for (kmer, pi) in window.vector.iter() {
            if *pi != 0.0 {
                out.collect(
                    kmer.clone(),
                    EntropyInput::Local {
                        sample_index: window.sample_index,
                        pi: *pi,
                    },
                );
            }
        }

        Ok(())
    }
}

struct GlobalPiMapper;

impl Mapper<String, f64> for GlobalPiMapper {
    type OutKey = String;
    type OutValue = EntropyInput;

    fn map(&mut self, kmer: String, pi: f64, out: &mut Output<String, EntropyInput>) -> Result<()> {
        out.collect(kmer, EntropyInput::Global(pi));
        Ok(())
    }
}

struct EntropyReducer;

impl Reducer<String, EntropyInput> for EntropyReducer {
    type OutKey = String;
    type OutValue = f64;

    fn reduce(&self, kmer: String, values: Vec<EntropyInput>, out: &mut Vec<(String, f64)>) -> Result<()> {
        let mut global = None;
        let mut local = Vec::with_capacity(values.len());
        for value in values {
            match value {
                EntropyInput::Local { sample_index, pi } => local.push((sample_index, pi)),
                EntropyInput::Global(pi) => global = Some(pi),
            }
        }

        let global = global.ok_or_else(|| CcvError::MissingKmer {
            kmer: kmer.clone(),
            context: "global pi-values".to_string(),
        })?;

        // samples are summed in index order
        local.sort_unstable_by_key(|(sample_index, _)| *sample_index);
        let score = revised_relative_entropy(local.into_iter().map(|(_, pi)| pi), global);
        out.push((kmer, score));

        Ok(())
    }
}

/// Revised relative entropy of every k-mer with a global pi-value.
pub fn entropy(
    windows: &Dataset<String, SampleWindow>,
    global: &Dataset<String, f64>,
    work_dir: &Path,
    reducers: usize,
    output: &Path,
) -> Result<Dataset<String, f64>> {
    let mut shuffle = Shuffle::new("entropy", work_dir, reducers)?;
    shuffle.map(windows, || LocalPiMapper, None)?;
    shuffle.map(global, || GlobalPiMapper, None)?;
    shuffle.reduce(&EntropyReducer, output)
}

/// Entropy score keyed in selection order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SortKey(pub EntropyScore);

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.selection_cmp(&other.0)
    }
}

impl Hash for SortKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.kmer.hash(state);
    }
}

struct SortMapper;

impl Mapper<String, f64> for SortMapper {
    type OutKey = SortKey;
    type OutValue = ();

    fn map(&mut self, kmer: String, score: f64, out: &mut Output<SortKey, ()>) -> Result<()> {
        out.collect(SortKey(EntropyScore::new(kmer, score)), ());
        Ok(())
    }
}

struct SortReducer;

impl Reducer<SortKey, ()> for SortReducer {
    type OutKey = String;
    type OutValue = f64;

    fn reduce(&self, key: SortKey, _: Vec<()>, out: &mut Vec<(String, f64)>) -> Result<()> {
        out.push((key.0.kmer, key.0.score));
        Ok(())
    }
}

/// Scores in selection order, in a single partition.
pub fn sort(scores: &Dataset<String, f64>, work_dir: &Path, output: &Path) -> Result<Dataset<String, f64>> {
    let mut shuffle = Shuffle::new("sort", work_dir, 1)?;
    shuffle.map(scores, || SortMapper, None)?;
    shuffle.reduce(&SortReducer, output)
}

/// Select features from the sorted scores, optionally writing them all to an
/// entropy file.
pub fn select(
    sorted: &Dataset<String, f64>,
    selection: Selection,
    params: CcvParams,
    entropy_file: Option<&Path>,
) -> Result<FeatureSet> {
    let scores: Vec<EntropyScore> = sorted
        .read_all()?
        .into_iter()
        .map(|(kmer, score)| EntropyScore::new(kmer, score))
        .collect();

    if let Some(path) = entropy_file {
        write_entropy_file(path, &scores)?;
    }

    Ok(select_features(&scores, selection, params))
}
