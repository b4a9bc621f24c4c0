//! Probability, Invert and PiValue stages: global pi-values from the corpus
//! counts.
//!
//! Probability normalizes each count by the number of substrings of its
//! length. Invert sends the probability of every k-mer to the k-mers that
//! named it as a sub-k-mer, so each k-mer of length at least `start` ends up
//! with the four probabilities its pi-value needs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::distribution::KmerCount;
use crate::error::{CcvError, Result};
use crate::pipeline::dataset::Dataset;
use crate::pipeline::mapreduce::{Mapper, Output, Reducer, Shuffle, map_only};
use crate::pi_value::{pi_from_probabilities, sub_kmers};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KmerProbability {
    pub p: f64,
    pub parents: BTreeSet<String>,
}

struct ProbabilityMapper {
    total_length: u64,
}

impl Mapper<String, KmerCount> for ProbabilityMapper {
    type OutKey = String;
    type OutValue = KmerProbability;

    fn map(
        &mut self,
        kmer: String,
        count: KmerCount,
        out: &mut Output<String, KmerProbability>,
    ) -> Result<()> {
        if count.count == 0 {
            return Ok(());
        }

        let total = (self.total_length + 1).saturating_sub(kmer.len() as u64);
        if total == 0 {
            return Err(CcvError::UndefinedStatistic { kmer });
        }

        let p = count.count as f64 / total as f64;
        out.collect(
            kmer,
            KmerProbability {
                p,
                parents: count.parents,
            },
        );

        Ok(())
    }
}

pub fn probabilities(
    counts: &Dataset<String, KmerCount>,
    total_length: u64,
    output: &Path,
) -> Result<Dataset<String, KmerProbability>> {
    map_only(counts, || ProbabilityMapper { total_length }, output)
}

struct InvertMapper {
    start: usize,
}

impl Mapper<String, KmerProbability> for InvertMapper {
    type OutKey = String;
    type OutValue = (String, f64);

    fn map(
        &mut self,
        kmer: String,
        prob: KmerProbability,
        out: &mut Output<String, (String, f64)>,
    ) -> Result<()> {
        for parent in prob.parents {
            out.collect(parent, (kmer.clone(), prob.p));
        }
        if kmer.len() >= self.start {
            out.collect(kmer.clone(), (kmer, prob.p));
        }

        Ok(())
    }
}

struct CollectProbabilities;

impl Reducer<String, (String, f64)> for CollectProbabilities {
    type OutKey = String;
    type OutValue = BTreeMap<String, f64>;

    fn reduce(
        &self,
        kmer: String,
        values: Vec<(String, f64)>,
        out: &mut Vec<(String, BTreeMap<String, f64>)>,
    ) -> Result<()> {
        out.push((kmer, values.into_iter().collect()));
        Ok(())
    }
}

pub fn invert(
    probabilities: &Dataset<String, KmerProbability>,
    start: usize,
    work_dir: &Path,
    reducers: usize,
    output: &Path,
) -> Result<Dataset<String, BTreeMap<String, f64>>> {
    let mut shuffle = Shuffle::new("invert", work_dir, reducers)?;
    shuffle.map(probabilities, || InvertMapper { start }, None)?;
    shuffle.reduce(&CollectProbabilities, output)
}

struct PiValueMapper;

impl Mapper<String, BTreeMap<String, f64>> for PiValueMapper {
    type OutKey = String;
    type OutValue = f64;

    fn map(
        &mut self,
        kmer: String,
        probs: BTreeMap<String, f64>,
        out: &mut Output<String, f64>,
    ) -> Result<()> {
        let lookup = |sub: &str| {
            probs
                .get(sub)
                .copied()
                .ok_or_else(|| CcvError::MissingKmer {
                    kmer: sub.to_string(),
                    context: kmer.clone(),
                })
        };

        let (prefix, suffix, middle) = sub_kmers(&kmer);
        let (p, p1, p2, p3) = (lookup(&kmer)?, lookup(prefix)?, lookup(suffix)?, lookup(middle)?);
        if p1 == 0.0 || p2 == 0.0 || p3 == 0.0 {
            return Err(CcvError::UndefinedStatistic { kmer });
        }

        let pi = pi_from_probabilities(p, p1, p2, p3);
        out.collect(kmer, pi);

        Ok(())
    }
}

pub fn pi_values(
    inverted: &Dataset<String, BTreeMap<String, f64>>,
    output: &Path,
) -> Result<Dataset<String, f64>> {
    map_only(inverted, || PiValueMapper, output)
}
