//! Revised relative entropy scoring and feature selection.
//!
//! Each corpus k-mer is scored against the global (corpus) pi-value:
//!
//! ```text
//! score = | sum over samples with pi_local != 0 of |pi_local| * ln(|pi_local / pi_global|) |
//! ```
//!
//! Scores are ordered by decreasing value, ties broken by k-mer. Features are
//! taken from the front of that order. The number of features is either given,
//! implied by a score threshold of 1.0, or chosen by a two-segment profile
//! likelihood over the ordered scores.

use std::cmp::Ordering;
use std::f64::consts::PI;
use std::io::Write;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::feature::FeatureSet;
use crate::io_utils::create_writer;
use crate::params::CcvParams;
use crate::vector::CompleteCompositionVector;

pub const DEFAULT_LOOK_AHEAD: usize = 200;

/// Minimum score kept by `Selection::AtLeastOne`.
pub const SCORE_THRESHOLD: f64 = 1.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntropyScore {
    pub kmer: String,
    pub score: f64,
}

impl EntropyScore {
    pub fn new(kmer: impl Into<String>, score: f64) -> Self {
        EntropyScore {
            kmer: kmer.into(),
            score,
        }
    }

    /// Selection order: decreasing score, then increasing k-mer.
    pub fn selection_cmp(&self, other: &EntropyScore) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.kmer.cmp(&other.kmer))
    }
}

/// How many of the ordered k-mers become features.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// Every scored k-mer.
    All,
    /// The `n` highest scoring k-mers, or all if fewer are available.
    TopN(usize),
    /// Every k-mer with a score of at least 1.0.
    AtLeastOne,
    /// Feature count chosen by profile likelihood.
    ProfileLikelihood { look_ahead: usize },
}

impl Selection {
    /// Interpret a signed `topNmers` value: positive selects that many, zero
    /// applies the score threshold, negative uses profile likelihood with
    /// `-top_nmers` as the look-ahead, and `None` keeps everything.
    pub fn from_top_nmers(top_nmers: Option<i64>) -> Self {
        match top_nmers {
            None => Selection::All,
            Some(0) => Selection::AtLeastOne,
            Some(n) if n > 0 => Selection::TopN(n as usize),
            Some(n) => Selection::ProfileLikelihood {
                look_ahead: n.unsigned_abs() as usize,
            },
        }
    }
}

/// Revised relative entropy of one k-mer.
pub fn revised_relative_entropy(local: impl IntoIterator<Item = f64>, global: f64) -> f64 {
    local
        .into_iter()
        .filter(|pi| *pi != 0.0)
        .fold(0.0, |ent, pi| ent + pi.abs() * (pi / global).abs().ln())
        .abs()
}

/// Sort scores into selection order.
pub fn sort_scores(scores: &mut [EntropyScore]) {
    scores.sort_by(EntropyScore::selection_cmp);
}

/// Score k-mers against the global vector, summing samples in order.
pub fn score_kmers(
    kmers: &[String],
    global: &CompleteCompositionVector,
    samples: &[CompleteCompositionVector],
) -> Vec<EntropyScore> {
    let mut scores: Vec<EntropyScore> = kmers
        .iter()
        .map(|kmer| {
            let score =
                revised_relative_entropy(samples.iter().map(|s| s.pi(kmer)), global.pi(kmer));
            EntropyScore::new(kmer.as_str(), score)
        })
        .collect();
    sort_scores(&mut scores);

    scores
}

/// Mean and population variance by Welford's algorithm.
fn mean_variance(values: &[f64]) -> (f64, f64) {
    let mut mean = 0.0;
    let mut s = 0.0;
    for (i, x) in values.iter().enumerate() {
        let delta = x - mean;
        mean += delta / (i + 1) as f64;
        s += delta * (x - mean);
    }

    (mean, s / values.len() as f64)
}

fn gaussian(x: f64, mean: f64, var: f64) -> f64 {
    (1.0 / (2.0 * PI * var)) * (-(x - mean).powi(2) / (2.0 * var)).exp()
}

fn segment_likelihood(values: &[f64], mean: f64, var: f64) -> f64 {
    values
        .iter()
        .map(|x| gaussian(*x, mean, var))
        .filter(|g| *g > 0.0)
        .sum()
}

/// Number of leading scores that maximizes the two-segment likelihood.
///
/// `scores` must be in selection order. Scanning stops once the split point is
/// more than `look_ahead` past the best split so far. A `look_ahead` of 1 or
/// less uses the default of 200.
pub fn profile_likelihood(scores: &[f64], look_ahead: usize) -> usize {
    let p = scores.len();
    if p < 2 {
        return p;
    }
    let look_ahead = if look_ahead > 1 {
        look_ahead
    } else {
        DEFAULT_LOOK_AHEAD
    };

    let mut optim = 0;
    let mut max_likelihood = f64::MIN;
    for count in 1..p {
        let (head, tail) = scores.split_at(count);
        let (u1, v1) = mean_variance(head);
        let (u2, v2) = mean_variance(tail);
        let var = ((count - 1) as f64 * v1 + (p - count - 1) as f64 * v2) / (p - 2) as f64;

        let likelihood = segment_likelihood(head, u1, var) + segment_likelihood(tail, u2, var);
        if likelihood > max_likelihood {
            max_likelihood = likelihood;
            optim = count;
        }

        if count > optim + look_ahead {
            break;
        }
    }

    debug!("Profile likelihood selected {optim} of {p} k-mers");
    optim
}

/// Select features from scores in selection order.
pub fn select_features(
    scores: &[EntropyScore],
    selection: Selection,
    params: CcvParams,
) -> FeatureSet {
    let count = match selection {
        Selection::All => scores.len(),
        Selection::AtLeastOne => scores
            .iter()
            .take_while(|s| s.score >= SCORE_THRESHOLD)
            .count(),
        Selection::TopN(n) => {
            if n > scores.len() {
                info!(
                    "Asked for {} top k-mers, but only {} are available; using all of them.",
                    n,
                    scores.len()
                );
            }
            n.min(scores.len())
        }
        Selection::ProfileLikelihood { look_ahead } => {
            let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
            profile_likelihood(&values, look_ahead)
        }
    };

    info!("Selected {} of {} k-mers as features.", count, scores.len());
    FeatureSet::new(
        params,
        scores[..count].iter().map(|s| s.kmer.clone()).collect(),
    )
}

/// Write scores as `kmer<TAB>score` lines.
pub fn write_entropy_file(path: &Path, scores: &[EntropyScore]) -> Result<()> {
    let mut writer = create_writer(path)?;
    for s in scores {
        writeln!(writer, "{}\t{}", s.kmer, s.score)?;
    }
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CcvParams {
        CcvParams::new(3, 4).unwrap()
    }

    fn scores() -> Vec<EntropyScore> {
        let mut scores = vec![
            EntropyScore::new("AAA", 0.5),
            EntropyScore::new("CCC", 3.0),
            EntropyScore::new("GGG", 1.0),
            EntropyScore::new("TTT", 2.0),
            EntropyScore::new("ACG", 1.0),
            EntropyScore::new("CGT", 0.0),
        ];
        sort_scores(&mut scores);
        scores
    }

    #[test]
    fn test_selection_order() {
        let kmers: Vec<_> = scores().into_iter().map(|s| s.kmer).collect();
        assert_eq!(kmers, vec!["CCC", "TTT", "ACG", "GGG", "AAA", "CGT"]);
    }

    #[test]
    fn test_revised_relative_entropy() {
        // zero local values do not contribute
        let ent = revised_relative_entropy([0.5, 0.0, -0.25], 0.5);
        let expected = (0.5 * 1.0f64.ln() + 0.25 * 0.5f64.ln()).abs();
        assert!((ent - expected).abs() < 1e-12);
        assert_eq!(revised_relative_entropy([0.0, 0.0], 0.3), 0.0);
    }

    #[test]
    fn test_threshold_selection() {
        let features = select_features(&scores(), Selection::AtLeastOne, params());
        assert_eq!(features.features(), ["CCC", "TTT", "ACG", "GGG"]);
    }

    #[test]
    fn test_top_n_larger_than_available() {
        let features = select_features(&scores(), Selection::TopN(100), params());
        assert_eq!(features.len(), 6);

        let features = select_features(&scores(), Selection::TopN(2), params());
        assert_eq!(features.features(), ["CCC", "TTT"]);
    }

    #[test]
    fn test_from_top_nmers() {
        assert_eq!(Selection::from_top_nmers(None), Selection::All);
        assert_eq!(Selection::from_top_nmers(Some(0)), Selection::AtLeastOne);
        assert_eq!(Selection::from_top_nmers(Some(50)), Selection::TopN(50));
        assert_eq!(
            Selection::from_top_nmers(Some(-10)),
            Selection::ProfileLikelihood { look_ahead: 10 }
        );
    }

    #[test]
    fn test_profile_likelihood_finds_gap() {
        // ten high scores followed by forty low ones
        let mut values = vec![10.0, 10.2, 9.8, 10.1, 9.9, 10.0, 10.3, 9.7, 10.0, 10.0];
        values.extend((0..40).map(|i| 1.0 + (i % 5) as f64 * 0.05));

        assert_eq!(profile_likelihood(&values, DEFAULT_LOOK_AHEAD), 10);
    }

    #[test]
    fn test_profile_likelihood_small_inputs() {
        assert_eq!(profile_likelihood(&[], 200), 0);
        assert_eq!(profile_likelihood(&[4.0], 200), 1);
        assert_eq!(profile_likelihood(&[4.0, 1.0], 200), 1);
    }

    #[test]
    fn test_mean_variance() {
        let (mean, var) = mean_variance(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-12);
        assert!((var - 4.0).abs() < 1e-12);
    }
}
