//! Markov-model pi-values.
//!
//! For a k-mer `a1..ak` with count `c` among `T` substrings of length `k`:
//!
//! ```text
//! p  = c(a1..ak)     / T
//! p1 = c(a1..ak-1)   / (T + 1)
//! p2 = c(a2..ak)     / (T + 1)
//! p3 = c(a2..ak-1)   / (T + 2)
//! pe = p1 * p2 / p3
//! pi = (p - pe) / pe
//! ```
//!
//! The `+1` and `+2` offsets are the substring totals of the two shorter window sizes.

use crate::distribution::{CompositionDistribution, KmerStore};
use crate::error::{CcvError, Result};
use crate::vector::CompositionVector;

/// Pi-value from the counts of a k-mer and its three sub-k-mers.
///
/// Returns `UndefinedStatistic` if `total_substrings`, `cnt3`, or the expected
/// probability is zero.
pub fn calculate_pi(
    kmer: &str,
    cnt: u64,
    cnt1: u64,
    cnt2: u64,
    cnt3: u64,
    total_substrings: u64,
) -> Result<f64> {
    if total_substrings == 0 || cnt1 == 0 || cnt2 == 0 || cnt3 == 0 {
        return Err(CcvError::UndefinedStatistic {
            kmer: kmer.to_string(),
        });
    }

    let total = total_substrings as f64;
    let p = cnt as f64 / total;
    let p1 = cnt1 as f64 / (total + 1.0);
    let p2 = cnt2 as f64 / (total + 1.0);
    let p3 = cnt3 as f64 / (total + 2.0);

    Ok(pi_from_probabilities(p, p1, p2, p3))
}

/// Pi-value from already normalized probabilities.
pub fn pi_from_probabilities(p: f64, p1: f64, p2: f64, p3: f64) -> f64 {
    let pe = (p1 * p2) / p3;
    (p - pe) / pe
}

/// Prefix, suffix and middle sub-k-mers.
pub fn sub_kmers(kmer: &str) -> (&str, &str, &str) {
    let k = kmer.len();
    (&kmer[..k - 1], &kmer[1..], &kmer[1..k - 1])
}

/// Pi-value of a single k-mer in a distribution.
pub fn pi_value<S: KmerStore>(dist: &CompositionDistribution<S>, kmer: &str) -> Result<f64> {
    let (prefix, suffix, middle) = sub_kmers(kmer);
    calculate_pi(
        kmer,
        dist.count(kmer)?,
        dist.count(prefix)?,
        dist.count(suffix)?,
        dist.count(middle)?,
        dist.total_substrings(kmer.len()),
    )
}

/// Composition vector of every observed k-mer of one window size.
pub fn composition_vector<S: KmerStore>(
    dist: &CompositionDistribution<S>,
    window: usize,
) -> Result<CompositionVector> {
    let mut vector = CompositionVector::new(window);
    let total = dist.total_substrings(window);

    for entry in dist.kmers(window)? {
        let (kmer, cnt) = entry?;
        let (prefix, suffix, middle) = sub_kmers(&kmer);
        let pi = calculate_pi(
            &kmer,
            cnt,
            dist.count(prefix)?,
            dist.count(suffix)?,
            dist.count(middle)?,
            total,
        )?;
        vector.insert(kmer, pi);
    }

    Ok(vector)
}
