//! K-mer count distributions over a range of window sizes.
//!
//! A `CompositionDistribution` counts every substring of each window size in
//! `[start - 2, end]` for one sample, or for the corpus aggregate. Counts live
//! in a pluggable `KmerStore`:
//! - `MemoryStore`: hash tables keyed by k-mer.
//! - `SqliteStore`: rows of `comp_dist_map_t`, written in batched transactions.
//! - `DatasetStore`: occurrence and witness records combined into a count dataset.
//!
//! Appending a second sequence to a distribution does not correct for k-mers that
//! would span the join of the two sequences. Merging distributions sums their
//! counts and lengths, so the aggregate has the same behaviour.

pub mod dataset;
pub mod memory;
pub mod sqlite;

use log::debug;

use crate::error::{CcvError, Result};
use crate::params::CcvParams;
use crate::sequence::Sequence;

pub use dataset::{DatasetStore, KmerCount, WitnessEmitter};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Lazy sequence of `(kmer, count)` pairs for one window size.
pub type KmerIter<'a> = Box<dyn Iterator<Item = Result<(String, u64)>> + 'a>;

/// Backing storage for k-mer counts. The window size of a k-mer is its length.
pub trait KmerStore {
    /// Add `count` to the count of `kmer`.
    fn put(&mut self, kmer: &str, count: u64) -> Result<()>;

    /// Make all previous puts visible to `get`, `kmers` and `size`.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Count of `kmer`, or 0 if it was never seen.
    fn get(&self, kmer: &str) -> Result<u64>;

    /// All k-mers of the given window size with a non-zero count.
    fn kmers(&self, window: usize) -> Result<KmerIter<'_>>;

    /// Number of distinct k-mers of the given window size.
    fn size(&self, window: usize) -> Result<usize>;
}

pub struct CompositionDistribution<S: KmerStore = MemoryStore> {
    params: CcvParams,
    length: u64,
    store: S,
}

impl CompositionDistribution<MemoryStore> {
    pub fn new(params: CcvParams) -> Self {
        CompositionDistribution::with_store(params, MemoryStore::new())
    }

    /// Build an in-memory distribution for a single sequence.
    pub fn from_sequence(params: CcvParams, seq: &Sequence) -> Result<Self> {
        let mut dist = CompositionDistribution::new(params);
        dist.add_sequence(seq)?;
        Ok(dist)
    }
}

impl<S: KmerStore> CompositionDistribution<S> {
    pub fn with_store(params: CcvParams, store: S) -> Self {
        CompositionDistribution {
            params,
            length: 0,
            store,
        }
    }

    /// Wrap a store whose counts already cover `length` residues.
    pub fn from_parts(params: CcvParams, length: u64, store: S) -> Self {
        CompositionDistribution {
            params,
            length,
            store,
        }
    }

    /// Count all substrings of every window size of a sequence.
    ///
    /// Sequences shorter than the end window size are rejected with
    /// `SequenceTooShort` and leave the distribution unchanged.
    pub fn add_sequence(&mut self, seq: &Sequence) -> Result<()> {
        if seq.len() < self.params.end() {
            return Err(CcvError::SequenceTooShort {
                name: seq.name().to_string(),
                length: seq.len(),
                end: self.params.end(),
            });
        }

        let residues = seq.residues();
        for window in self.params.count_windows() {
            for pos in 0..=(residues.len() - window) {
                self.store.put(&residues[pos..pos + window], 1)?;
            }
        }
        self.store.flush()?;

        self.length += seq.len() as u64;
        debug!(
            "Added {} ({} residues) to distribution",
            seq.name(),
            seq.len()
        );

        Ok(())
    }

    /// Add the counts and length of another distribution to this one.
    pub fn merge<T: KmerStore>(&mut self, other: &CompositionDistribution<T>) -> Result<()> {
        self.params.check_compatibility(&other.params)?;

        for window in self.params.count_windows() {
            for entry in other.kmers(window)? {
                let (kmer, count) = entry?;
                self.store.put(&kmer, count)?;
            }
        }
        self.store.flush()?;
        self.length += other.length;

        Ok(())
    }

    pub fn params(&self) -> &CcvParams {
        &self.params
    }

    /// Total number of residues added.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Number of substrings of the given window size, `length - window + 1`.
    pub fn total_substrings(&self, window: usize) -> u64 {
        (self.length + 1).saturating_sub(window as u64)
    }

    pub fn count(&self, kmer: &str) -> Result<u64> {
        self.store.get(kmer)
    }

    pub fn kmers(&self, window: usize) -> Result<KmerIter<'_>> {
        self.store.kmers(window)
    }

    pub fn size(&self, window: usize) -> Result<usize> {
        self.store.size(window)
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
