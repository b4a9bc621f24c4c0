//! Dataset-backed k-mer store used by the distributed counting stage.
//!
//! Counting emits one record per k-mer occurrence. For k-mers of length at least
//! `start`, it also emits zero-count "witness" records for the prefix, suffix and
//! middle substrings, each naming the k-mer as a parent. Combining the records
//! by key yields the counts plus, for each k-mer, the longer k-mers that need its
//! probability. A bounded local set suppresses repeated witnesses for k-mers
//! already seen in the same partition.

use std::collections::BTreeSet;
use std::path::Path;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use super::{KmerIter, KmerStore};
use crate::error::Result;
use crate::pipeline::dataset::Dataset;

/// Default bound on the number of k-mers remembered by a `WitnessEmitter`.
pub const DEFAULT_SEEN_LIMIT: usize = 1_000_000;

/// Count of a k-mer together with the parents that require its probability.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmerCount {
    pub count: u64,
    pub parents: BTreeSet<String>,
}

impl KmerCount {
    pub fn occurrence(count: u64) -> Self {
        KmerCount {
            count,
            parents: BTreeSet::new(),
        }
    }

    pub fn witness(parent: &str) -> Self {
        KmerCount {
            count: 0,
            parents: BTreeSet::from([parent.to_string()]),
        }
    }

    pub fn merge(&mut self, other: KmerCount) {
        self.count += other.count;
        self.parents.extend(other.parents);
    }
}

/// Emits occurrence and witness records for counted k-mers.
pub struct WitnessEmitter {
    start: usize,
    seen: FxHashSet<String>,
    seen_limit: usize,
}

impl WitnessEmitter {
    /// A `seen_limit` of 0 disables witness suppression.
    pub fn new(start: usize, seen_limit: usize) -> Self {
        WitnessEmitter {
            start,
            seen: FxHashSet::default(),
            seen_limit,
        }
    }

    pub fn emit<F>(&mut self, kmer: &str, count: u64, mut sink: F) -> Result<()>
    where
        F: FnMut(String, KmerCount) -> Result<()>,
    {
        sink(kmer.to_string(), KmerCount::occurrence(count))?;

        if kmer.len() < self.start || !self.first_sighting(kmer) {
            return Ok(());
        }

        let k = kmer.len();
        sink(kmer[..k - 1].to_string(), KmerCount::witness(kmer))?;
        sink(kmer[1..].to_string(), KmerCount::witness(kmer))?;
        sink(kmer[1..k - 1].to_string(), KmerCount::witness(kmer))?;

        Ok(())
    }

    fn first_sighting(&mut self, kmer: &str) -> bool {
        if self.seen_limit == 0 {
            return true;
        }
        if self.seen.contains(kmer) {
            return false;
        }
        if self.seen.len() >= self.seen_limit {
            self.seen.clear();
        }
        self.seen.insert(kmer.to_string());

        true
    }
}

/// K-mer store whose contents are the combined occurrence and witness records.
pub struct DatasetStore {
    emitter: WitnessEmitter,
    pending: Vec<(String, KmerCount)>,
    combined: FxHashMap<String, KmerCount>,
}

impl DatasetStore {
    pub fn new(start: usize, seen_limit: usize) -> Self {
        DatasetStore {
            emitter: WitnessEmitter::new(start, seen_limit),
            pending: Vec::new(),
            combined: FxHashMap::default(),
        }
    }

    /// Open the output of the distributed Count stage.
    pub fn open(path: &Path, start: usize) -> Result<Self> {
        let dataset = Dataset::<String, KmerCount>::open(path)?;

        let mut store = DatasetStore::new(start, DEFAULT_SEEN_LIMIT);
        for (kmer, count) in dataset.read_all()? {
            store.combined.entry(kmer).or_default().merge(count);
        }

        Ok(store)
    }

    /// Combined records, including witness-only k-mers.
    pub fn records(&self) -> impl Iterator<Item = (&String, &KmerCount)> {
        self.combined.iter()
    }

    /// Parents recorded for a k-mer.
    pub fn parents(&self, kmer: &str) -> Option<&BTreeSet<String>> {
        self.combined.get(kmer).map(|count| &count.parents)
    }
}

impl KmerStore for DatasetStore {
    fn put(&mut self, kmer: &str, count: u64) -> Result<()> {
        let pending = &mut self.pending;
        self.emitter.emit(kmer, count, |key, value| {
            pending.push((key, value));
            Ok(())
        })
    }

    fn flush(&mut self) -> Result<()> {
        for (kmer, count) in self.pending.drain(..) {
            self.combined.entry(kmer).or_default().merge(count);
        }

        Ok(())
    }

    fn get(&self, kmer: &str) -> Result<u64> {
        Ok(self.combined.get(kmer).map_or(0, |count| count.count))
    }

    fn kmers(&self, window: usize) -> Result<KmerIter<'_>> {
        Ok(Box::new(
            self.combined
                .iter()
                .filter(move |(kmer, count)| kmer.len() == window && count.count > 0)
                .map(|(kmer, count)| Ok((kmer.clone(), count.count))),
        ))
    }

    fn size(&self, window: usize) -> Result<usize> {
        Ok(self
            .combined
            .iter()
            .filter(|(kmer, count)| kmer.len() == window && count.count > 0)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::CompositionDistribution;
    use crate::params::CcvParams;
    use crate::pipeline::dataset::write_dataset;
    use crate::sequence::Sequence;
    use tempfile::tempdir;

    #[test]
    fn test_witness_records() -> Result<()> {
        let mut emitter = WitnessEmitter::new(3, 10);
        let mut records = Vec::new();
        emitter.emit("ACGT", 1, |k, v| {
            records.push((k, v));
            Ok(())
        })?;

        assert_eq!(records.len(), 4);
        assert_eq!(records[0], ("ACGT".to_string(), KmerCount::occurrence(1)));
        assert_eq!(records[1], ("ACG".to_string(), KmerCount::witness("ACGT")));
        assert_eq!(records[2], ("CGT".to_string(), KmerCount::witness("ACGT")));
        assert_eq!(records[3], ("CG".to_string(), KmerCount::witness("ACGT")));

        // repeated k-mer only emits its occurrence
        records.clear();
        emitter.emit("ACGT", 1, |k, v| {
            records.push((k, v));
            Ok(())
        })?;
        assert_eq!(records.len(), 1);

        // short k-mers never emit witnesses
        records.clear();
        emitter.emit("AC", 1, |k, v| {
            records.push((k, v));
            Ok(())
        })?;
        assert_eq!(records.len(), 1);

        Ok(())
    }

    #[test]
    fn test_seen_set_is_bounded() -> Result<()> {
        let mut emitter = WitnessEmitter::new(3, 2);
        let mut witnesses = 0;
        for kmer in ["AAA", "CCC", "GGG", "AAA"] {
            emitter.emit(kmer, 1, |_, v| {
                if v.count == 0 {
                    witnesses += 1;
                }
                Ok(())
            })?;
        }

        // set was cleared when GGG arrived, so AAA is witnessed again
        assert_eq!(witnesses, 12);

        Ok(())
    }

    #[test]
    fn test_matches_memory_counts() -> Result<()> {
        let params = CcvParams::new(3, 4)?;
        let seq = Sequence::new("B", "ACGTTTTT")?;

        let memory = CompositionDistribution::from_sequence(params, &seq)?;
        let mut dataset =
            CompositionDistribution::with_store(params, DatasetStore::new(params.start(), 100));
        dataset.add_sequence(&seq)?;

        for window in params.count_windows() {
            assert_eq!(memory.size(window)?, dataset.size(window)?);
            for entry in memory.kmers(window)? {
                let (kmer, count) = entry?;
                assert_eq!(dataset.count(&kmer)?, count);
            }
        }

        let parents = dataset.store().parents("TT").unwrap();
        assert!(parents.contains("TTT"));
        assert!(parents.contains("TTTT"));
        assert!(parents.contains("GTT"));

        Ok(())
    }

    #[test]
    fn test_open_count_dataset() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("count");
        let records = vec![
            ("AC".to_string(), KmerCount::occurrence(2)),
            ("AC".to_string(), KmerCount::witness("ACG")),
            ("ACG".to_string(), KmerCount::occurrence(1)),
        ];
        write_dataset(&path, records, 2)?;

        let store = DatasetStore::open(&path, 3)?;
        assert_eq!(store.get("AC")?, 2);
        assert_eq!(store.get("ACG")?, 1);
        assert_eq!(store.size(2)?, 1);
        assert!(store.parents("AC").unwrap().contains("ACG"));

        Ok(())
    }
}
