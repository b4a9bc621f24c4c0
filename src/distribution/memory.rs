//! In-memory k-mer store.

use rustc_hash::FxHashMap;

use super::{KmerIter, KmerStore};
use crate::error::Result;

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    counts: FxHashMap<usize, FxHashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KmerStore for MemoryStore {
    fn put(&mut self, kmer: &str, count: u64) -> Result<()> {
        let window = self.counts.entry(kmer.len()).or_default();
        if let Some(c) = window.get_mut(kmer) {
            *c += count;
        } else {
            window.insert(kmer.to_string(), count);
        }

        Ok(())
    }

    fn get(&self, kmer: &str) -> Result<u64> {
        Ok(self
            .counts
            .get(&kmer.len())
            .and_then(|window| window.get(kmer))
            .copied()
            .unwrap_or(0))
    }

    fn kmers(&self, window: usize) -> Result<KmerIter<'_>> {
        match self.counts.get(&window) {
            Some(counts) => Ok(Box::new(
                counts
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(kmer, count)| Ok((kmer.clone(), *count))),
            )),
            None => Ok(Box::new(std::iter::empty())),
        }
    }

    fn size(&self, window: usize) -> Result<usize> {
        Ok(self
            .counts
            .get(&window)
            .map_or(0, |counts| counts.values().filter(|c| **c > 0).count()))
    }
}
