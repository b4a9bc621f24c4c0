//! Count stage: corpus k-mer counts with parent witnesses, and the total
//! sequence length.

use std::path::Path;

use crate::distribution::{CompositionDistribution, DatasetStore, KmerCount};
use crate::error::{CcvError, Result};
use crate::params::CcvParams;
use crate::pipeline::compvec::SampleInput;
use crate::pipeline::dataset::Dataset;
use crate::pipeline::mapreduce::{Combiner, Mapper, Output, Reducer, Shuffle};
use crate::sequence::Sequence;

pub const TOTAL_LENGTH_KEY: &str = "total_length";

/// Counts every sample of a partition into one dataset-backed distribution and
/// emits the combined records once the partition is done.
struct CountMapper {
    dist: CompositionDistribution<DatasetStore>,
}

impl CountMapper {
    fn new(params: CcvParams, seen_limit: usize) -> Self {
        CountMapper {
            dist: CompositionDistribution::with_store(
                params,
                DatasetStore::new(params.start(), seen_limit),
            ),
        }
    }
}

impl Mapper<String, SampleInput> for CountMapper {
    type OutKey = String;
    type OutValue = KmerCount;

    fn map(&mut self, name: String, input: SampleInput, _: &mut Output<String, KmerCount>) -> Result<()> {
        let seq = Sequence::new(name, input.residues)?;
        self.dist.add_sequence(&seq)
    }

    fn finish(&mut self, out: &mut Output<String, KmerCount>) -> Result<()> {
        for (kmer, count) in self.dist.store().records() {
            out.collect(kmer.clone(), count.clone());
        }

        Ok(())
    }
}

struct MergeCounts;

impl Reducer<String, KmerCount> for MergeCounts {
    type OutKey = String;
    type OutValue = KmerCount;

    fn reduce(
        &self,
        kmer: String,
        values: Vec<KmerCount>,
        out: &mut Vec<(String, KmerCount)>,
    ) -> Result<()> {
        let mut total = KmerCount::default();
        for count in values {
            total.merge(count);
        }
        out.push((kmer, total));

        Ok(())
    }
}

struct LengthMapper;

impl Mapper<String, SampleInput> for LengthMapper {
    type OutKey = String;
    type OutValue = u64;

    fn map(&mut self, _: String, input: SampleInput, out: &mut Output<String, u64>) -> Result<()> {
        out.collect(TOTAL_LENGTH_KEY.to_string(), input.residues.len() as u64);
        Ok(())
    }
}

struct SumLengths;

impl Combiner<String, u64> for SumLengths {
    fn combine(&self, _: &String, values: Vec<u64>) -> Result<u64> {
        Ok(values.iter().sum())
    }
}

impl Reducer<String, u64> for SumLengths {
    type OutKey = String;
    type OutValue = u64;

    fn reduce(&self, key: String, values: Vec<u64>, out: &mut Vec<(String, u64)>) -> Result<()> {
        out.push((key, values.iter().sum()));
        Ok(())
    }
}

/// Count the k-mers of every window size in `[start - 2, end]` over the corpus.
pub fn count_kmers(
    input: &Dataset<String, SampleInput>,
    params: CcvParams,
    seen_limit: usize,
    work_dir: &Path,
    reducers: usize,
    output: &Path,
) -> Result<Dataset<String, KmerCount>> {
    let mut shuffle = Shuffle::new("count", work_dir, reducers)?;
    shuffle.map(input, || CountMapper::new(params, seen_limit), None)?;
    shuffle.reduce(&MergeCounts, output)
}

/// Sum of the lengths of all samples, as a single-record dataset.
pub fn total_length(
    input: &Dataset<String, SampleInput>,
    work_dir: &Path,
    output: &Path,
) -> Result<Dataset<String, u64>> {
    let mut shuffle = Shuffle::new("length", work_dir, 1)?;
    shuffle.map(input, || LengthMapper, Some(&SumLengths as &dyn Combiner<String, u64>))?;
    shuffle.reduce(&SumLengths, output)
}

pub fn read_total_length(length: &Dataset<String, u64>) -> Result<u64> {
    length
        .read_all()?
        .into_iter()
        .find(|(key, _)| key == TOTAL_LENGTH_KEY)
        .map(|(_, total)| total)
        .ok_or_else(|| {
            CcvError::format(
                "length dataset",
                format!("no '{TOTAL_LENGTH_KEY}' record in {}", length.path().display()),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::KmerStore;
    use crate::pipeline::compvec::write_input;
    use tempfile::tempdir;

    #[test]
    fn test_counts_match_corpus() -> Result<()> {
        let dir = tempdir()?;
        let params = CcvParams::new(3, 4)?;
        let seqs = vec![
            Sequence::new("A", "ACGTACGT")?,
            Sequence::new("B", "ACGTTTTT")?,
            Sequence::new("C", "GGTACCAT")?,
        ];
        let input = write_input(&dir.path().join("input"), &seqs, &params, 2)?;

        let counts = count_kmers(&input, params, 10, dir.path(), 3, &dir.path().join("count"))?;
        let length = total_length(&input, dir.path(), &dir.path().join("length"))?;
        assert_eq!(read_total_length(&length)?, 24);

        let store = DatasetStore::open(counts.path(), params.start())?;
        let mut corpus = CompositionDistribution::new(params);
        for seq in &seqs {
            corpus.merge(&CompositionDistribution::from_sequence(params, seq)?)?;
        }
        for window in params.count_windows() {
            assert_eq!(store.size(window)?, corpus.size(window)?);
            for entry in corpus.kmers(window)? {
                let (kmer, count) = entry?;
                assert_eq!(store.get(&kmer)?, count);
            }
        }

        // every k-mer of length >= start is a parent of its three sub-k-mers
        let parents = store.parents("GT").unwrap();
        assert!(parents.contains("CGT"));
        assert!(parents.contains("GTA"));
        assert!(parents.contains("CGTA"));

        Ok(())
    }
}
