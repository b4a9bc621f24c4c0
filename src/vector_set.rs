//! A corpus of complete composition vectors.
//!
//! Each added sequence gets its own distribution, which is turned into a
//! complete composition vector and then merged into the corpus aggregate. The
//! aggregate supplies the global pi-values used for entropy scoring.
//! Per-sample counts live in the storage backend chosen for the set.

use std::path::Path;

use log::{debug, info, warn};
use rustc_hash::FxHashSet;

use crate::distance::{DistanceMatrix, jaccard_distance_matrix};
use crate::distribution::{CompositionDistribution, KmerStore, MemoryStore};
use crate::entropy::{EntropyScore, Selection, score_kmers, select_features, write_entropy_file};
use crate::error::{CcvError, Result};
use crate::feature::FeatureSet;
use crate::matrix::FeatureMatrix;
use crate::params::CcvParams;
use crate::progress::progress_bar;
use crate::sequence::Sequence;
use crate::vector::CompleteCompositionVector;

/// Sample previously written to a backend.
pub struct StoredSample<S> {
    pub name: String,
    pub length: u64,
    pub store: S,
    /// Persisted pi-values; empty if only counts were stored.
    pub pi_values: Vec<(String, f64)>,
}

/// Storage for the per-sample distributions of a vector set.
pub trait VectorSetBackend {
    type Store: KmerStore;

    /// Empty store for the distribution of a new sample.
    fn create_store(&mut self, name: &str) -> Result<Self::Store>;

    /// Record the length and composition vector of a completed sample.
    fn save_sample(
        &mut self,
        store: &Self::Store,
        length: u64,
        vector: &CompleteCompositionVector,
    ) -> Result<()>;

    /// Samples already present when the set is opened.
    fn load_samples(&mut self) -> Result<Vec<StoredSample<Self::Store>>>;
}

/// Backend keeping per-sample counts only for the lifetime of `add_sequence`.
#[derive(Default)]
pub struct MemoryBackend;

impl VectorSetBackend for MemoryBackend {
    type Store = MemoryStore;

    fn create_store(&mut self, _name: &str) -> Result<MemoryStore> {
        Ok(MemoryStore::new())
    }

    fn save_sample(&mut self, _: &MemoryStore, _: u64, _: &CompleteCompositionVector) -> Result<()> {
        Ok(())
    }

    fn load_samples(&mut self) -> Result<Vec<StoredSample<MemoryStore>>> {
        Ok(Vec::new())
    }
}

pub struct VectorSet<B: VectorSetBackend = MemoryBackend> {
    params: CcvParams,
    backend: B,
    corpus: CompositionDistribution<MemoryStore>,
    vectors: Vec<CompleteCompositionVector>,
}

impl VectorSet<MemoryBackend> {
    pub fn new(params: CcvParams) -> Self {
        VectorSet {
            params,
            backend: MemoryBackend,
            corpus: CompositionDistribution::new(params),
            vectors: Vec::new(),
        }
    }
}

impl<B: VectorSetBackend> VectorSet<B> {
    /// Open a vector set on a backend, loading any samples it already holds.
    pub fn with_backend(params: CcvParams, mut backend: B) -> Result<Self> {
        let mut corpus = CompositionDistribution::new(params);
        let mut vectors = Vec::new();

        for stored in backend.load_samples()? {
            let dist = CompositionDistribution::from_parts(params, stored.length, stored.store);
            corpus.merge(&dist)?;

            let sample_id = vectors.len();
            let vector = if stored.pi_values.is_empty() {
                CompleteCompositionVector::from_distribution(sample_id, &stored.name, &dist)?
            } else {
                let mut vector = CompleteCompositionVector::new(sample_id, &stored.name, params);
                for (kmer, pi) in stored.pi_values {
                    vector.insert(kmer, pi);
                }
                vector
            };
            vectors.push(vector);
        }

        if !vectors.is_empty() {
            info!("Loaded {} stored samples.", vectors.len());
        }

        Ok(VectorSet {
            params,
            backend,
            corpus,
            vectors,
        })
    }

    /// Add a sequence as a new sample.
    ///
    /// Returns the sample id, or `None` if the sequence is shorter than the
    /// end window size and was skipped.
    pub fn add_sequence(&mut self, seq: &Sequence) -> Result<Option<usize>> {
        if seq.len() < self.params.end() {
            warn!(
                "{} has length {}, which is smaller than the end window size ({}); skipping.",
                seq.name(),
                seq.len(),
                self.params.end()
            );
            return Ok(None);
        }

        let store = self.backend.create_store(seq.name())?;
        let mut dist = CompositionDistribution::with_store(self.params, store);
        dist.add_sequence(seq)?;

        let sample_id = self.vectors.len();
        let vector = CompleteCompositionVector::from_distribution(sample_id, seq.name(), &dist)?;
        self.backend.save_sample(dist.store(), dist.length(), &vector)?;
        self.corpus.merge(&dist)?;

        debug!("{}: {} pi-values", seq.name(), vector.len());
        self.vectors.push(vector);

        Ok(Some(sample_id))
    }

    /// Add sequences in order, returning the number of samples added.
    pub fn add_sequences(&mut self, seqs: &[Sequence]) -> Result<usize> {
        let progress_bar = progress_bar(seqs.len() as u64);
        let mut added = 0;
        for seq in seqs {
            if self.add_sequence(seq)?.is_some() {
                added += 1;
            }
            progress_bar.inc(1);
        }
        progress_bar.finish();

        Ok(added)
    }

    pub fn params(&self) -> &CcvParams {
        &self.params
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn vectors(&self) -> &[CompleteCompositionVector] {
        &self.vectors
    }

    /// Sample names in ingestion order.
    pub fn names(&self) -> Vec<String> {
        self.vectors.iter().map(|v| v.name().to_string()).collect()
    }

    /// Corpus aggregate distribution.
    pub fn corpus(&self) -> &CompositionDistribution<MemoryStore> {
        &self.corpus
    }

    /// Every k-mer in `[start, end]` observed in the corpus, sorted.
    pub fn nmers(&self) -> Result<Vec<String>> {
        let mut nmers = Vec::new();
        for window in self.params.windows() {
            for entry in self.corpus.kmers(window)? {
                nmers.push(entry?.0);
            }
        }
        nmers.sort_unstable();

        Ok(nmers)
    }

    /// Composition vector of the corpus aggregate.
    pub fn global_vector(&self) -> Result<CompleteCompositionVector> {
        CompleteCompositionVector::from_distribution(usize::MAX, "corpus", &self.corpus)
    }

    /// Revised relative entropy of every corpus k-mer, in selection order.
    pub fn entropy_scores(&self) -> Result<Vec<EntropyScore>> {
        let nmers = self.nmers()?;
        let global = self.global_vector()?;
        info!(
            "Calculating revised relative entropies ({} k-mers by {} samples).",
            nmers.len(),
            self.len()
        );

        Ok(score_kmers(&nmers, &global, &self.vectors))
    }

    /// Select features by entropy, optionally writing all scores to a TSV file.
    pub fn select_features(
        &self,
        selection: Selection,
        entropy_file: Option<&Path>,
    ) -> Result<FeatureSet> {
        let scores = self.entropy_scores()?;
        if let Some(path) = entropy_file {
            write_entropy_file(path, &scores)?;
        }

        Ok(select_features(&scores, selection, self.params))
    }

    /// Sparse matrix of the selected features over all samples.
    pub fn feature_matrix(&self, features: &FeatureSet) -> Result<FeatureMatrix> {
        if features.params() != &self.params {
            return Err(CcvError::format(
                "feature set",
                format!(
                    "window range [{}, {}] differs from the vector set",
                    features.params().start(),
                    features.params().end()
                ),
            ));
        }

        Ok(FeatureMatrix::assemble(features, &self.vectors))
    }

    /// Jaccard distances over the non-zero k-mers of each sample.
    pub fn jaccard_matrix(&self, subset: Option<&FxHashSet<String>>) -> Result<DistanceMatrix> {
        jaccard_distance_matrix(&self.vectors, subset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{Metric, distance_matrix};
    use crate::distribution::sqlite::SqliteVectorSet;
    use crate::entropy::DEFAULT_LOOK_AHEAD;
    use clap::ValueEnum;
    use tempfile::tempdir;

    fn corpus() -> Vec<Sequence> {
        vec![
            Sequence::new("A", "ACGTACGT").unwrap(),
            Sequence::new("B", "ACGTTTTT").unwrap(),
            Sequence::new("C", "ACG").unwrap(),
            Sequence::new("D", "TTGACCAGTA").unwrap(),
        ]
    }

    #[test]
    fn test_short_sequences_skipped() -> Result<()> {
        let mut set = VectorSet::new(CcvParams::new(3, 4)?);
        assert_eq!(set.add_sequences(&corpus())?, 3);
        assert_eq!(set.names(), vec!["A", "B", "D"]);
        assert_eq!(set.corpus().length(), 26);
        assert_eq!(set.vectors()[2].sample_id(), 2);

        Ok(())
    }

    #[test]
    fn test_nmers_cover_windows() -> Result<()> {
        let mut set = VectorSet::new(CcvParams::new(3, 4)?);
        set.add_sequences(&corpus())?;

        let nmers = set.nmers()?;
        assert!(nmers.iter().all(|kmer| (3..=4).contains(&kmer.len())));
        assert!(nmers.windows(2).all(|w| w[0] < w[1]));
        assert!(nmers.contains(&"TTTT".to_string()));

        let scores = set.entropy_scores()?;
        assert_eq!(scores.len(), nmers.len());

        Ok(())
    }

    #[test]
    fn test_select_features_writes_entropy() -> Result<()> {
        let dir = tempdir()?;
        let entropy_file = dir.path().join("entropy.tsv");

        let mut set = VectorSet::new(CcvParams::new(3, 4)?);
        set.add_sequences(&corpus())?;
        let features = set.select_features(
            Selection::ProfileLikelihood {
                look_ahead: DEFAULT_LOOK_AHEAD,
            },
            Some(&entropy_file),
        )?;
        assert!(!features.is_empty());

        let lines = std::fs::read_to_string(&entropy_file)?.lines().count();
        assert_eq!(lines, set.nmers()?.len());

        let matrix = set.feature_matrix(&features)?;
        assert_eq!(matrix.num_features(), features.len());
        assert_eq!(matrix.num_samples(), 3);

        Ok(())
    }

    #[test]
    fn test_sqlite_backend_matches_memory() -> Result<()> {
        let dir = tempdir()?;
        let params = CcvParams::new(3, 4)?;

        let mut memory = VectorSet::new(params);
        memory.add_sequences(&corpus())?;

        let backend = SqliteVectorSet::open(&dir.path().join("ccv.db"), params, None, "test")?;
        let vs_id = backend.vs_id();
        let mut sqlite = VectorSet::with_backend(params, backend)?;
        sqlite.add_sequences(&corpus()[..2])?;
        drop(sqlite);

        // extend the stored set with the remaining samples
        let backend = SqliteVectorSet::open(&dir.path().join("ccv.db"), params, Some(vs_id), "test")?;
        let mut sqlite = VectorSet::with_backend(params, backend)?;
        assert_eq!(sqlite.len(), 2);
        sqlite.add_sequences(&corpus()[2..])?;

        assert_eq!(sqlite.names(), memory.names());
        assert_eq!(sqlite.nmers()?, memory.nmers()?);
        for (a, b) in sqlite.vectors().iter().zip(memory.vectors()) {
            for (kmer, pi) in b.entries() {
                assert!((a.pi(kmer) - pi).abs() < 1e-12);
            }
        }

        Ok(())
    }

    #[test]
    fn test_two_sample_distances() -> Result<()> {
        let mut set = VectorSet::new(CcvParams::new(3, 4)?);
        set.add_sequences(&corpus()[..2])?;
        let features = set.select_features(Selection::All, None)?;
        assert_eq!(features.len(), set.nmers()?.len());

        let matrix = set.feature_matrix(&features)?;
        for metric in Metric::value_variants() {
            let dist = distance_matrix(&matrix, *metric)?;
            assert_eq!(dist.len(), 2);
            assert_eq!(dist.get(0, 0), 0.0);
            assert_eq!(dist.get(0, 1), dist.get(1, 0));
            assert!(dist.get(0, 1) > 0.0, "{metric:?}");
        }

        let cosine = distance_matrix(&matrix, Metric::Cosine)?;
        assert!(cosine.get(0, 1) <= 1.0);

        Ok(())
    }

    #[test]
    fn test_identical_samples_have_zero_cosine() -> Result<()> {
        let mut set = VectorSet::new(CcvParams::new(3, 4)?);
        set.add_sequences(&[
            Sequence::new("A", "ACGTACGT")?,
            Sequence::new("A2", "ACGTACGT")?,
            Sequence::new("B", "ACGTTTTT")?,
        ])?;
        let features = set.select_features(Selection::All, None)?;
        let dist = distance_matrix(&set.feature_matrix(&features)?, Metric::Cosine)?;

        assert!(dist.get(0, 1).abs() < 1e-12);
        assert!(dist.get(0, 2) > 0.0);

        Ok(())
    }
}
