//! Composition vectors for a single window size and complete composition
//! vectors across a window range.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::distribution::{CompositionDistribution, KmerStore};
use crate::error::Result;
use crate::params::CcvParams;
use crate::pi_value::composition_vector;

/// Pi-values of the k-mers of one window size.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionVector {
    window: usize,
    values: FxHashMap<String, f64>,
}

impl CompositionVector {
    pub fn new(window: usize) -> Self {
        CompositionVector {
            window,
            values: FxHashMap::default(),
        }
    }

    pub fn insert(&mut self, kmer: String, pi: f64) {
        debug_assert_eq!(kmer.len(), self.window);
        self.values.insert(kmer, pi);
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Pi-value of a k-mer, 0 if absent.
    pub fn get(&self, kmer: &str) -> f64 {
        self.values.get(kmer).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.values.iter()
    }
}

/// The composition vectors of one sample over `[start, end]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompleteCompositionVector {
    sample_id: usize,
    name: String,
    params: CcvParams,
    vectors: Vec<CompositionVector>,
}

impl CompleteCompositionVector {
    pub fn new(sample_id: usize, name: impl Into<String>, params: CcvParams) -> Self {
        CompleteCompositionVector {
            sample_id,
            name: name.into(),
            params,
            vectors: params.windows().map(CompositionVector::new).collect(),
        }
    }

    pub fn from_distribution<S: KmerStore>(
        sample_id: usize,
        name: impl Into<String>,
        dist: &CompositionDistribution<S>,
    ) -> Result<Self> {
        let params = *dist.params();
        let vectors = params
            .windows()
            .map(|window| composition_vector(dist, window))
            .collect::<Result<Vec<_>>>()?;

        Ok(CompleteCompositionVector {
            sample_id,
            name: name.into(),
            params,
            vectors,
        })
    }

    /// Set a pi-value. K-mers outside the window range are ignored.
    pub fn insert(&mut self, kmer: String, pi: f64) {
        if let Some(vector) = self.vector_mut(kmer.len()) {
            vector.insert(kmer, pi);
        }
    }

    pub fn sample_id(&self) -> usize {
        self.sample_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &CcvParams {
        &self.params
    }

    pub fn vectors(&self) -> &[CompositionVector] {
        &self.vectors
    }

    pub fn into_vectors(self) -> Vec<CompositionVector> {
        self.vectors
    }

    pub fn vector(&self, window: usize) -> Option<&CompositionVector> {
        window
            .checked_sub(self.params.start())
            .and_then(|idx| self.vectors.get(idx))
    }

    fn vector_mut(&mut self, window: usize) -> Option<&mut CompositionVector> {
        window
            .checked_sub(self.params.start())
            .and_then(|idx| self.vectors.get_mut(idx))
    }

    /// Pi-value of a k-mer of any window size in range, 0 if absent.
    pub fn pi(&self, kmer: &str) -> f64 {
        self.vector(kmer.len()).map_or(0.0, |vector| vector.get(kmer))
    }

    /// All `(kmer, pi)` pairs across the window range.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.vectors.iter().flat_map(|vector| vector.iter())
    }

    /// K-mers with a non-zero pi-value.
    pub fn nonzero_kmers(&self) -> FxHashSet<&str> {
        self.entries()
            .filter(|(_, pi)| **pi != 0.0)
            .map(|(kmer, _)| kmer.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vectors.iter().map(CompositionVector::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
