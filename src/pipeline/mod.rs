//! Distributed batch pipeline.
//!
//! The single-node computation is re-expressed as a sequence of map-reduce
//! stages connected by datasets in a work directory:
//!
//! ```text
//! CompositionVectors -> Count -> Probability -> Invert -> PiValue
//!     -> Entropy -> Sort -> Selection -> FeatureVectors -> [DistanceMatrix]
//! ```
//!
//! A stage only starts once the datasets it reads are committed. A failed stage
//! leaves no output behind, and with `resume` set every stage whose output is
//! already complete is skipped. When a feature file is supplied, the stages that
//! only serve feature selection are not run.

pub mod cache;
pub mod compvec;
pub mod count;
pub mod dataset;
pub mod distance;
pub mod entropy;
pub mod features;
pub mod mapreduce;
pub mod pi;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::info;
use num_format::{Locale, ToFormattedString};

use crate::distance::{DEFAULT_DIGITS, DistanceMatrix, Metric};
use crate::entropy::Selection;
use crate::error::{CcvError, Result};
use crate::feature::FeatureSet;
use crate::matrix::FeatureMatrix;
use crate::params::CcvParams;
use crate::pipeline::dataset::Dataset;
use crate::sequence::Sequence;

pub const FEATURES_FILE: &str = "features.json";
pub const VECTORS_FILE: &str = "vectors.json";
pub const ENTROPY_FILE: &str = "entropy.tsv";
pub const PHYLIP_FILE: &str = "distances.phylip";
pub const DISTANCE_TSV_FILE: &str = "distances.tsv";

const CACHE_DIR: &str = "cache";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    CompositionVectors,
    Count,
    Probability,
    Invert,
    PiValue,
    Entropy,
    Sort,
    Selection,
    FeatureVectors,
    DistanceMatrix,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::CompositionVectors,
        Stage::Count,
        Stage::Probability,
        Stage::Invert,
        Stage::PiValue,
        Stage::Entropy,
        Stage::Sort,
        Stage::Selection,
        Stage::FeatureVectors,
        Stage::DistanceMatrix,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::CompositionVectors => "CompositionVectors",
            Stage::Count => "Count",
            Stage::Probability => "Probability",
            Stage::Invert => "Invert",
            Stage::PiValue => "PiValue",
            Stage::Entropy => "Entropy",
            Stage::Sort => "Sort",
            Stage::Selection => "Selection",
            Stage::FeatureVectors => "FeatureVectors",
            Stage::DistanceMatrix => "DistanceMatrix",
        }
    }

    /// Datasets written by the stage, relative to the work directory.
    fn outputs(&self) -> &'static [&'static str] {
        match self {
            Stage::CompositionVectors => &["input", "compvec"],
            Stage::Count => &["count", "length"],
            Stage::Probability => &["probability"],
            Stage::Invert => &["invert"],
            Stage::PiValue => &["pi"],
            Stage::Entropy => &["entropy"],
            Stage::Sort => &["sorted"],
            Stage::Selection => &[],
            Stage::FeatureVectors => &["vectors"],
            Stage::DistanceMatrix => &["scales", "distance"],
        }
    }

    /// True for stages whose only purpose is feature selection.
    fn selects_features(&self) -> bool {
        matches!(
            self,
            Stage::Count
                | Stage::Probability
                | Stage::Invert
                | Stage::PiValue
                | Stage::Entropy
                | Stage::Sort
                | Stage::Selection
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub params: CcvParams,
    /// Intermediate datasets.
    pub work_dir: PathBuf,
    /// Feature, vector, entropy and distance files.
    pub out_dir: PathBuf,
    /// Partitions of the input dataset, i.e. map tasks per stage.
    pub workers: usize,
    pub reducers: usize,
    pub selection: Selection,
    /// Metric of the DistanceMatrix stage; `None` stops after FeatureVectors.
    pub metric: Option<Metric>,
    pub resume: bool,
    pub seen_limit: usize,
    /// Precomputed feature file replacing feature selection.
    pub features_file: Option<PathBuf>,
    pub digits: usize,
}

impl PipelineConfig {
    pub fn new(params: CcvParams, work_dir: &Path, out_dir: &Path) -> Self {
        PipelineConfig {
            params,
            work_dir: work_dir.to_path_buf(),
            out_dir: out_dir.to_path_buf(),
            workers: 4,
            reducers: 4,
            selection: Selection::All,
            metric: Some(Metric::Cosine),
            resume: false,
            seen_limit: crate::distribution::dataset::DEFAULT_SEEN_LIMIT,
            features_file: None,
            digits: DEFAULT_DIGITS,
        }
    }
}

pub struct PipelineOutput {
    pub features: FeatureSet,
    pub matrix: FeatureMatrix,
    pub distances: Option<DistanceMatrix>,
    pub executed: Vec<Stage>,
    pub skipped: Vec<Stage>,
}

pub struct Orchestrator {
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        if config.workers == 0 || config.reducers == 0 {
            return Err(CcvError::InvalidConfig(format!(
                "workers ({}) and reducers ({}) must be at least 1",
                config.workers, config.reducers
            )));
        }
        fs::create_dir_all(&config.work_dir)?;
        fs::create_dir_all(&config.out_dir)?;

        Ok(Orchestrator { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn dataset_path(&self, name: &str) -> PathBuf {
        self.config.work_dir.join(name)
    }

    fn open<K, V>(&self, name: &str) -> Result<Dataset<K, V>> {
        Dataset::open(&self.dataset_path(name))
    }

    /// Stages run for the current configuration, in order.
    pub fn stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| !(self.config.features_file.is_some() && stage.selects_features()))
            .filter(|stage| *stage != Stage::DistanceMatrix || self.config.metric.is_some())
            .collect()
    }

    /// True if every output of the stage is committed.
    pub fn is_complete(&self, stage: Stage) -> bool {
        match stage {
            Stage::Selection => self.config.work_dir.join(FEATURES_FILE).is_file(),
            _ => stage
                .outputs()
                .iter()
                .all(|name| Dataset::<(), ()>::is_complete(&self.dataset_path(name))),
        }
    }

    /// Run the pipeline over the given samples.
    pub fn run(&self, seqs: &[Sequence]) -> Result<PipelineOutput> {
        let stages = self.stages();
        info!(
            "Running {} stages over {} sequences: {}",
            stages.len(),
            seqs.len().to_formatted_string(&Locale::en),
            stages.iter().join(" -> ")
        );

        let mut executed = Vec::new();
        let mut skipped = Vec::new();
        for stage in stages {
            if self.config.resume && self.is_complete(stage) {
                info!("Skipping {stage}: output is complete.");
                skipped.push(stage);
                continue;
            }

            info!("Running {stage}.");
            self.execute(stage, seqs).map_err(|e| e.in_stage(stage.name()))?;
            executed.push(stage);
        }

        self.finish(executed, skipped)
    }

    fn execute(&self, stage: Stage, seqs: &[Sequence]) -> Result<()> {
        let config = &self.config;
        let work_dir = config.work_dir.as_path();
        let params = config.params;

        match stage {
            Stage::CompositionVectors => {
                let input = compvec::write_input(&self.dataset_path("input"), seqs, &params, config.workers)?;
                compvec::composition_vectors(&input, params, &self.dataset_path("compvec"))?;
            }
            Stage::Count => {
                let input = self.open("input")?;
                count::count_kmers(
                    &input,
                    params,
                    config.seen_limit,
                    work_dir,
                    config.reducers,
                    &self.dataset_path("count"),
                )?;
                count::total_length(&input, work_dir, &self.dataset_path("length"))?;
            }
            Stage::Probability => {
                let total_length = count::read_total_length(&self.open("length")?)?;
                pi::probabilities(&self.open("count")?, total_length, &self.dataset_path("probability"))?;
            }
            Stage::Invert => {
                pi::invert(
                    &self.open("probability")?,
                    params.start(),
                    work_dir,
                    config.reducers,
                    &self.dataset_path("invert"),
                )?;
            }
            Stage::PiValue => {
                pi::pi_values(&self.open("invert")?, &self.dataset_path("pi"))?;
            }
            Stage::Entropy => {
                entropy::entropy(
                    &self.open("compvec")?,
                    &self.open("pi")?,
                    work_dir,
                    config.reducers,
                    &self.dataset_path("entropy"),
                )?;
            }
            Stage::Sort => {
                entropy::sort(&self.open("entropy")?, work_dir, &self.dataset_path("sorted"))?;
            }
            Stage::Selection => {
                let features = entropy::select(
                    &self.open("sorted")?,
                    config.selection,
                    params,
                    Some(config.out_dir.join(ENTROPY_FILE).as_path()),
                )?;

                let path = work_dir.join(FEATURES_FILE);
                let tmp_path = path.with_extension("tmp");
                features.write_json(&tmp_path)?;
                fs::rename(&tmp_path, &path)?;
            }
            Stage::FeatureVectors => {
                let features = self.features()?;
                let cache = work_dir.join(CACHE_DIR).join("features.bin");
                cache::publish(&cache, features.features())?;
                features::feature_vectors(
                    &self.open("compvec")?,
                    &cache,
                    work_dir,
                    config.reducers,
                    &self.dataset_path("vectors"),
                )?;
            }
            Stage::DistanceMatrix => {
                let metric = config.metric.unwrap_or(Metric::Cosine);
                let vectors = self.open("vectors")?;
                let samples = features::read_vectors(&vectors)?;
                let num_features = self.features()?.len();

                let scales = distance::row_scales(
                    &vectors,
                    samples.len(),
                    work_dir,
                    config.reducers,
                    &self.dataset_path("scales"),
                )?;
                let cache = work_dir.join(CACHE_DIR).join("distance.bin");
                distance::publish_cache(&samples, &scales, num_features, &cache)?;
                distance::distance_rows(
                    &vectors,
                    &cache,
                    metric,
                    work_dir,
                    config.reducers,
                    &self.dataset_path("distance"),
                )?;
            }
        }

        Ok(())
    }

    /// Selected features, or the supplied feature file.
    fn features(&self) -> Result<FeatureSet> {
        let path = match &self.config.features_file {
            Some(path) => path.clone(),
            None => self.config.work_dir.join(FEATURES_FILE),
        };

        let features = FeatureSet::read_json(&path)?;
        if features.params() != &self.config.params {
            return Err(CcvError::format(
                "feature file",
                format!(
                    "{} has window range [{}, {}] but the pipeline uses [{}, {}]",
                    path.display(),
                    features.params().start(),
                    features.params().end(),
                    self.config.params.start(),
                    self.config.params.end()
                ),
            ));
        }

        Ok(features)
    }

    /// Collect the final outputs and write them to the output directory.
    fn finish(&self, executed: Vec<Stage>, skipped: Vec<Stage>) -> Result<PipelineOutput> {
        let out_dir = &self.config.out_dir;

        let features = self.features()?;
        let matrix = features::feature_matrix(&self.open("vectors")?, features.clone())?;
        matrix.write_json(&out_dir.join(VECTORS_FILE))?;
        features.write_json(&out_dir.join(FEATURES_FILE))?;
        info!(
            "Feature matrix: {} features x {} samples ({} non-zero).",
            matrix.num_features().to_formatted_string(&Locale::en),
            matrix.num_samples().to_formatted_string(&Locale::en),
            matrix.nnz().to_formatted_string(&Locale::en)
        );

        let distances = match self.config.metric {
            Some(_) => {
                let distances = distance::assemble(&self.open("distance")?, matrix.names().to_vec())?;
                distances.write_phylip(&out_dir.join(PHYLIP_FILE), self.config.digits)?;
                distances.write_tsv(&out_dir.join(DISTANCE_TSV_FILE))?;
                Some(distances)
            }
            None => None,
        };

        Ok(PipelineOutput {
            features,
            matrix,
            distances,
            executed,
            skipped,
        })
    }
}
