//! Error types shared by the composition vector engine and the batch pipeline.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CcvError>;

#[derive(Error, Debug)]
pub enum CcvError {
    /// Window bounds rejected at construction.
    #[error("Invalid window range [{start}, {end}]: start must be larger than 2 and end must not be smaller than start")]
    InvalidWindowRange { start: usize, end: usize },

    /// Sequence is shorter than the largest window size. Callers skip the sample.
    #[error("Sequence '{name}' has length {length}, which is smaller than the end window size ({end})")]
    SequenceTooShort { name: String, length: usize, end: usize },

    /// A pi-value denominator was zero.
    #[error("Pi-value for k-mer '{kmer}' is undefined (zero count in the expected probability)")]
    UndefinedStatistic { kmer: String },

    /// A k-mer needed to compute a statistic is absent from the counts.
    #[error("Missing k-mer '{kmer}' while processing '{context}'")]
    MissingKmer { kmer: String, context: String },

    #[error("Sequence '{name}' contains non-ASCII residues")]
    InvalidSequence { name: String },

    #[error("Sample name '{0}' occurs more than once")]
    DuplicateSample(String),

    #[error("Backing store failure ({context}): {source}")]
    BackingStore {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A writer panicked while holding the shared connection.
    #[error("Backing store failure ({context}): connection lock poisoned by a failed writer")]
    PoisonedStore { context: String },

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Unable to allocate a {features} x {samples} matrix; reduce the number of features (topNmers) or the window range"
    )]
    MemoryExhaustion { features: usize, samples: usize },

    /// Failure inside one distributed stage; upstream outputs remain valid.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<CcvError>,
    },

    #[error("Malformed {what}: {msg}")]
    Format { what: String, msg: String },

    #[error("Dataset {} is incomplete or missing", .0.display())]
    IncompleteDataset(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Encoding(#[from] bincode::Error),
}

impl CcvError {
    pub fn backing_store(context: impl Into<String>, source: rusqlite::Error) -> Self {
        CcvError::BackingStore {
            context: context.into(),
            source,
        }
    }

    pub fn format(what: impl Into<String>, msg: impl Into<String>) -> Self {
        CcvError::Format {
            what: what.into(),
            msg: msg.into(),
        }
    }

    /// Wrap an error as the failure of the named pipeline stage.
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        match self {
            CcvError::Stage { .. } => self,
            other => CcvError::Stage {
                stage: stage.into(),
                source: Box::new(other),
            },
        }
    }
}
