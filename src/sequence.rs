//! Sequences (samples) and FASTA ingestion.
//!
//! Every FASTA record becomes one sample. The record identifier up to the first
//! whitespace is used as the sample name. Residues are kept exactly as read,
//! but must be ASCII since k-mers are sliced by byte offset.

use std::fs::File;
use std::path::Path;

use anyhow::Context;
use log::debug;
use needletail::parse_fastx_reader;
use serde::{Deserialize, Serialize};

use crate::error::{CcvError, Result};

/// An immutable named sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    name: String,
    residues: String,
}

impl Sequence {
    pub fn new(name: impl Into<String>, residues: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let residues = residues.into();
        if !residues.is_ascii() {
            return Err(CcvError::InvalidSequence { name });
        }

        Ok(Sequence { name, residues })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn residues(&self) -> &str {
        &self.residues
    }

    pub fn len(&self) -> usize {
        self.residues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residues.is_empty()
    }
}

/// Read every record of a FASTA/FASTQ file.
pub fn read_sequences(seq_file: &Path) -> anyhow::Result<Vec<Sequence>> {
    let reader = File::open(seq_file)
        .context(format!("Failed to open {}", seq_file.display()))?;

    let mut fastx_reader = parse_fastx_reader(reader)
        .context(format!("Failed to parse {}", seq_file.display()))?;

    let mut sequences = Vec::new();
    while let Some(rec) = fastx_reader.next() {
        let record = rec?;
        let header = String::from_utf8_lossy(record.id()).to_string();
        let name = header
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        let residues = String::from_utf8_lossy(&record.seq()).to_string();
        sequences.push(Sequence::new(name, residues)?);
    }

    debug!("Read {} sequences from {}", sequences.len(), seq_file.display());
    Ok(sequences)
}

/// Read the records of several files, preserving file and record order.
pub fn read_all_sequences(seq_files: &[impl AsRef<Path>]) -> anyhow::Result<Vec<Sequence>> {
    let mut sequences = Vec::new();
    for seq_file in seq_files {
        sequences.extend(read_sequences(seq_file.as_ref())?);
    }

    Ok(sequences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_sequences() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(file, ">seqA first sample\nACGT\nACGT\n>seqB\nACGTTTTT\n")?;
        file.flush()?;

        let sequences = read_sequences(file.path())?;
        assert_eq!(sequences.len(), 2);
        assert_eq!(sequences[0].name(), "seqA");
        assert_eq!(sequences[0].residues(), "ACGTACGT");
        assert_eq!(sequences[1].name(), "seqB");
        assert_eq!(sequences[1].len(), 8);

        Ok(())
    }

    #[test]
    fn test_non_ascii_rejected() {
        assert!(matches!(
            Sequence::new("bad", "ACGÜ"),
            Err(CcvError::InvalidSequence { .. })
        ));
    }
}
