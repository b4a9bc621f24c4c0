use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::error::Result;

const SEQ_EXTENSIONS: [&str; 6] = ["fa", "fasta", "fna", "fq", "fastq", "gz"];

/// Returns true if the path has a common sequence file extension.
pub fn is_seq_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SEQ_EXTENSIONS.contains(&ext))
}

/// Sequence files in a directory, sorted by name so sample order is reproducible.
pub fn seq_files_in_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| is_seq_file(path))
        .collect();
    paths.sort();

    Ok(paths)
}

/// Buffered writer for a new file, creating parent directories as needed.
pub fn create_writer(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    Ok(BufWriter::new(File::create(path)?))
}
