//! Main entry point for the ccv application.
//!
//! This file handles command-line parsing, logging setup and input reading, and
//! dispatches to the single-node computation, the distributed batch pipeline,
//! or the distance calculation over an existing vector file. Results are
//! written to files in the specified output directory.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;
use num_format::{Locale, ToFormattedString};

use crate::cli::{Backend, Cli, Command, DistanceArgs, InputArgs, OutputArgs, PipelineArgs, VectorsArgs};
use crate::distance::{DistanceMatrix, Metric, distance_matrix};
use crate::distribution::sqlite::SqliteVectorSet;
use crate::entropy::Selection;
use crate::io_utils::seq_files_in_dir;
use crate::logging::setup_logger;
use crate::matrix::FeatureMatrix;
use crate::params::CcvParams;
use crate::pipeline::{
    DISTANCE_TSV_FILE, ENTROPY_FILE, FEATURES_FILE, Orchestrator, PHYLIP_FILE, PipelineConfig,
    VECTORS_FILE,
};
use crate::sequence::{Sequence, read_all_sequences};
use crate::vector_set::{VectorSet, VectorSetBackend};

mod cli;
pub mod distance;
pub mod distribution;
pub mod entropy;
pub mod error;
pub mod feature;
pub mod io_utils;
pub mod logging;
pub mod matrix;
pub mod params;
pub mod pi_value;
pub mod pipeline;
pub mod progress;
pub mod sequence;
pub mod vector;
pub mod vector_set;

/// Common initialization required by all commands.
fn init(threads: usize) -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    info!("{} v{}", env!("CARGO_PKG_NAME"), VERSION);
    info!("{}", env::args().collect::<Vec<String>>().join(" "));

    info!("Using {} threads.", threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;

    Ok(())
}

/// Read the sequences of the input directory or files, in a reproducible order.
fn read_inputs(inputs: &InputArgs) -> Result<Vec<Sequence>> {
    let seq_files = match &inputs.input_dir {
        Some(input_dir) => {
            info!("Using input directory: {}", input_dir.display());
            seq_files_in_dir(input_dir)
                .with_context(|| format!("Failed to read directory {}", input_dir.display()))?
        }
        None => inputs.seq_files.clone(),
    };

    if seq_files.is_empty() {
        bail!("No FASTA files found in the specified input.");
    }

    let seqs = read_all_sequences(&seq_files)?;
    info!(
        "Read {} sequences from {} files.",
        seqs.len().to_formatted_string(&Locale::en),
        seq_files.len()
    );

    Ok(seqs)
}

fn window_params(start: usize, end: usize) -> Result<CcvParams> {
    CcvParams::new(start, end).context("Invalid window sizes")
}

fn write_distances(distances: &DistanceMatrix, output: &OutputArgs) -> Result<()> {
    let phylip = output.out_dir.join(PHYLIP_FILE);
    distances
        .write_phylip(&phylip, output.digits)
        .with_context(|| format!("Failed to write {}", phylip.display()))?;
    distances.write_tsv(&output.out_dir.join(DISTANCE_TSV_FILE))?;
    info!("Wrote {} x {} distance matrix to {}.", distances.len(), distances.len(), phylip.display());

    Ok(())
}

/// Single-node run over a vector set on any backend.
fn build_vectors<B: VectorSetBackend>(mut set: VectorSet<B>, seqs: &[Sequence], args: &VectorsArgs) -> Result<()> {
    let out_dir = &args.output.out_dir;

    let added = set.add_sequences(seqs)?;
    info!(
        "Added {} of {} sequences; the vector set holds {} samples.",
        added.to_formatted_string(&Locale::en),
        seqs.len().to_formatted_string(&Locale::en),
        set.len().to_formatted_string(&Locale::en)
    );
    if set.is_empty() {
        bail!("No sequence is at least {} residues long.", set.params().end());
    }

    let selection = Selection::from_top_nmers(args.window.top_nmers);
    let features = set.select_features(selection, Some(out_dir.join(ENTROPY_FILE).as_path()))?;
    features.write_json(&out_dir.join(FEATURES_FILE))?;

    let matrix = set.feature_matrix(&features)?;
    matrix.write_json(&out_dir.join(VECTORS_FILE))?;

    let distances = match args.output.metric {
        Metric::Jaccard => set.jaccard_matrix(Some(&features.to_set()))?,
        metric => distance_matrix(&matrix, metric)?,
    };
    write_distances(&distances, &args.output)
}

fn run_vectors(args: &VectorsArgs) -> Result<()> {
    let params = window_params(args.window.start, args.window.end)?;
    let seqs = read_inputs(&args.inputs)?;

    match &args.backend {
        Backend::Memory => {
            if args.vector_set_id.is_some() {
                bail!("--vector-set-id requires an sqlite:<path> backend.");
            }
            build_vectors(VectorSet::new(params), &seqs, args)
        }
        Backend::Sqlite(db_path) => {
            info!("Using SQLite database: {}", db_path.display());
            let backend = SqliteVectorSet::open(db_path, params, args.vector_set_id, &args.vector_set_name)
                .with_context(|| format!("Failed to open {}", db_path.display()))?;
            let set = VectorSet::with_backend(params, backend)?;
            info!("Vector set {} holds {} stored samples.", set.backend().vs_id(), set.len());
            build_vectors(set, &seqs, args)
        }
    }
}

fn run_pipeline(args: &PipelineArgs) -> Result<()> {
    let params = window_params(args.window.start, args.window.end)?;
    let seqs = read_inputs(&args.inputs)?;

    let out_dir = &args.output.out_dir;
    let work_dir = args.work_dir.clone().unwrap_or_else(|| out_dir.join("work"));
    info!("Using work directory: {}", work_dir.display());

    let mut config = PipelineConfig::new(params, &work_dir, out_dir);
    config.workers = args.workers;
    config.reducers = args.reducers;
    config.selection = Selection::from_top_nmers(args.window.top_nmers);
    config.metric = (!args.skip_distance).then_some(args.output.metric);
    config.resume = args.resume;
    config.seen_limit = args.seen_limit;
    config.features_file = args.features.clone();
    config.digits = args.output.digits;

    let output = Orchestrator::new(config)?.run(&seqs)?;
    info!(
        "Completed {} stages ({} skipped); {} features over {} samples.",
        output.executed.len(),
        output.skipped.len(),
        output.features.len().to_formatted_string(&Locale::en),
        output.matrix.num_samples().to_formatted_string(&Locale::en)
    );

    Ok(())
}

/// Sample names listed one per line.
fn read_order(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn run_distance(args: &DistanceArgs) -> Result<()> {
    let matrix = FeatureMatrix::read_json(&args.vectors)
        .with_context(|| format!("Failed to read vector file {}", args.vectors.display()))?;
    info!(
        "Read {} features over {} samples.",
        matrix.num_features().to_formatted_string(&Locale::en),
        matrix.num_samples().to_formatted_string(&Locale::en)
    );

    let mut distances = distance_matrix(&matrix, args.output.metric)?;
    if let Some(order) = &args.order {
        distances = distances.reorder(&read_order(order)?)?;
    }
    write_distances(&distances, &args.output)
}

fn main() -> Result<()> {
    let start = Instant::now();

    let args = Cli::parse();

    setup_logger(args.command.out_dir(), args.verbose)?;

    init(args.threads)?;

    match &args.command {
        Command::Vectors(vectors_args) => run_vectors(vectors_args)?,
        Command::Pipeline(pipeline_args) => run_pipeline(pipeline_args)?,
        Command::Distance(distance_args) => run_distance(distance_args)?,
    }

    info!("Elapsed time (sec): {:.2}", start.elapsed().as_secs_f32());
    info!("Done.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_order() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        write(temp_file.path(), "# sample order\nseqB\n\n  seqA \n")?;

        let order = read_order(temp_file.path())?;
        assert_eq!(order, vec!["seqB", "seqA"]);

        Ok(())
    }
}
