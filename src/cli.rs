//! Command-line interface for the ccv application.
//!
//! Three commands share the input, window and output options: `vectors` runs
//! the single-node computation, `pipeline` runs the distributed batch pipeline
//! in a work directory, and `distance` turns a vector file into a distance
//! matrix. The CLI output is styled using the `anstyle` crate.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::distance::{DEFAULT_DIGITS, Metric};
use crate::distribution::dataset::DEFAULT_SEEN_LIMIT;
use crate::params::{DEFAULT_END, DEFAULT_START};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(styles=get_styles())]
#[command(disable_help_subcommand = true)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Number of threads to use
    #[arg(short, long, global = true, default_value_t = 1, value_parser = validate_threads)]
    pub threads: usize,

    /// Log debug messages
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build complete composition vectors and distances on a single node
    Vectors(VectorsArgs),

    /// Run the distributed batch pipeline in a work directory
    Pipeline(PipelineArgs),

    /// Calculate a distance matrix from a vector file
    Distance(DistanceArgs),
}

impl Command {
    pub fn out_dir(&self) -> &PathBuf {
        match self {
            Command::Vectors(args) => &args.output.out_dir,
            Command::Pipeline(args) => &args.output.out_dir,
            Command::Distance(args) => &args.output.out_dir,
        }
    }
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct InputArgs {
    /// Directory of FASTA files to process
    #[arg(short = 'i', long, help_heading = "Inputs", value_parser = clap::value_parser!(PathBuf))]
    pub input_dir: Option<PathBuf>,

    /// FASTA files to process
    #[arg(short = 'f', long, help_heading = "Inputs", num_args = 1.., value_parser = clap::value_parser!(PathBuf))]
    pub seq_files: Vec<PathBuf>,
}

#[derive(Args)]
pub struct WindowArgs {
    /// Smallest window size
    #[arg(short = 's', long, help_heading = "Composition vectors", default_value_t = DEFAULT_START, value_parser = validate_window)]
    pub start: usize,

    /// Largest window size
    #[arg(short = 'e', long, help_heading = "Composition vectors", default_value_t = DEFAULT_END, value_parser = validate_window)]
    pub end: usize,

    /// Number of features: N > 0 keeps the top N k-mers, 0 keeps k-mers scoring at
    /// least 1.0, and -L selects by profile likelihood with a look-ahead of L
    #[arg(short = 'n', long, help_heading = "Composition vectors", allow_negative_numbers = true)]
    pub top_nmers: Option<i64>,
}

#[derive(Args)]
pub struct OutputArgs {
    /// Output directory
    #[arg(short = 'o', long, help_heading = "Output", value_parser = clap::value_parser!(PathBuf))]
    pub out_dir: PathBuf,

    /// Distance metric
    #[arg(short, long, help_heading = "Output", value_enum, default_value_t = Metric::Cosine)]
    pub metric: Metric,

    /// Digits after the decimal point in the PHYLIP matrix
    #[arg(long, help_heading = "Output", default_value_t = DEFAULT_DIGITS)]
    pub digits: usize,
}

/// Where the single-node path keeps per-sample distributions.
#[derive(Clone, Debug, PartialEq)]
pub enum Backend {
    Memory,
    Sqlite(PathBuf),
}

#[derive(Args)]
pub struct VectorsArgs {
    #[command(flatten)]
    pub inputs: InputArgs,

    #[command(flatten)]
    pub window: WindowArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Storage for sample distributions: `memory` or `sqlite:<path>`
    #[arg(short, long, help_heading = "Storage", default_value = "memory", value_parser = parse_backend)]
    pub backend: Backend,

    /// Extend the vector set with this id in the SQLite database
    #[arg(long, help_heading = "Storage")]
    pub vector_set_id: Option<i64>,

    /// Name of a newly created vector set
    #[arg(long, help_heading = "Storage", default_value = "ccv")]
    pub vector_set_name: String,
}

#[derive(Args)]
pub struct PipelineArgs {
    #[command(flatten)]
    pub inputs: InputArgs,

    #[command(flatten)]
    pub window: WindowArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Directory for intermediate datasets [default: <out_dir>/work]
    #[arg(short = 'w', long, help_heading = "Pipeline", value_parser = clap::value_parser!(PathBuf))]
    pub work_dir: Option<PathBuf>,

    /// Number of input partitions (map tasks per stage)
    #[arg(long, help_heading = "Pipeline", default_value_t = 4, value_parser = validate_tasks)]
    pub workers: usize,

    /// Number of reduce partitions
    #[arg(long, help_heading = "Pipeline", default_value_t = 4, value_parser = validate_tasks)]
    pub reducers: usize,

    /// Skip stages whose output is already complete
    #[arg(long, help_heading = "Pipeline", default_value_t = false)]
    pub resume: bool,

    /// Sub-k-mers remembered per counting task before the memory is cleared
    #[arg(long, help_heading = "Pipeline", default_value_t = DEFAULT_SEEN_LIMIT)]
    pub seen_limit: usize,

    /// Feature file to use instead of selecting features
    #[arg(long, help_heading = "Pipeline", value_parser = clap::value_parser!(PathBuf))]
    pub features: Option<PathBuf>,

    /// Stop after the feature vectors
    #[arg(long, help_heading = "Pipeline", default_value_t = false)]
    pub skip_distance: bool,
}

#[derive(Args)]
pub struct DistanceArgs {
    /// Vector file written by `vectors` or `pipeline`
    #[arg(short = 'x', long, help_heading = "Inputs", value_parser = clap::value_parser!(PathBuf))]
    pub vectors: PathBuf,

    /// File listing sample names, one per line, in the desired matrix order
    #[arg(long, help_heading = "Inputs", value_parser = clap::value_parser!(PathBuf))]
    pub order: Option<PathBuf>,

    #[command(flatten)]
    pub output: OutputArgs,
}

fn parse_backend(backend: &str) -> Result<Backend, String> {
    match backend.split_once(':') {
        None if backend == "memory" => Ok(Backend::Memory),
        Some(("sqlite", path)) if !path.is_empty() => Ok(Backend::Sqlite(PathBuf::from(path))),
        _ => Err(format!("`{backend}` isn't a valid backend; use `memory` or `sqlite:<path>`")),
    }
}

fn validate_window(size: &str) -> Result<usize, String> {
    let size: usize = size
        .parse()
        .map_err(|_| format!("`{size}` isn't a valid window size"))?;

    if size < 3 {
        return Err("Window size must be at least 3".to_string());
    }

    Ok(size)
}

fn validate_tasks(tasks: &str) -> Result<usize, String> {
    let tasks: usize = tasks
        .parse()
        .map_err(|_| format!("`{tasks}` isn't a valid value"))?;

    if tasks == 0 {
        return Err("Number of tasks must be at least 1".to_string());
    }

    Ok(tasks)
}

fn validate_threads(threads: &str) -> Result<usize, String> {
    let threads: usize = threads
        .parse()
        .map_err(|_| format!("`{threads}` isn't a valid value"))?;

    if !(1..=1024).contains(&threads) {
        return Err("Threads must be in the range [1, 1024]".to_string());
    }

    Ok(threads)
}

fn get_styles() -> clap::builder::Styles {
    let bold = |color| {
        anstyle::Style::new()
            .bold()
            .fg_color(Some(anstyle::Color::Ansi(color)))
    };
    let plain = |color| anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(color)));

    clap::builder::Styles::styled()
        .usage(bold(anstyle::AnsiColor::White))
        .header(bold(anstyle::AnsiColor::White))
        .literal(plain(anstyle::AnsiColor::Green))
        .invalid(bold(anstyle::AnsiColor::Red))
        .error(bold(anstyle::AnsiColor::Red))
        .valid(bold(anstyle::AnsiColor::Green).underline())
        .placeholder(plain(anstyle::AnsiColor::White))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parse_backend() {
        assert_eq!(parse_backend("memory"), Ok(Backend::Memory));
        assert_eq!(
            parse_backend("sqlite:/tmp/ccv.db"),
            Ok(Backend::Sqlite(PathBuf::from("/tmp/ccv.db")))
        );
        assert!(parse_backend("sqlite:").is_err());
        assert!(parse_backend("postgres:db").is_err());
    }

    #[test]
    fn test_negative_top_nmers() {
        let cli = Cli::try_parse_from(["ccv", "vectors", "-i", "seqs", "-o", "out", "-n", "-5", "-m", "es"])
            .unwrap();
        match cli.command {
            Command::Vectors(args) => {
                assert_eq!(args.window.top_nmers, Some(-5));
                assert_eq!(args.output.metric, Metric::SquaredEuclidean);
                assert_eq!(args.backend, Backend::Memory);
            }
            _ => panic!("expected the vectors command"),
        }
    }

    #[test]
    fn test_inputs_are_exclusive() {
        let result = Cli::try_parse_from(["ccv", "vectors", "-i", "seqs", "-f", "a.fa", "-o", "out"]);
        assert!(result.is_err());
    }
}
