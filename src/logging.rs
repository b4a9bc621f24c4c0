//! Logger configuration: stderr plus `ccv.log` in the output directory.

use std::path::Path;

use log::LevelFilter;
use log4rs::{
    append::{console::{ConsoleAppender, Target}, file::FileAppender},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};

pub const LOG_FILE: &str = "ccv.log";

const PATTERN: &str = "[{d(%Y-%m-%d %H:%M:%S)}] {h({l})}: {m}{n}";

/// Log at `Info`, or `Debug` when verbose, to stderr and the log file.
pub fn setup_logger(out_dir: &Path, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let stderr = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .target(Target::Stderr)
        .build();

    std::fs::create_dir_all(out_dir)?;
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(out_dir.join(LOG_FILE))?;

    let config = Config::builder()
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(level)))
                .build("stderr", Box::new(stderr)),
        ).appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(level)))
                .build("logfile", Box::new(logfile)),
        )
        .build(Root::builder().appender("stderr").appender("logfile").build(LevelFilter::Trace))
        .expect("Failed to configure logger.");

    log4rs::init_config(config).expect("Failed to initialize logger.");
    Ok(())
}
