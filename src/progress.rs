//! Progress bars for sample ingestion and pipeline tasks.

use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str =
    "[{elapsed_precise}] {bar:40.cyan/blue} {percent}% [{human_pos}/{human_len}] [Remaining: {eta}]";
const TASK_TEMPLATE: &str =
    "[{elapsed_precise}] {prefix:>20} {bar:20.cyan/blue} [{human_pos}/{human_len} tasks]";

fn styled(len: u64, template: &str) -> ProgressBar {
    let progress_bar = ProgressBar::new(len);
    progress_bar.set_style(ProgressStyle::default_bar().template(template).expect("Invalid progress style."));

    progress_bar
}

/// Progress bar over `len` items.
pub fn progress_bar(len: u64) -> ProgressBar {
    styled(len, BAR_TEMPLATE)
}

/// Progress bar over the map or reduce tasks of a pipeline stage.
pub fn task_progress(len: u64, stage: &str, phase: &str) -> ProgressBar {
    let progress_bar = styled(len, TASK_TEMPLATE);
    progress_bar.set_prefix(format!("{stage} {phase}"));

    progress_bar
}
