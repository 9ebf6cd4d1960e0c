//! Download progress display

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

/// Spinner with a running byte count; hidden unless enabled
pub struct TransferProgress {
    spinner: ProgressBar,
    label: String,
    start_time: Instant,
}

impl TransferProgress {
    pub fn new(enabled: bool, label: &str) -> Self {
        let spinner = if enabled {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::default_spinner()
                    .template("  {spinner:.green} {msg} {bytes} ({bytes_per_sec})")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
            );
            spinner.enable_steady_tick(Duration::from_millis(120));
            spinner
        } else {
            ProgressBar::hidden()
        };
        spinner.set_message(label.to_string());

        Self {
            spinner,
            label: label.to_string(),
            start_time: Instant::now(),
        }
    }

    pub fn advance(&self, bytes: u64) {
        self.spinner.inc(bytes);
    }

    pub fn finish(&self, total: u64) {
        let secs = self.start_time.elapsed().as_secs_f64();
        let rate = if secs > 0.0 {
            total as f64 / secs / 1_048_576.0
        } else {
            0.0
        };
        self.spinner.finish_with_message(format!(
            "{} done ({} bytes in {:.1}s, {:.1} MB/s)",
            self.label, total, secs, rate
        ));
    }

    pub fn fail(&self, msg: &str) {
        self.spinner
            .abandon_with_message(format!("{} failed: {}", self.label, msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_progress_counts_bytes() {
        let progress = TransferProgress::new(false, "notes.txt");
        progress.advance(10);
        progress.advance(32);
        assert_eq!(progress.spinner.position(), 42);
        progress.finish(42);
    }
}
