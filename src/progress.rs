//! Cargo-style transfer display
//!
//! Status lines scroll above; the spinner or byte bar stays fixed at the bottom.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const MIB: f64 = 1_048_576.0;

pub struct TransferProgress {
    bar: ProgressBar,
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Print a line above the bar.
    pub fn print_line(&self, label: &str, detail: &str) {
        self.bar.suspend(|| {
            println!("{} {}", format!("{label:>12}").with(Color::Green).bold(), detail.with(Color::Cyan));
        });
    }

    pub fn waiting(&self, peer: &str) {
        self.bar.set_message(format!("{} for {} to accept", "Waiting".with(Color::Green).bold(), peer));
    }

    /// Switch to a byte bar when the size is known, otherwise keep spinning.
    pub fn accepted(&self, total: Option<u64>) {
        // Throughput counts from acceptance, not from the ask.
        self.bar.reset_elapsed();
        match total {
            Some(total) => {
                self.bar.set_length(total);
                self.bar.set_position(0);
                self.bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{msg} [{bar:30.green/white}] {bytes}/{total_bytes} ({bytes_per_sec})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=> "),
                );
                self.bar.set_message(format!("{}", "Sending".with(Color::Green).bold()));
            }
            None => self
                .bar
                .set_message(format!("{} (size unknown)", "Sending".with(Color::Green).bold())),
        }
    }

    pub fn set_position(&self, sent: u64) {
        self.bar.set_position(sent);
    }

    /// Free-form status for receive mode.
    pub fn set_status(&self, stage: &str, details: &str) {
        self.bar.set_message(format!("{} {}", stage.with(Color::Green).bold(), details));
    }

    pub fn finish_success(&self, bytes: u64) {
        let secs = self.bar.elapsed().as_secs_f64();
        let rate = if secs > 0.0 { bytes as f64 / secs / MIB } else { 0.0 };
        self.bar.finish_and_clear();
        println!(
            "{} {:.1} MB in {:.1}s ({:.1} MB/s)",
            format!("{:>12}", "Sent").with(Color::Green).bold(),
            bytes as f64 / MIB,
            secs,
            rate
        );
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar.finish_and_clear();
        println!("{} {}", format!("{:>12}", "Failed").with(Color::Red).bold(), msg);
    }

    pub fn finish_quiet(&self) {
        self.bar.finish_and_clear();
    }
}
