//! Client-side transfer display
//!
//! A single indicatif bar per file. Throughput switches to KB/s inside the
//! 0.1-0.9 MB/s band and reads MB/s everywhere else; sizes read KB below
//! 1 MiB and MB above.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::protocol::timeouts::PROGRESS_TICK_MS;

const MIB: f64 = 1_048_576.0;
const KIB: f64 = 1024.0;

pub fn rate_label(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return "-- MB/s".to_string();
    }
    let mbps = bytes as f64 / MIB / secs;
    if (0.1..=0.9).contains(&mbps) {
        format!("{:.1} KB/s", mbps * 1024.0)
    } else {
        format!("{:.2} MB/s", mbps)
    }
}

pub fn size_label(bytes: u64) -> String {
    if (bytes as f64) < MIB {
        format!("{:.1} KB", bytes as f64 / KIB)
    } else {
        format!("{:.1} MB", bytes as f64 / MIB)
    }
}

pub struct TransferProgress {
    bar: ProgressBar,
    start: Instant,
    verb: &'static str,
    filename: String,
}

impl TransferProgress {
    pub fn new(verb: &'static str, filename: &str, total: u64, visible: bool) -> Self {
        let bar = if visible { ProgressBar::new(total) } else { ProgressBar::hidden() };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:30.cyan/blue}] {percent:>3}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(PROGRESS_TICK_MS));
        let p = Self { bar, start: Instant::now(), verb, filename: filename.to_string() };
        p.update(0);
        p
    }

    pub fn update(&self, done: u64) {
        self.bar.set_position(done);
        self.bar.set_message(format!(
            "{} {} {} @ {}",
            self.verb.with(Color::Green).bold(),
            self.filename,
            size_label(done),
            rate_label(done, self.start.elapsed())
        ));
    }

    pub fn finish(&self, done: u64, expected: u64) {
        let elapsed = self.start.elapsed();
        let msg = if done == expected {
            format!(
                "{} {} ({}) in {:.1}s @ {}",
                "Done".with(Color::Green).bold(),
                self.filename,
                size_label(done),
                elapsed.as_secs_f64(),
                rate_label(done, elapsed)
            )
        } else {
            format!(
                "{} {} after {} of {}",
                "Incomplete".with(Color::Red).bold(),
                self.filename,
                size_label(done),
                size_label(expected)
            )
        };
        self.bar.finish_with_message(msg);
    }
}
