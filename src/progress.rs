//! Download progress observers
//!
//! The pipeline reports through `ProgressObserver`; it never reads anything
//! back, so an observer cannot change what gets transferred.

use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

pub trait ProgressObserver: Send + Sync {
    /// A file job started downloading `total` bytes
    fn on_job_start(&self, _name: &str, _total: u64) {}
    /// `delta` more bytes of `name` were written
    fn on_bytes(&self, _name: &str, _delta: u64) {}
    /// The job for `name` is over; `ok` is false when it was abandoned.
    /// Called exactly once per start.
    fn on_job_end(&self, _name: &str, _ok: bool) {}
}

pub struct NoProgress;
impl ProgressObserver for NoProgress {}

/// Running counts kept by `BarProgress`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub completed: u64,
    pub failed: u64,
    pub bytes: u64,
}

/// One indicatif bar per in-flight file, plus running totals
pub struct BarProgress {
    bars: MultiProgress,
    style: ProgressStyle,
    active: Mutex<HashMap<String, ProgressBar>>,
    totals: Mutex<Totals>,
    start_time: Instant,
}

impl BarProgress {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let style = ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {bytes:>10}/{total_bytes:<10} {bytes_per_sec:>12} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        Self {
            bars: MultiProgress::with_draw_target(target),
            style,
            active: Mutex::new(HashMap::new()),
            totals: Mutex::new(Totals::default()),
            start_time: Instant::now(),
        }
    }

    /// Number of files whose job has not ended yet
    pub fn in_flight(&self) -> usize {
        self.active.lock().len()
    }

    pub fn totals(&self) -> Totals {
        *self.totals.lock()
    }

    /// Print a one-line summary below the bars
    pub fn finish(&self) {
        let Totals { completed, failed, bytes } = self.totals();
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        };
        let mut line = format!(
            "Completed {} files ({}) in {:.1}s ({}/s)",
            completed,
            HumanBytes(bytes),
            elapsed,
            HumanBytes(throughput as u64)
        );
        if failed > 0 {
            line.push_str(&format!(", {} failed", failed));
        }
        let _ = self.bars.println(line);
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for BarProgress {
    fn on_job_start(&self, name: &str, total: u64) {
        let bar = self.bars.add(ProgressBar::new(total));
        bar.set_style(self.style.clone());
        bar.set_message(name.to_string());
        self.active.lock().insert(name.to_string(), bar);
    }

    fn on_bytes(&self, name: &str, delta: u64) {
        if let Some(bar) = self.active.lock().get(name) {
            bar.inc(delta);
        }
        self.totals.lock().bytes += delta;
    }

    fn on_job_end(&self, name: &str, ok: bool) {
        if let Some(bar) = self.active.lock().remove(name) {
            if ok {
                bar.finish();
            } else {
                bar.abandon_with_message(format!("{} (failed)", name));
            }
        }
        let mut t = self.totals.lock();
        if ok {
            t.completed += 1;
        } else {
            t.failed += 1;
        }
    }
}
