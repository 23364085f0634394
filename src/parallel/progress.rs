//! Progress tracking for batch runs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::Stage;

/// Thread-safe progress tracker shared by the runs of a batch
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
    sender: broadcast::Sender<ProgressUpdate>,
    start_time: Mutex<Option<Instant>>,

    // Hot counters, folded into the state on read
    completed: AtomicUsize,
    failed: AtomicUsize,
    bytes_written: AtomicU64,
    pixels_written: AtomicU64,
}

/// Snapshot of batch progress
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub total_runs: u64,
    pub completed_runs: usize,
    pub failed_runs: usize,
    /// Runs currently executing, by batch index
    pub in_flight: BTreeMap<usize, String>,
    /// Most runs seen executing at once during this batch
    pub peak_in_flight: usize,
    pub elapsed_time: Duration,
    pub estimated_remaining: Option<Duration>,
    pub bytes_written: u64,
    pub pixels_written: u64,
    pub runs_per_second: f64,
    pub completion_percentage: f64,
}

/// Progress event broadcast to subscribers
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Started {
        total_runs: u64,
    },
    RunStarted {
        index: usize,
        name: String,
    },
    RunCompleted {
        index: usize,
        name: String,
        output_bytes: u64,
        pixels: u64,
        elapsed: Duration,
    },
    RunFailed {
        index: usize,
        name: String,
        stage: Option<Stage>,
        error: String,
    },
    BatchCompleted {
        final_state: ProgressState,
    },
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);

        Self {
            state: Mutex::new(ProgressState::default()),
            sender,
            start_time: Mutex::new(None),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            bytes_written: AtomicU64::new(0),
            pixels_written: AtomicU64::new(0),
        }
    }

    /// Reset counters and start timing a batch of `total_runs`
    pub fn start(&self, total_runs: u64) {
        *self.start_time.lock().unwrap() = Some(Instant::now());
        *self.state.lock().unwrap() = ProgressState {
            total_runs,
            ..Default::default()
        };

        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.pixels_written.store(0, Ordering::Relaxed);

        let _ = self.sender.send(ProgressUpdate::Started { total_runs });
        info!("Started batch of {} runs", total_runs);
    }

    pub fn start_run(&self, index: usize, name: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight.insert(index, name.to_string());
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight.len());
        }
        let _ = self.sender.send(ProgressUpdate::RunStarted {
            index,
            name: name.to_string(),
        });
        debug!("Run {} started: {}", index, name);
    }

    pub fn complete_run(
        &self,
        index: usize,
        name: &str,
        output_bytes: u64,
        pixels: u64,
        elapsed: Duration,
    ) {
        self.state.lock().unwrap().in_flight.remove(&index);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(output_bytes, Ordering::Relaxed);
        self.pixels_written.fetch_add(pixels, Ordering::Relaxed);
        self.update_state();

        let _ = self.sender.send(ProgressUpdate::RunCompleted {
            index,
            name: name.to_string(),
            output_bytes,
            pixels,
            elapsed,
        });
        debug!("Run {} completed: {} ({} bytes)", index, name, output_bytes);
    }

    pub fn fail_run(&self, index: usize, name: &str, stage: Option<Stage>, error: String) {
        self.state.lock().unwrap().in_flight.remove(&index);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.update_state();

        debug!("Run {} failed: {}: {}", index, name, error);
        let _ = self.sender.send(ProgressUpdate::RunFailed {
            index,
            name: name.to_string(),
            stage,
            error,
        });
    }

    fn update_state(&self) {
        let Some(started) = *self.start_time.lock().unwrap() else {
            return;
        };

        let elapsed = started.elapsed();
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);

        let mut state = self.state.lock().unwrap();
        state.completed_runs = completed;
        state.failed_runs = failed;
        state.elapsed_time = elapsed;
        state.bytes_written = self.bytes_written.load(Ordering::Relaxed);
        state.pixels_written = self.pixels_written.load(Ordering::Relaxed);

        let finished = (completed + failed) as u64;
        if state.total_runs > 0 {
            state.completion_percentage = finished as f64 / state.total_runs as f64 * 100.0;
        }

        let seconds = elapsed.as_secs_f64();
        if seconds > 0.0 {
            state.runs_per_second = finished as f64 / seconds;
            state.estimated_remaining = (finished > 0 && state.total_runs > finished).then(|| {
                let per_run = seconds / finished as f64;
                Duration::from_secs_f64((state.total_runs - finished) as f64 * per_run)
            });
        }
    }

    /// Current progress
    pub fn get_state(&self) -> ProgressState {
        self.update_state();
        self.state.lock().unwrap().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }

    /// Announce the end of the batch
    pub fn complete_batch(&self) {
        let final_state = self.get_state();

        info!(
            "Batch completed: {}/{} runs succeeded in {:.2}s",
            final_state.completed_runs,
            final_state.total_runs,
            final_state.elapsed_time.as_secs_f64()
        );
        let _ = self.sender.send(ProgressUpdate::BatchCompleted { final_state });
    }

    /// Throughput figures derived from the current state
    pub fn get_metrics(&self) -> ProgressMetrics {
        let state = self.get_state();
        let seconds = state.elapsed_time.as_secs_f64();
        let per_second = |value: u64| if seconds > 0.0 { value as f64 / seconds } else { 0.0 };

        ProgressMetrics {
            runs_per_second: state.runs_per_second,
            bytes_per_second: per_second(state.bytes_written),
            pixels_per_second: per_second(state.pixels_written),
            average_output_size: match state.completed_runs {
                0 => 0,
                n => state.bytes_written / n as u64,
            },
            success_rate: if state.total_runs > 0 {
                state.completed_runs as f64 / state.total_runs as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    /// Finished runs, successful or not
    pub fn finished_runs(&self) -> usize {
        self.completed_runs + self.failed_runs
    }

    pub fn status_text(&self) -> String {
        if self.completion_percentage >= 100.0 {
            "Completed".to_string()
        } else if self.in_flight.is_empty() {
            format!("{}/{} runs finished", self.finished_runs(), self.total_runs)
        } else {
            format!(
                "{}/{} runs finished, {} running",
                self.finished_runs(),
                self.total_runs,
                self.in_flight.len()
            )
        }
    }

    pub fn eta_text(&self) -> String {
        match self.estimated_remaining {
            Some(duration) => {
                let seconds = duration.as_secs();
                if seconds < 60 {
                    format!("{}s", seconds)
                } else if seconds < 3600 {
                    format!("{}m {}s", seconds / 60, seconds % 60)
                } else {
                    format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
                }
            }
            None => "Unknown".to_string(),
        }
    }

    pub fn speed_text(&self) -> String {
        if self.runs_per_second >= 1.0 {
            format!("{:.1} runs/sec", self.runs_per_second)
        } else if self.runs_per_second > 0.0 {
            format!("{:.1} sec/run", 1.0 / self.runs_per_second)
        } else {
            "Unknown".to_string()
        }
    }
}

/// Performance metrics derived from progress state
#[derive(Debug, Clone)]
pub struct ProgressMetrics {
    pub runs_per_second: f64,
    pub bytes_per_second: f64,
    pub pixels_per_second: f64,
    pub average_output_size: u64,
    pub success_rate: f64,
}

impl ProgressMetrics {
    pub fn throughput_text(&self) -> String {
        let mb_per_sec = self.bytes_per_second / 1024.0 / 1024.0;
        format!("{:.1} MB/s, {:.0} Mpx/s", mb_per_sec, self.pixels_per_second / 1_000_000.0)
    }

    pub fn average_size_text(&self) -> String {
        let mb = self.average_output_size as f64 / 1024.0 / 1024.0;
        if mb >= 1.0 {
            format!("{:.1} MB", mb)
        } else {
            format!("{:.0} KB", self.average_output_size as f64 / 1024.0)
        }
    }
}
