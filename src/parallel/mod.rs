//! Concurrent execution of many pipeline runs

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::{ImageFormat, NamingConfig, PipelineSpec};
use crate::error::{FastPipeError, Result, Stage};
use crate::processing::{CancelFlag, Pipeline, RunMode, RunOutput, Source, StageTimings};

pub mod progress;

pub use progress::*;

/// One input of a batch and where its output goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub input: PathBuf,
    pub mode: RunMode,
}

impl BatchJob {
    /// Keep the encoded bytes in memory
    pub fn buffer<P: Into<PathBuf>>(input: P) -> Self {
        Self {
            input: input.into(),
            mode: RunMode::Buffer,
        }
    }

    /// Write the encoded bytes to `output`
    pub fn to_file<P: Into<PathBuf>, Q: Into<PathBuf>>(input: P, output: Q) -> Self {
        Self {
            input: input.into(),
            mode: RunMode::File(output.into()),
        }
    }

    fn name(&self) -> String {
        self.input
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    }
}

/// Pair every input with an output file under `output_dir`, named by `naming`.
/// Subdirectories of `input_root` are mirrored in the output tree.
pub fn plan_jobs(
    inputs: &[PathBuf],
    input_root: &Path,
    output_dir: &Path,
    naming: &NamingConfig,
    format: ImageFormat,
) -> Vec<BatchJob> {
    inputs
        .iter()
        .map(|input| {
            let name = input.file_name().and_then(|n| n.to_str()).unwrap_or("output");
            let relative_dir = input
                .parent()
                .and_then(|parent| parent.strip_prefix(input_root).ok())
                .unwrap_or_else(|| Path::new(""));
            let output = output_dir
                .join(relative_dir)
                .join(naming.generate_filename(name, format));
            BatchJob::to_file(input, output)
        })
        .collect()
}

/// Outcome details of a successful run, without the encoded bytes
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub input_format: ImageFormat,
    pub output_format: ImageFormat,
    pub input_dimensions: (u32, u32),
    pub output_dimensions: (u32, u32),
    pub output_bytes: u64,
    pub timings: StageTimings,
    pub cache_hit: bool,
}

impl From<&RunOutput> for RunSummary {
    fn from(output: &RunOutput) -> Self {
        Self {
            input_format: output.input_format,
            output_format: output.output_format,
            input_dimensions: output.input_dimensions,
            output_dimensions: output.output_dimensions,
            output_bytes: output.bytes.len() as u64,
            timings: output.timings,
            cache_hit: output.cache_hit,
        }
    }
}

/// Result of one run of a batch, at the position of its job
#[derive(Debug)]
pub struct RunReport {
    pub index: usize,
    pub input: PathBuf,
    pub mode: RunMode,
    pub outcome: Result<RunSummary>,
}

/// Result of a batch, reports in job order
#[derive(Debug)]
pub struct BatchResult {
    pub reports: Vec<RunReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub total_output_bytes: u64,
    pub total_pixels: u64,
}

impl BatchResult {
    fn from_reports(reports: Vec<RunReport>, elapsed: Duration) -> Self {
        let mut result = Self {
            succeeded: 0,
            failed: 0,
            elapsed,
            total_output_bytes: 0,
            total_pixels: 0,
            reports: Vec::new(),
        };

        for report in &reports {
            match &report.outcome {
                Ok(summary) => {
                    result.succeeded += 1;
                    result.total_output_bytes += summary.output_bytes;
                    let (w, h) = summary.output_dimensions;
                    result.total_pixels += w as u64 * h as u64;
                }
                Err(_) => result.failed += 1,
            }
        }
        result.reports = reports;
        result
    }

    pub fn runs_per_second(&self) -> f64 {
        self.rate(self.succeeded as f64)
    }

    pub fn pixels_per_second(&self) -> f64 {
        self.rate(self.total_pixels as f64)
    }

    fn rate(&self, amount: f64) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            amount / seconds
        } else {
            0.0
        }
    }

    /// Average wall time per successful run
    pub fn average_time_per_run(&self) -> Duration {
        match self.succeeded {
            0 => Duration::ZERO,
            n => self.elapsed / n as u32,
        }
    }

    /// Failed runs with their errors
    pub fn errors(&self) -> impl Iterator<Item = (&Path, &FastPipeError)> {
        self.reports
            .iter()
            .filter_map(|report| report.outcome.as_ref().err().map(|e| (report.input.as_path(), e)))
    }
}

/// Runs a spec over many inputs with bounded concurrency. Each run executes on
/// the blocking pool; results come back in input order.
pub struct ParallelRunner {
    pipeline: Arc<Pipeline>,
    concurrency: usize,
    semaphore: Arc<Semaphore>,
    progress: Arc<ProgressTracker>,
    /// Flag for the batch that is running or about to run
    cancel: Mutex<CancelFlag>,
    stop_on_fatal: bool,
}

impl ParallelRunner {
    /// Create a runner using the pipeline's configured concurrency
    pub fn new(pipeline: Pipeline) -> Self {
        let concurrency = pipeline.runtime().effective_concurrency();
        Self::with_concurrency(pipeline, concurrency)
    }

    /// Create a runner with at most `concurrency` runs in flight
    pub fn with_concurrency(pipeline: Pipeline, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        info!("Initializing parallel runner with {} concurrent runs", concurrency);

        Self {
            pipeline: Arc::new(pipeline),
            concurrency,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            progress: Arc::new(ProgressTracker::new()),
            cancel: Mutex::new(CancelFlag::new()),
            stop_on_fatal: true,
        }
    }

    /// Whether a failure that would repeat for every input cancels the rest of
    /// the batch (on by default)
    pub fn stop_on_fatal(mut self, stop: bool) -> Self {
        self.stop_on_fatal = stop;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Flag that cancels the remaining runs of the current batch. Each batch
    /// gets a fresh flag once the previous one finishes, so cancelling never
    /// carries over.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    /// Run `spec` over every job
    pub async fn run_batch(&self, jobs: Vec<BatchJob>, spec: &PipelineSpec) -> BatchResult {
        let started = Instant::now();
        info!("Starting batch of {} runs", jobs.len());
        self.progress.start(jobs.len() as u64);

        let names: Vec<String> = jobs.iter().map(BatchJob::name).collect();
        let sources: Vec<(Source, RunMode)> = jobs
            .iter()
            .map(|job| (Source::from(job.input.as_path()), job.mode.clone()))
            .collect();
        let outputs = self.dispatch(names, sources, spec).await;

        let reports = jobs
            .into_iter()
            .zip(outputs)
            .enumerate()
            .map(|(index, (job, output))| RunReport {
                index,
                input: job.input,
                mode: job.mode,
                outcome: output.map(|output| RunSummary::from(&output)),
            })
            .collect();

        self.progress.complete_batch();
        let result = BatchResult::from_reports(reports, started.elapsed());
        info!(
            "Batch finished in {:.2}s: {} succeeded, {} failed",
            result.elapsed.as_secs_f64(),
            result.succeeded,
            result.failed
        );
        result
    }

    /// Run `spec` over in-memory inputs, returning encoded bytes in input order
    pub async fn run_buffers(
        &self,
        inputs: Vec<Vec<u8>>,
        spec: &PipelineSpec,
    ) -> Vec<Result<Vec<u8>>> {
        self.progress.start(inputs.len() as u64);

        let names = (0..inputs.len()).map(|i| format!("buffer #{}", i)).collect();
        let sources = inputs
            .into_iter()
            .map(|bytes| (Source::Bytes(bytes), RunMode::Buffer))
            .collect();
        let outputs = self.dispatch(names, sources, spec).await;

        self.progress.complete_batch();
        outputs.into_iter().map(|output| output.map(|o| o.bytes)).collect()
    }

    async fn dispatch(
        &self,
        names: Vec<String>,
        sources: Vec<(Source, RunMode)>,
        spec: &PipelineSpec,
    ) -> Vec<Result<RunOutput>> {
        let batch_cancel = self.cancel_flag();
        let mut tasks = Vec::with_capacity(sources.len());

        for (index, (name, (source, mode))) in names.into_iter().zip(sources).enumerate() {
            let pipeline = Arc::clone(&self.pipeline);
            let semaphore = Arc::clone(&self.semaphore);
            let progress = Arc::clone(&self.progress);
            let cancel = batch_cancel.clone();
            let stop_on_fatal = self.stop_on_fatal;
            let spec = spec.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| FastPipeError::system(format!("Semaphore closed: {}", e)))?;

                progress.start_run(index, &name);
                let started = Instant::now();
                let run_cancel = cancel.clone();
                let result = tokio::task::spawn_blocking(move || {
                    pipeline.execute_cancellable(&source, &spec, &mode, &run_cancel)
                })
                .await
                .map_err(|e| FastPipeError::system(format!("Task join error: {}", e)))
                .and_then(|result| result);

                match &result {
                    Ok(output) => {
                        let (w, h) = output.output_dimensions;
                        progress.complete_run(
                            index,
                            &name,
                            output.bytes.len() as u64,
                            w as u64 * h as u64,
                            started.elapsed(),
                        );
                    }
                    Err(e) => {
                        if stop_on_fatal && !e.is_recoverable() && !cancel.is_cancelled() {
                            warn!("Cancelling batch after fatal error on {}: {}", name, e);
                            cancel.cancel();
                        }
                        progress.fail_run(index, &name, e.stage(), e.user_message());
                    }
                }
                result
            }));
        }

        let outputs = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| {
                joined.map_err(|e| FastPipeError::system(format!("Task join error: {}", e)))?
            })
            .collect();

        *self.cancel.lock().unwrap() = CancelFlag::new();
        outputs
    }
}

/// True when a batch was cut short by cancellation
pub fn was_cancelled(result: &BatchResult) -> bool {
    result.reports.iter().any(|report| {
        matches!(&report.outcome, Err(e) if e.kind() == crate::error::ErrorKind::Cancelled)
    })
}

/// Stage that failed most often across a batch
pub fn most_common_failure(result: &BatchResult) -> Option<Stage> {
    let mut counts = std::collections::HashMap::new();
    for (_, error) in result.errors() {
        if let Some(stage) = error.stage() {
            *counts.entry(stage).or_insert(0usize) += 1;
        }
    }
    counts.into_iter().max_by_key(|&(stage, count)| (count, stage as u8)).map(|(stage, _)| stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Operation, RuntimeConfig};
    use crate::error::ErrorKind;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png_input(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8, y as u8, 7]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn runner(concurrency: usize) -> ParallelRunner {
        let pipeline = Pipeline::with_runtime(RuntimeConfig::default());
        ParallelRunner::with_concurrency(pipeline, concurrency)
    }

    #[tokio::test]
    async fn test_runner_creation() {
        assert_eq!(runner(4).concurrency(), 4);
        assert_eq!(runner(0).concurrency(), 1);

        let auto = ParallelRunner::new(Pipeline::with_runtime(RuntimeConfig::default()));
        assert!(auto.concurrency() > 0 && auto.concurrency() <= 16);
    }

    #[tokio::test]
    async fn test_buffers_keep_input_order() {
        let runner = runner(3);
        let inputs: Vec<Vec<u8>> = (1..=6).map(|i| png_input(10 * i, 5 * i)).collect();
        let spec = PipelineSpec::new(ImageFormat::Png);

        let outputs = runner.run_buffers(inputs, &spec).await;
        assert_eq!(outputs.len(), 6);
        for (i, output) in outputs.into_iter().enumerate() {
            let bytes = output.unwrap();
            let img = image::load_from_memory(&bytes).unwrap();
            assert_eq!(img.width(), 10 * (i as u32 + 1));
        }

        let state = runner.progress().get_state();
        assert_eq!(state.completed_runs, 6);
        assert_eq!(state.failed_runs, 0);
    }

    #[tokio::test]
    async fn test_batch_to_files_with_failures() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.png");
        let bad = dir.path().join("bad.png");
        std::fs::write(&good, png_input(40, 30)).unwrap();
        std::fs::write(&bad, b"definitely not a png").unwrap();

        let out_dir = dir.path().join("out");
        let jobs = plan_jobs(
            &[good.clone(), bad.clone()],
            dir.path(),
            &out_dir,
            &NamingConfig::default(),
            ImageFormat::WebP,
        );
        assert_eq!(jobs[0].mode, RunMode::File(out_dir.join("good.webp")));

        let spec = PipelineSpec::new(ImageFormat::WebP).resize(20, 20);
        let result = runner(2).run_batch(jobs, &spec).await;

        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.reports[0].input, good);
        assert_eq!(result.reports[1].input, bad);
        assert_eq!(result.reports[0].outcome.as_ref().unwrap().output_dimensions, (20, 20));
        assert!(out_dir.join("good.webp").exists());
        assert!(!out_dir.join("bad.webp").exists());

        let (path, error) = result.errors().next().unwrap();
        assert_eq!(path, bad.as_path());
        assert_eq!(error.kind(), ErrorKind::Decode);
        assert_eq!(most_common_failure(&result), Some(Stage::Decode));
        assert!(!was_cancelled(&result));
    }

    #[tokio::test]
    async fn test_cancelled_batch() {
        let runner = runner(2);
        runner.cancel_flag().cancel();

        let inputs = vec![png_input(8, 8), png_input(8, 8)];
        let outputs = runner.run_buffers(inputs, &PipelineSpec::new(ImageFormat::Png)).await;
        for output in outputs {
            assert_eq!(output.unwrap_err().kind(), ErrorKind::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_fatal_error_stops_batch() {
        // A single run in flight makes the order of failures deterministic
        let runner = runner(1);
        let spec = PipelineSpec::new(ImageFormat::Png).then(Operation::Extract {
            left: 0,
            top: 0,
            width: 0,
            height: 10,
        });
        let outputs = runner.run_buffers(vec![png_input(8, 8), png_input(8, 8)], &spec).await;
        assert_eq!(outputs[0].as_ref().unwrap_err().kind(), ErrorKind::InvalidParameters);
        assert_eq!(outputs[1].as_ref().unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cancellation_does_not_outlive_its_batch() {
        let runner = runner(1);
        let fatal = PipelineSpec::new(ImageFormat::Png).then(Operation::Extract {
            left: 0,
            top: 0,
            width: 0,
            height: 10,
        });
        let outputs = runner.run_buffers(vec![png_input(8, 8), png_input(8, 8)], &fatal).await;
        assert_eq!(outputs[1].as_ref().unwrap_err().kind(), ErrorKind::Cancelled);
        assert!(!runner.cancel_flag().is_cancelled());

        let plain = PipelineSpec::new(ImageFormat::Png);
        let outputs = runner.run_buffers(vec![png_input(8, 8), png_input(8, 8)], &plain).await;
        assert!(outputs.iter().all(|output| output.is_ok()));

        // An explicit cancel only affects the next batch
        runner.cancel_flag().cancel();
        let outputs = runner.run_buffers(vec![png_input(8, 8)], &plain).await;
        assert_eq!(outputs[0].as_ref().unwrap_err().kind(), ErrorKind::Cancelled);
        let outputs = runner.run_buffers(vec![png_input(8, 8)], &plain).await;
        assert!(outputs[0].is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_limit_bounds_runs_in_flight() {
        let runner = runner(2);
        let inputs: Vec<Vec<u8>> = (0..8).map(|_| png_input(64, 64)).collect();
        let spec = PipelineSpec::new(ImageFormat::Png).then("blur=2".parse().unwrap());

        let outputs = runner.run_buffers(inputs, &spec).await;
        assert!(outputs.iter().all(|output| output.is_ok()));

        let state = runner.progress().get_state();
        assert_eq!(state.completed_runs, 8);
        assert!(state.peak_in_flight >= 1);
        assert!(state.peak_in_flight <= 2, "peak was {}", state.peak_in_flight);
    }

    #[test]
    fn test_plan_jobs_mirrors_subdirectories() {
        let naming = NamingConfig {
            suffix: Some("_small".to_string()),
            ..Default::default()
        };
        let jobs = plan_jobs(
            &[PathBuf::from("/in/a.jpg"), PathBuf::from("/in/nested/b.png")],
            Path::new("/in"),
            Path::new("/out"),
            &naming,
            ImageFormat::Jpeg,
        );
        assert_eq!(jobs[0].mode, RunMode::File(PathBuf::from("/out/a_small.jpg")));
        assert_eq!(jobs[1].mode, RunMode::File(PathBuf::from("/out/nested/b_small.jpg")));
    }

    #[test]
    fn test_batch_result_rates() {
        let result = BatchResult {
            reports: Vec::new(),
            succeeded: 10,
            failed: 2,
            elapsed: Duration::from_secs(5),
            total_output_bytes: 5_000_000,
            total_pixels: 1_000_000,
        };
        assert_eq!(result.runs_per_second(), 2.0);
        assert_eq!(result.pixels_per_second(), 200_000.0);
        assert_eq!(result.average_time_per_run(), Duration::from_millis(500));
    }
}
