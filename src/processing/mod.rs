//! Pipeline orchestration: decode, geometric and filter operations, encode, sink

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::Serialize;
use tracing::debug;

use crate::config::{self, ImageFormat, Operation, PipelineSpec, RuntimeConfig};
use crate::error::{FastPipeError, Result, Stage, StageContext};

pub mod buffer;
pub mod cache;
pub mod crop;
pub mod decode;
pub mod encode;
pub mod filters;
pub mod formats;
pub mod resize;
pub mod validation;

pub use buffer::*;
pub use cache::*;
pub use decode::*;
pub use formats::*;
pub use resize::{ResizeRequest, Resampler};
pub use validation::*;

/// Where the encoded output of a run goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Return the bytes only
    Buffer,
    /// Write the bytes to a file (parent directories are created) and return them
    File(PathBuf),
}

/// Cooperative cancellation, checked before every stage
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wall time spent in each stage of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageTimings {
    pub decode: Duration,
    pub geometric: Duration,
    pub filter: Duration,
    pub encode: Duration,
    pub sink: Duration,
}

impl StageTimings {
    fn record(&mut self, stage: Stage, elapsed: Duration) {
        match stage {
            Stage::Decode => self.decode += elapsed,
            Stage::Geometric => self.geometric += elapsed,
            Stage::Filter => self.filter += elapsed,
            Stage::Encode => self.encode += elapsed,
            Stage::Sink => self.sink += elapsed,
        }
    }

    pub fn total(&self) -> Duration {
        self.decode + self.geometric + self.filter + self.encode + self.sink
    }
}

/// Everything a run produced
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub bytes: Vec<u8>,
    pub input_format: ImageFormat,
    pub output_format: ImageFormat,
    pub input_dimensions: (u32, u32),
    pub output_dimensions: (u32, u32),
    pub timings: StageTimings,
    pub cache_hit: bool,
}

impl RunOutput {
    /// Output pixels per second of total run time
    pub fn pixels_per_second(&self) -> f64 {
        let total = self.timings.total();
        if total.is_zero() {
            return 0.0;
        }
        let (w, h) = self.output_dimensions;
        (w as u64 * h as u64) as f64 / total.as_secs_f64()
    }
}

/// Executes pipeline specs. A pipeline holds a snapshot of the runtime
/// settings and its decode cache; it can be shared between threads.
pub struct Pipeline {
    runtime: RuntimeConfig,
    decoder: Decoder,
    cache: Option<DecodeCache>,
    cancel: Option<CancelFlag>,
}

impl Pipeline {
    /// Create a pipeline using the process-wide runtime settings
    pub fn new() -> Self {
        Self::with_runtime(config::runtime().clone())
    }

    /// Create a pipeline with explicit runtime settings
    pub fn with_runtime(runtime: RuntimeConfig) -> Self {
        let cache = runtime
            .cache
            .then(|| DecodeCache::new(runtime.cache_items, runtime.cache_memory));
        Self {
            decoder: Decoder::new(runtime.max_pixels),
            runtime,
            cache,
            cancel: None,
        }
    }

    /// Attach a cancel flag checked before every stage
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// The decode cache, when caching is enabled
    pub fn cache(&self) -> Option<&DecodeCache> {
        self.cache.as_ref()
    }

    /// Run `spec` on `input`, returning the encoded bytes
    pub fn run(
        &self,
        input: impl Into<Source>,
        spec: &PipelineSpec,
        mode: RunMode,
    ) -> Result<Vec<u8>> {
        self.execute(&input.into(), spec, &mode).map(|output| output.bytes)
    }

    /// Run `spec` on the image stored at `path`
    pub fn run_file<P: AsRef<Path>>(
        &self,
        path: P,
        spec: &PipelineSpec,
        mode: RunMode,
    ) -> Result<Vec<u8>> {
        self.run(path.as_ref(), spec, mode)
    }

    /// Run `spec` on `input` and stream the encoded bytes into `writer`
    pub fn run_to_writer<W: Write>(
        &self,
        input: impl Into<Source>,
        spec: &PipelineSpec,
        writer: &mut W,
    ) -> Result<RunOutput> {
        let mut output = self.execute(&input.into(), spec, &RunMode::Buffer)?;

        check_cancelled(self.cancel.as_ref(), Stage::Sink)?;
        let started = Instant::now();
        writer
            .write_all(&output.bytes)
            .and_then(|_| writer.flush())
            .in_stage(Stage::Sink)?;
        output.timings.record(Stage::Sink, started.elapsed());

        Ok(output)
    }

    /// Run `spec` on `source`, returning bytes plus run details
    pub fn execute(
        &self,
        source: &Source,
        spec: &PipelineSpec,
        mode: &RunMode,
    ) -> Result<RunOutput> {
        self.execute_with(source, spec, mode, self.cancel.as_ref())
    }

    /// Like [`Pipeline::execute`], but checks `cancel` instead of the flag
    /// attached to the pipeline
    pub fn execute_cancellable(
        &self,
        source: &Source,
        spec: &PipelineSpec,
        mode: &RunMode,
        cancel: &CancelFlag,
    ) -> Result<RunOutput> {
        self.execute_with(source, spec, mode, Some(cancel))
    }

    fn execute_with(
        &self,
        source: &Source,
        spec: &PipelineSpec,
        mode: &RunMode,
        cancel: Option<&CancelFlag>,
    ) -> Result<RunOutput> {
        check_cancelled(cancel, Stage::Decode)?;

        // Everything that can be rejected without pixels is rejected up front
        spec.validate()?;

        let mut timings = StageTimings::default();
        let started = Instant::now();
        let (decoded, cache_hit) = self.decode(source, spec).in_stage(Stage::Decode)?;
        timings.record(Stage::Decode, started.elapsed());

        let input_format = decoded.format;
        let input_dimensions = (decoded.buffer.width(), decoded.buffer.height());
        let mut buffer = decoded.buffer;

        for operation in &spec.operations {
            let stage = operation.stage();
            check_cancelled(cancel, stage)?;
            let started = Instant::now();
            buffer = self.apply(&buffer, operation).in_stage(stage)?;
            timings.record(stage, started.elapsed());
            debug!(
                "Applied {} -> {}x{}",
                operation,
                buffer.width(),
                buffer.height()
            );
        }

        check_cancelled(cancel, Stage::Encode)?;
        let started = Instant::now();
        let bytes = encode::encode(&buffer, spec.format, &spec.encode).in_stage(Stage::Encode)?;
        timings.record(Stage::Encode, started.elapsed());

        if let RunMode::File(path) = mode {
            check_cancelled(cancel, Stage::Sink)?;
            let started = Instant::now();
            write_output(path, &bytes).in_stage(Stage::Sink)?;
            timings.record(Stage::Sink, started.elapsed());
        }

        debug!(
            "Run complete: {} {}x{} -> {} {}x{} in {:?}",
            input_format,
            input_dimensions.0,
            input_dimensions.1,
            spec.format,
            buffer.width(),
            buffer.height(),
            timings.total()
        );

        Ok(RunOutput {
            bytes,
            input_format,
            output_format: spec.format,
            input_dimensions,
            output_dimensions: (buffer.width(), buffer.height()),
            timings,
            cache_hit,
        })
    }

    fn decode(&self, source: &Source, spec: &PipelineSpec) -> Result<(Decoded, bool)> {
        if spec.decode.sequential_read {
            return Ok((self.decoder.decode_source(source, true)?, false));
        }

        let loaded = self.decoder.load(source)?;
        let Some(cache) = &self.cache else {
            return Ok((self.decoder.decode_bytes(&loaded)?, false));
        };

        if let Some(decoded) = cache.get(&loaded) {
            return Ok((decoded, true));
        }
        let decoded = self.decoder.decode_bytes(&loaded)?;
        cache.insert(&loaded, &decoded);
        Ok((decoded, false))
    }

    fn apply(&self, buffer: &PixelBuffer, operation: &Operation) -> Result<PixelBuffer> {
        let max_pixels = self.runtime.max_pixels;
        let simd = self.runtime.simd;

        match operation {
            Operation::Resize {
                width,
                height,
                fit,
                position,
                kernel,
                background,
            } => resize::resize(
                buffer,
                &ResizeRequest {
                    width: *width,
                    height: *height,
                    fit: *fit,
                    position: *position,
                    kernel: *kernel,
                    background: *background,
                },
                max_pixels,
            ),
            Operation::Rotate { angle, background } => {
                resize::rotate(buffer, *angle, *background, max_pixels)
            }
            Operation::Extract {
                left,
                top,
                width,
                height,
            } => resize::extract(buffer, *left, *top, *width, *height),
            Operation::Flip => resize::flip(buffer),
            Operation::Flop => resize::flop(buffer),
            Operation::Sharpen { sigma, flat, jagged } => {
                filters::sharpen(buffer, *sigma, *flat, *jagged)
            }
            Operation::Blur { sigma } => filters::blur(buffer, *sigma),
            Operation::Gamma { value } => filters::gamma(buffer, *value, simd),
            Operation::Normalize => filters::normalize(buffer, simd),
            Operation::Greyscale => filters::greyscale(buffer),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn check_cancelled(cancel: Option<&CancelFlag>, stage: Stage) -> Result<()> {
    match cancel {
        Some(flag) if flag.is_cancelled() => Err(FastPipeError::Cancelled { stage }),
        _ => Ok(()),
    }
}

/// Write through a temporary sibling so a failed write leaves no partial file
fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".partial");
    let temp_path = path.with_file_name(temp_name);

    let written = fs::write(&temp_path, bytes).and_then(|_| fs::rename(&temp_path, path));
    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written?;

    debug!("Wrote {} bytes to {:?}", bytes.len(), path);
    Ok(())
}
