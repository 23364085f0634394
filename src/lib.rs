//! FastPipe - Deterministic Image Transform Pipeline
//!
//! Decodes an encoded image, applies an ordered list of geometric and filter
//! operations, and re-encodes the result. The same input and pipeline spec
//! always produce the same bytes.
//!
//! # Stages
//!
//! - **Decode**: JPEG, PNG, WebP, GIF, TIFF sniffed from magic bytes, with a
//!   pixel ceiling enforced from the header before any allocation
//! - **Geometric**: resize (cover/contain/fill), rotate, extract, flip, flop
//! - **Filter**: sharpen, blur, gamma, normalize, greyscale
//! - **Encode**: JPEG, PNG, WebP with format specific options
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use fastpipe::{ImageFormat, Operation, Pipeline, PipelineSpec, RunMode};
//!
//! let spec = PipelineSpec::new(ImageFormat::Jpeg)
//!     .resize(640, 392)
//!     .then(Operation::sharpen())
//!     .quality(85);
//!
//! let pipeline = Pipeline::new();
//! let bytes = pipeline.run_file("input.jpg", &spec, RunMode::File("output.jpg".into()))?;
//! println!("Wrote {} bytes", bytes.len());
//! # Ok::<(), fastpipe::FastPipeError>(())
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod parallel;
pub mod processing;

// Re-export commonly used types
pub use config::{Config, ImageFormat, Operation, PipelineSpec, Profile, RuntimeConfig};
pub use error::{ErrorKind, FastPipeError, Result, Stage};
pub use parallel::{BatchJob, ParallelRunner};
pub use processing::{CancelFlag, Pipeline, RunMode, RunOutput};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Set up logging to stderr from `RUST_LOG` and report system capabilities.
/// Safe to call more than once.
pub fn init() -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        info!("FastPipe v{} initialized", VERSION);
    }

    validate_system_requirements(&RuntimeConfig::default())
}

/// Set up logging from the config and fix the runtime settings
pub fn init_with_config(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.logging.level).map_err(|e| {
        FastPipeError::config(format!(
            "Invalid log level '{}': {}",
            config.logging.level, e
        ))
    })?;

    let installed = if config.logging.json_format {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).is_ok()
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).is_ok()
    };
    if installed {
        info!("FastPipe v{} initialized with custom config", VERSION);
    }

    config::configure(config.runtime.clone())?;
    validate_system_requirements(&config.runtime)
}

/// Warn about low memory for `runtime` and log what the host offers
pub fn validate_system_requirements(runtime: &RuntimeConfig) -> Result<()> {
    use sysinfo::{System, SystemExt};

    let mut system = System::new();
    system.refresh_memory();

    const MIN_MEMORY_MB: u64 = 512;
    let available_memory = system.available_memory();
    if available_memory < MIN_MEMORY_MB * 1024 * 1024 {
        warn!(
            "Low available memory: {}MB (recommended: >{}MB)",
            available_memory / (1024 * 1024),
            MIN_MEMORY_MB
        );
    }

    // A ceiling-sized RGBA buffer that does not fit in memory is worth a warning
    let ceiling_bytes = runtime.max_pixels.saturating_mul(4);
    if available_memory > 0 && ceiling_bytes > available_memory {
        warn!(
            "Pixel ceiling of {} pixels may need more memory than available ({}MB)",
            runtime.max_pixels,
            available_memory / (1024 * 1024)
        );
    }

    info!("Detected {} logical CPUs", num_cpus::get());
    info!(
        "Decodable formats: {}",
        processing::formats::supported_input_formats().join(", ")
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_init() {
        // Should not fail on multiple calls
        let _ = init();
        assert!(init().is_ok());
    }

    #[test]
    fn test_system_validation() {
        assert!(validate_system_requirements(&RuntimeConfig::default()).is_ok());
    }
}
