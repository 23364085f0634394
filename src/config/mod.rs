//! Configuration management for FastPipe

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, FastPipeError};

pub mod operations;
pub mod profiles;
pub use operations::*;
pub use profiles::*;

/// Default pixel ceiling (16383 x 16383)
pub const DEFAULT_MAX_PIXELS: u64 = 0x3FFF * 0x3FFF;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named pipelines
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,

    /// Process-wide runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profiles: Profiles::all(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Process-wide runtime settings, read-only once the first run starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum concurrent pipeline runs (None = auto-detect)
    pub concurrency: Option<usize>,

    /// Cache decoded inputs
    pub cache: bool,

    /// Maximum number of cached decoded inputs
    pub cache_items: usize,

    /// Maximum bytes held by the decode cache
    pub cache_memory: u64,

    /// Use the lane-chunked per-sample filter paths
    pub simd: bool,

    /// Maximum image size (width * height) accepted at decode or produced by
    /// a geometric stage
    pub max_pixels: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: None, // Auto-detect
            cache: true,
            cache_items: 100,
            cache_memory: 50 * 1024 * 1024, // 50MB
            simd: true,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

impl RuntimeConfig {
    /// Concurrency limit with auto-detection applied
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            // Use number of logical CPUs, but cap at 16 to avoid excessive memory usage
            num_cpus::get().min(16)
        })
    }

    /// Validate runtime settings
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(FastPipeError::config("Concurrency must be greater than 0"));
        }
        if self.max_pixels == 0 {
            return Err(FastPipeError::config("Pixel ceiling must be greater than 0"));
        }
        if self.cache && self.cache_items == 0 {
            return Err(FastPipeError::config(
                "Cache item limit must be greater than 0 when caching is enabled",
            ));
        }
        Ok(())
    }
}

static RUNTIME: OnceCell<RuntimeConfig> = OnceCell::new();

/// Fix the process-wide runtime settings. Fails once settings have been set
/// or already read by a run.
pub fn configure(runtime: RuntimeConfig) -> Result<()> {
    runtime.validate()?;
    RUNTIME.set(runtime).map_err(|_| {
        FastPipeError::config("Runtime settings are already fixed; configure before the first run")
    })?;
    debug!("Runtime settings configured: {:?}", RUNTIME.get());
    Ok(())
}

/// Current process-wide runtime settings (defaults if never configured)
pub fn runtime() -> &'static RuntimeConfig {
    RUNTIME.get_or_init(RuntimeConfig::default)
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Image formats known to the pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    WebP,
    Gif,
    Tiff,
    Bmp,
}

impl ImageFormat {
    /// Get file extension for this format
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Gif => "gif",
            Self::Tiff => "tiff",
            Self::Bmp => "bmp",
        }
    }

    /// Get MIME type for this format
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
            Self::Gif => "image/gif",
            Self::Tiff => "image/tiff",
            Self::Bmp => "image/bmp",
        }
    }

    /// Whether the decoder can read this format
    pub fn can_decode(self) -> bool {
        !matches!(self, Self::Bmp)
    }

    /// Whether the encoder can write this format
    pub fn can_encode(self) -> bool {
        matches!(self, Self::Jpeg | Self::Png | Self::WebP)
    }

    /// Whether the pixels survive an encode/decode round trip unchanged
    pub fn is_lossless(self) -> bool {
        matches!(self, Self::Png | Self::WebP)
    }

    /// Whether an encode option applies to this format
    pub fn supports_option(self, option: &str) -> bool {
        match self {
            Self::Jpeg => matches!(option, "quality" | "progressive" | "chroma_subsampling"),
            Self::Png => matches!(option, "adaptive_filtering" | "compression_level"),
            _ => false,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Jpeg => "JPEG",
            Self::Png => "PNG",
            Self::WebP => "WebP",
            Self::Gif => "GIF",
            Self::Tiff => "TIFF",
            Self::Bmp => "BMP",
        })
    }
}

impl FromStr for ImageFormat {
    type Err = FastPipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::WebP),
            "gif" => Ok(Self::Gif),
            "tif" | "tiff" => Ok(Self::Tiff),
            "bmp" => Ok(Self::Bmp),
            other => Err(FastPipeError::unsupported_format(other.to_string(), None)),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| FastPipeError::config(
                format!("Failed to read config file {:?}: {}", path.as_ref(), e)
            ))?;

        match config_extension(path.as_ref()).as_str() {
            "toml" => toml::from_str(&content).map_err(Into::into),
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(Into::into),
            _ => Err(FastPipeError::config(
                "Unsupported config file format. Use .toml or .yaml"
            )),
        }
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = match config_extension(path.as_ref()).as_str() {
            "toml" => toml::to_string_pretty(self)
                .map_err(|e| FastPipeError::config(format!("TOML serialization failed: {}", e)))?,
            "yaml" | "yml" => serde_yaml::to_string(self)
                .map_err(|e| FastPipeError::config(format!("YAML serialization failed: {}", e)))?,
            _ => return Err(FastPipeError::config(
                "Unsupported config file format. Use .toml or .yaml"
            )),
        };

        std::fs::write(&path, content)
            .map_err(|e| FastPipeError::config(
                format!("Failed to write config file {:?}: {}", path.as_ref(), e)
            ))?;

        Ok(())
    }

    /// Get a profile by name
    pub fn get_profile(&self, name: &str) -> Result<&Profile> {
        self.profiles.get(name)
            .ok_or_else(|| {
                let mut available: Vec<_> = self.profiles.keys().collect();
                available.sort();
                FastPipeError::config(format!(
                    "Profile '{}' not found. Available profiles: {:?}",
                    name, available
                ))
            })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, profile) in &self.profiles {
            profile.validate()
                .map_err(|e| FastPipeError::config(
                    format!("Invalid profile '{}': {}", name, e)
                ))?;
        }

        self.runtime.validate()
    }

    /// Merge with another configuration (other takes precedence)
    pub fn merge(mut self, other: Config) -> Self {
        // Merge profiles (other wins on conflicts)
        self.profiles.extend(other.profiles);

        if other.runtime != RuntimeConfig::default() {
            self.runtime = other.runtime;
        }
        self.logging = other.logging;

        self
    }
}

fn config_extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Default location of a user config file, if one exists
pub fn default_config_path() -> Option<PathBuf> {
    ["fastpipe.toml", "fastpipe.yaml", "fastpipe.yml"]
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
}
