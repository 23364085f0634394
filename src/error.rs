//! Error types and handling for FastPipe

use std::fmt;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ImageFormat;

/// Result type alias for FastPipe operations
pub type Result<T> = std::result::Result<T, FastPipeError>;

/// Pipeline stage an error or a timing belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Decode,
    Geometric,
    Filter,
    Encode,
    Sink,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Decode => "decode",
            Self::Geometric => "geometric",
            Self::Filter => "filter",
            Self::Encode => "encode",
            Self::Sink => "sink",
        };
        f.write_str(name)
    }
}

/// Coarse classification of a failure, independent of the stage tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    UnsupportedOption,
    ResourceLimit,
    Encode,
    InvalidParameters,
    Config,
    Io,
    Cancelled,
    System,
}

/// Main error type for FastPipe operations
#[derive(Debug, Error)]
pub enum FastPipeError {
    /// I/O related errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Input bytes could not be decoded
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Magic bytes do not match any decodable format
    #[error("Unsupported image format: {format} (file: {file:?})")]
    UnsupportedFormat {
        format: String,
        file: Option<PathBuf>,
    },

    /// An encode option was set for a format that does not support it
    #[error("Option '{option}' is not supported for {format} output")]
    UnsupportedOption {
        format: ImageFormat,
        option: &'static str,
    },

    /// Image dimensions exceed the configured pixel ceiling
    #[error("Image too large: {width}x{height} pixels (limit: {limit} pixels)")]
    ResourceLimit {
        width: u32,
        height: u32,
        limit: u64,
    },

    /// The encoder rejected the buffer
    #[error("Encode error ({format}): {message}")]
    Encode {
        format: ImageFormat,
        message: String,
    },

    /// Invalid operation or option parameters
    #[error("Invalid parameters: {message}")]
    InvalidParameters { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Run aborted through its cancel flag
    #[error("Run cancelled before {stage} stage")]
    Cancelled { stage: Stage },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    SerdeError(String),

    /// System resource errors
    #[error("System resource error: {message}")]
    SystemError { message: String },

    /// Failure tagged with the stage it originated in
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<FastPipeError>,
    },
}

impl FastPipeError {
    /// Create a new decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a new unsupported format error
    pub fn unsupported_format<S: Into<String>>(format: S, file: Option<PathBuf>) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
            file,
        }
    }

    /// Create a new unsupported option error
    pub fn unsupported_option(format: ImageFormat, option: &'static str) -> Self {
        Self::UnsupportedOption { format, option }
    }

    /// Create a new resource limit error
    pub fn resource_limit(width: u32, height: u32, limit: u64) -> Self {
        Self::ResourceLimit {
            width,
            height,
            limit,
        }
    }

    /// Create a new encode error
    pub fn encode<S: Into<String>>(format: ImageFormat, message: S) -> Self {
        Self::Encode {
            format,
            message: message.into(),
        }
    }

    /// Create a new invalid parameters error
    pub fn invalid_parameters<S: Into<String>>(message: S) -> Self {
        Self::InvalidParameters {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a new system error
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::SystemError {
            message: message.into(),
        }
    }

    /// Wrap this error with the stage it came from. Already tagged errors keep
    /// their original stage.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            tagged @ Self::Stage { .. } => tagged,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Stage the error was tagged with, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            Self::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }

    /// The underlying error with any stage tag removed
    pub fn root(&self) -> &FastPipeError {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Self::Decode { .. } | Self::UnsupportedFormat { .. } => ErrorKind::Decode,
            Self::UnsupportedOption { .. } => ErrorKind::UnsupportedOption,
            Self::ResourceLimit { .. } => ErrorKind::ResourceLimit,
            Self::Encode { .. } => ErrorKind::Encode,
            Self::InvalidParameters { .. } => ErrorKind::InvalidParameters,
            Self::ConfigError { .. } | Self::SerdeError(_) => ErrorKind::Config,
            Self::IoError(_) => ErrorKind::Io,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::SystemError { .. } | Self::Stage { .. } => ErrorKind::System,
        }
    }

    /// Check if this error is recoverable (a batch can continue with other inputs)
    pub fn is_recoverable(&self) -> bool {
        match self.kind() {
            // These errors affect individual inputs
            ErrorKind::Decode
            | ErrorKind::ResourceLimit
            | ErrorKind::Encode
            | ErrorKind::Io => true,

            // Every other input in the batch would fail the same way
            ErrorKind::UnsupportedOption
            | ErrorKind::InvalidParameters
            | ErrorKind::Config
            | ErrorKind::Cancelled
            | ErrorKind::System => false,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        let stage = self.stage();
        let message = match self.root() {
            Self::IoError(e) => format!("File system error: {}", e),
            Self::Decode { message } => format!("Could not decode input image: {}", message),
            Self::UnsupportedFormat { format, .. } => {
                format!(
                    "Unsupported image format: {}. Supported inputs: JPEG, PNG, WebP, GIF, TIFF",
                    format
                )
            }
            Self::UnsupportedOption { format, option } => {
                format!("The '{}' option cannot be used with {} output", option, format)
            }
            Self::ResourceLimit { width, height, limit } => {
                format!(
                    "Image is too large ({}x{} = {} pixels). Maximum supported: {} pixels",
                    width, height, (*width as u64) * (*height as u64), limit
                )
            }
            Self::Cancelled { .. } => "Processing was cancelled".to_string(),
            other => other.to_string(),
        };

        match stage {
            Some(stage) if !matches!(self.root(), Self::Cancelled { .. }) => {
                format!("[{}] {}", stage, message)
            }
            _ => message,
        }
    }
}

impl From<image::ImageError> for FastPipeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Limits(e) => Self::decode(format!("decoder limits exceeded: {}", e)),
            // Running out of input mid-image means the data is cut short
            image::ImageError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Self::decode(format!("input is truncated: {}", e))
            }
            image::ImageError::IoError(e) => Self::IoError(e),
            image::ImageError::Unsupported(e) => Self::unsupported_format(e.to_string(), None),
            other => Self::decode(other.to_string()),
        }
    }
}

// Convert serde errors to our error type
impl From<toml::de::Error> for FastPipeError {
    fn from(err: toml::de::Error) -> Self {
        Self::SerdeError(format!("TOML parsing error: {}", err))
    }
}

impl From<serde_yaml::Error> for FastPipeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::SerdeError(format!("YAML parsing error: {}", err))
    }
}

/// Error context extension for tagging results with a stage
pub trait StageContext<T> {
    /// Tag the error, if any, with the stage it originated in
    fn in_stage(self, stage: Stage) -> Result<T>;
}

impl<T, E> StageContext<T> for std::result::Result<T, E>
where
    E: Into<FastPipeError>,
{
    fn in_stage(self, stage: Stage) -> Result<T> {
        self.map_err(|e| e.into().in_stage(stage))
    }
}
