//! Input validation: format sniffing and header probing ahead of any pixel allocation

use std::io::Cursor;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::config::{self, ImageFormat};
use crate::error::{FastPipeError, Result};
use crate::processing::formats::{
    detect_format_from_path, is_supported_input_format, sniff_decodable,
};

/// What a header probe learned about an encoded input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl InputInfo {
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Validator for encoded inputs, enforcing the pixel ceiling from the header alone
#[derive(Debug, Clone)]
pub struct InputValidator {
    max_pixels: u64,
}

impl InputValidator {
    /// Create a validator using the process-wide pixel ceiling
    pub fn new() -> Self {
        Self::with_limit(config::runtime().max_pixels)
    }

    /// Create a validator with a custom pixel ceiling
    pub fn with_limit(max_pixels: u64) -> Self {
        Self { max_pixels }
    }

    pub fn max_pixels(&self) -> u64 {
        self.max_pixels
    }

    /// Sniff the format and read the dimensions from the header. Fails with
    /// `ResourceLimit` before any pixel buffer exists when the ceiling is exceeded.
    pub fn probe(&self, data: &[u8]) -> Result<InputInfo> {
        if data.is_empty() {
            return Err(FastPipeError::decode("Input is empty"));
        }

        let format = sniff_decodable(data)?;

        let mut reader = image::io::Reader::with_format(Cursor::new(data), format.into());
        reader.no_limits();
        let (width, height) = reader.into_dimensions()?;

        self.validate_dimensions(width, height)?;

        let info = InputInfo { format, width, height };
        debug!("Probed input: {:?}", info);
        Ok(info)
    }

    /// Check decoded or requested dimensions against the ceiling
    pub fn validate_dimensions(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(FastPipeError::decode(format!(
                "Image has zero width or height ({}x{})",
                width, height
            )));
        }

        let total_pixels = width as u64 * height as u64;
        if total_pixels > self.max_pixels {
            return Err(FastPipeError::resource_limit(width, height, self.max_pixels));
        }

        Ok(())
    }

    /// Validate a file on disk: it must exist, be non-empty, and carry
    /// a decodable header within the ceiling
    pub async fn validate_file<P: AsRef<Path>>(&self, path: P) -> Result<InputInfo> {
        let path = path.as_ref();
        debug!("Validating file: {:?}", path);

        let metadata = fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(FastPipeError::invalid_parameters(format!(
                "Path is not a regular file: {:?}",
                path
            )));
        }
        if metadata.len() == 0 {
            return Err(FastPipeError::decode(format!("File is empty: {:?}", path)));
        }

        let data = fs::read(path).await?;
        let info = self.probe(&data).map_err(|e| match e {
            FastPipeError::UnsupportedFormat { format, .. } => {
                FastPipeError::unsupported_format(format, Some(path.to_path_buf()))
            }
            other => other,
        })?;

        if let Ok(extension_format) = detect_format_from_path(path) {
            if extension_format != info.format {
                warn!(
                    "Format mismatch for {:?}: header indicates {}, extension indicates {}",
                    path, info.format, extension_format
                );
            }
        }

        Ok(info)
    }

    /// Check if a path is likely processable based on its extension and size
    pub async fn quick_check<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();

        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(is_supported_input_format)
            .unwrap_or(false);
        if !supported {
            return false;
        }

        matches!(fs::metadata(path).await, Ok(metadata) if metadata.is_file() && metadata.len() > 0)
    }
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep only the paths that pass [`InputValidator::quick_check`], preserving order
pub async fn quick_filter(validator: &InputValidator, paths: Vec<PathBuf>) -> Vec<PathBuf> {
    use futures::future::join_all;

    let checks = paths.into_iter().map(|path| async move {
        let keep = validator.quick_check(&path).await;
        (path, keep)
    });

    join_all(checks)
        .await
        .into_iter()
        .filter_map(|(path, keep)| keep.then_some(path))
        .collect()
}
