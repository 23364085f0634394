//! Image format detection and handling

use std::path::Path;

use crate::config::ImageFormat;
use crate::error::{FastPipeError, Result};

/// Detect image format from file extension
pub fn detect_format_from_path<P: AsRef<Path>>(path: P) -> Result<ImageFormat> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| FastPipeError::unsupported_format("Unknown", Some(path.to_path_buf())))?;

    extension
        .parse::<ImageFormat>()
        .map_err(|_| FastPipeError::unsupported_format(extension, Some(path.to_path_buf())))
}

/// Detect image format from the leading magic bytes
pub fn sniff(data: &[u8]) -> Result<ImageFormat> {
    let kind = infer::get(data).ok_or_else(|| {
        FastPipeError::unsupported_format("Unknown (magic bytes)", None)
    })?;

    match kind.mime_type() {
        "image/jpeg" => Ok(ImageFormat::Jpeg),
        "image/png" => Ok(ImageFormat::Png),
        "image/webp" => Ok(ImageFormat::WebP),
        "image/gif" => Ok(ImageFormat::Gif),
        "image/tiff" => Ok(ImageFormat::Tiff),
        "image/bmp" => Ok(ImageFormat::Bmp),
        other => Err(FastPipeError::unsupported_format(other, None)),
    }
}

/// Sniff and require a format the pipeline can decode
pub fn sniff_decodable(data: &[u8]) -> Result<ImageFormat> {
    let format = sniff(data)?;
    if format.can_decode() {
        Ok(format)
    } else {
        Err(FastPipeError::unsupported_format(format.to_string(), None))
    }
}

/// Convert our ImageFormat to image crate format
impl From<ImageFormat> for image::ImageFormat {
    fn from(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::WebP => image::ImageFormat::WebP,
            ImageFormat::Gif => image::ImageFormat::Gif,
            ImageFormat::Tiff => image::ImageFormat::Tiff,
            ImageFormat::Bmp => image::ImageFormat::Bmp,
        }
    }
}

/// Get supported input file extensions
pub fn supported_input_formats() -> &'static [&'static str] {
    &["jpg", "jpeg", "png", "webp", "gif", "tiff", "tif"]
}

/// Get supported output file extensions
pub fn supported_output_formats() -> &'static [&'static str] {
    &["jpg", "jpeg", "png", "webp"]
}

/// Check if a file extension is supported for input
pub fn is_supported_input_format(extension: &str) -> bool {
    supported_input_formats()
        .iter()
        .any(|&fmt| fmt.eq_ignore_ascii_case(extension))
}

/// Check if a file extension is supported for output
pub fn is_supported_output_format(extension: &str) -> bool {
    supported_output_formats()
        .iter()
        .any(|&fmt| fmt.eq_ignore_ascii_case(extension))
}
