//! Encoding a [`PixelBuffer`] to JPEG, PNG or WebP bytes

use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ColorType, ImageEncoder};
use jpeg_encoder::SamplingFactor;
use tracing::debug;

use crate::config::{ChromaSubsampling, EncodeOptions, ImageFormat};
use crate::error::{FastPipeError, Result};
use crate::processing::buffer::{Channels, PixelBuffer};

/// Largest dimension a baseline JPEG can carry
const JPEG_MAX_DIMENSION: u32 = u16::MAX as u32;

/// Encode `buffer` as `format`. Options are checked against the format first.
pub fn encode(
    buffer: &PixelBuffer,
    format: ImageFormat,
    options: &EncodeOptions,
) -> Result<Vec<u8>> {
    options.validate_for(format)?;

    let bytes = match format {
        ImageFormat::Jpeg => encode_jpeg(buffer, options),
        ImageFormat::Png => encode_png(buffer, options),
        ImageFormat::WebP => encode_webp(buffer),
        other => Err(FastPipeError::encode(other, format!("{} output is not supported", other))),
    }?;

    debug!(
        "Encoded {}x{} {:?} as {} ({} bytes)",
        buffer.width(),
        buffer.height(),
        buffer.channels(),
        format,
        bytes.len()
    );
    Ok(bytes)
}

impl From<ChromaSubsampling> for SamplingFactor {
    fn from(subsampling: ChromaSubsampling) -> Self {
        match subsampling {
            ChromaSubsampling::Yuv420 => SamplingFactor::R_4_2_0,
            ChromaSubsampling::Yuv422 => SamplingFactor::R_4_2_2,
            ChromaSubsampling::Yuv444 => SamplingFactor::R_4_4_4,
        }
    }
}

fn encode_jpeg(buffer: &PixelBuffer, options: &EncodeOptions) -> Result<Vec<u8>> {
    let (width, height) = (buffer.width(), buffer.height());
    if width > JPEG_MAX_DIMENSION || height > JPEG_MAX_DIMENSION {
        return Err(FastPipeError::encode(
            ImageFormat::Jpeg,
            format!(
                "{}x{} exceeds the JPEG limit of {} pixels per side",
                width, height, JPEG_MAX_DIMENSION
            ),
        ));
    }

    // JPEG has no alpha; drop it
    let (data, color) = match buffer.channels() {
        Channels::Luma => (buffer.as_bytes().to_vec(), jpeg_encoder::ColorType::Luma),
        Channels::LumaAlpha => (
            buffer.as_bytes().chunks_exact(2).map(|p| p[0]).collect(),
            jpeg_encoder::ColorType::Luma,
        ),
        Channels::Rgb => (buffer.as_bytes().to_vec(), jpeg_encoder::ColorType::Rgb),
        Channels::Rgba => (
            buffer
                .as_bytes()
                .chunks_exact(4)
                .flat_map(|p| [p[0], p[1], p[2]])
                .collect(),
            jpeg_encoder::ColorType::Rgb,
        ),
    };

    let quality = options.quality.unwrap_or(EncodeOptions::DEFAULT_QUALITY);
    let mut out = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut out, quality);
    encoder.set_progressive(options.progressive.unwrap_or(false));
    encoder.set_sampling_factor(options.chroma_subsampling.unwrap_or_default().into());

    encoder
        .encode(&data, width as u16, height as u16, color)
        .map_err(|e| FastPipeError::encode(ImageFormat::Jpeg, e.to_string()))?;

    Ok(out)
}

fn image_color(channels: Channels) -> ColorType {
    match channels {
        Channels::Luma => ColorType::L8,
        Channels::LumaAlpha => ColorType::La8,
        Channels::Rgb => ColorType::Rgb8,
        Channels::Rgba => ColorType::Rgba8,
    }
}

/// Map a zlib level onto the encoder's compression presets
pub fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

fn encode_png(buffer: &PixelBuffer, options: &EncodeOptions) -> Result<Vec<u8>> {
    let compression = png_compression(
        options
            .compression_level
            .unwrap_or(EncodeOptions::DEFAULT_COMPRESSION_LEVEL),
    );
    let filter = if options.adaptive_filtering.unwrap_or(false) {
        FilterType::Adaptive
    } else {
        FilterType::NoFilter
    };

    let mut out = Vec::new();
    PngEncoder::new_with_quality(&mut out, compression, filter)
        .write_image(
            buffer.as_bytes(),
            buffer.width(),
            buffer.height(),
            image_color(buffer.channels()),
        )
        .map_err(|e| FastPipeError::encode(ImageFormat::Png, e.to_string()))?;

    Ok(out)
}

fn encode_webp(buffer: &PixelBuffer) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    // The lossless encoder takes RGB(A) and L(A) alike
    WebPEncoder::new_lossless(&mut out)
        .encode(
            buffer.as_bytes(),
            buffer.width(),
            buffer.height(),
            image_color(buffer.channels()),
        )
        .map_err(|e| FastPipeError::encode(ImageFormat::WebP, e.to_string()))?;

    Ok(out)
}
