//! Filter stage: pure per-image transforms that never touch the alpha channel

use rayon::prelude::*;
use tracing::debug;

use crate::config::{DEFAULT_GAMMA, DEFAULT_SHARPEN_FLAT, DEFAULT_SHARPEN_JAGGED};
use crate::error::{FastPipeError, Result};
use crate::processing::buffer::{luma, Channels, PixelBuffer};

/// Mild sharpen kernel, divided by [`SHARPEN_DIVISOR`]
const SHARPEN_KERNEL: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 32.0, -1.0, -1.0, -1.0, -1.0];
const SHARPEN_DIVISOR: f32 = 24.0;

/// Mild blur kernel, divided by [`BLUR_DIVISOR`]
const BLUR_KERNEL: [f32; 9] = [1.0; 9];
const BLUR_DIVISOR: f32 = 9.0;

/// Differences at or below this are treated as flat by the unsharp mask
const FLAT_THRESHOLD: f32 = 2.0;

/// Samples processed per iteration on the lane path
const LANES: usize = 8;

/// Lookup table mapping every 8-bit sample to its output
pub type Lut = [u8; 256];

/// Apply `lut` to every colour sample. The lane path handles layouts without
/// alpha eight samples at a time; both paths produce identical bytes.
pub fn apply_lut(buffer: &PixelBuffer, lut: &Lut, simd: bool) -> Result<PixelBuffer> {
    let channels = buffer.channels();
    let mut data = buffer.as_bytes().to_vec();

    if channels.has_alpha() {
        let colour = channels.colour_count();
        for pixel in data.chunks_exact_mut(channels.count()) {
            for sample in &mut pixel[..colour] {
                *sample = lut[*sample as usize];
            }
        }
    } else if simd {
        let mut lanes = data.chunks_exact_mut(LANES);
        for lane in &mut lanes {
            let lane: &mut [u8; LANES] = lane.try_into().map_err(|_| {
                FastPipeError::system("lane chunk has the wrong length")
            })?;
            *lane = lane.map(|v| lut[v as usize]);
        }
        for sample in lanes.into_remainder() {
            *sample = lut[*sample as usize];
        }
    } else {
        for sample in data.iter_mut() {
            *sample = lut[*sample as usize];
        }
    }

    PixelBuffer::from_raw(buffer.width(), buffer.height(), channels, data)
}

/// Table for `out = 255 * (in / 255) ^ (1 / gamma)`
pub fn gamma_lut(gamma: f32) -> Lut {
    let exponent = 1.0 / gamma as f64;
    let mut lut = [0u8; 256];
    for (i, v) in lut.iter_mut().enumerate() {
        *v = (255.0 * (i as f64 / 255.0).powf(exponent)).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Gamma encoding through a lookup table
pub fn gamma(buffer: &PixelBuffer, value: Option<f32>, simd: bool) -> Result<PixelBuffer> {
    let value = value.unwrap_or(DEFAULT_GAMMA);
    if !(1.0..=3.0).contains(&value) {
        return Err(FastPipeError::invalid_parameters(format!(
            "gamma must be between 1 and 3, got {}",
            value
        )));
    }
    apply_lut(buffer, &gamma_lut(value), simd)
}

/// Luminance value at the given percentile (0..=100)
fn percentile(histogram: &[u64; 256], total: u64, pct: u64) -> u8 {
    let target = (total * pct).div_ceil(100).max(1);
    let mut cumulative = 0u64;
    for (value, count) in histogram.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return value as u8;
        }
    }
    255
}

/// Stretch colour channels so the 1st..99th luminance percentiles span 0..255.
/// A flat image is returned unchanged.
pub fn normalize(buffer: &PixelBuffer, simd: bool) -> Result<PixelBuffer> {
    let mut histogram = [0u64; 256];
    for y in 0..buffer.height() {
        for x in 0..buffer.width() {
            histogram[buffer.luma_at(x, y) as usize] += 1;
        }
    }

    let total = buffer.pixel_count();
    let low = percentile(&histogram, total, 1);
    let high = percentile(&histogram, total, 99);
    debug!("Normalize: luminance percentiles {}..{}", low, high);

    if high <= low {
        return Ok(buffer.clone());
    }

    let range = (high - low) as f32;
    let mut lut = [0u8; 256];
    for (i, v) in lut.iter_mut().enumerate() {
        *v = ((i as f32 - low as f32) * 255.0 / range).round().clamp(0.0, 255.0) as u8;
    }
    apply_lut(buffer, &lut, simd)
}

/// Rec.709 luma; RGB becomes `Luma`, RGBA becomes `LumaAlpha`
pub fn greyscale(buffer: &PixelBuffer) -> Result<PixelBuffer> {
    let (channels, data) = match buffer.channels() {
        Channels::Luma | Channels::LumaAlpha => return Ok(buffer.clone()),
        Channels::Rgb => (
            Channels::Luma,
            buffer
                .as_bytes()
                .chunks_exact(3)
                .map(|p| luma(p[0], p[1], p[2]))
                .collect(),
        ),
        Channels::Rgba => (
            Channels::LumaAlpha,
            buffer
                .as_bytes()
                .chunks_exact(4)
                .flat_map(|p| [luma(p[0], p[1], p[2]), p[3]])
                .collect(),
        ),
    };
    PixelBuffer::from_raw(buffer.width(), buffer.height(), channels, data)
}

/// 3x3 convolution of the colour channels with clamped edges
pub fn convolve3x3(buffer: &PixelBuffer, kernel: &[f32; 9], divisor: f32) -> Result<PixelBuffer> {
    let (width, height) = (buffer.width() as i64, buffer.height() as i64);
    let channels = buffer.channels();
    let count = channels.count();
    let colour = channels.colour_count();
    let stride = buffer.stride();
    let src = buffer.as_bytes();
    let mut data = src.to_vec();

    data.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        let y = y as i64;
        for x in 0..width {
            for c in 0..colour {
                let mut acc = 0f32;
                for ky in -1..=1i64 {
                    let sy = (y + ky).clamp(0, height - 1) as usize;
                    for kx in -1..=1i64 {
                        let sx = (x + kx).clamp(0, width - 1) as usize;
                        let weight = kernel[((ky + 1) * 3 + kx + 1) as usize];
                        acc += weight * src[sy * stride + sx * count + c] as f32;
                    }
                }
                row[x as usize * count + c] = (acc / divisor).round().clamp(0.0, 255.0) as u8;
            }
        }
    });

    PixelBuffer::from_raw(buffer.width(), buffer.height(), channels, data)
}

/// Normalised gaussian weights over a radius of `ceil(3 * sigma)`
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as i64;
    let denom = 2.0 * sigma * sigma;
    let mut weights: Vec<f32> = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / denom).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    for w in weights.iter_mut() {
        *w /= sum;
    }
    weights
}

/// Separable gaussian blur of the colour channels with clamped edges;
/// alpha is carried over untouched
fn gaussian(buffer: &PixelBuffer, sigma: f32) -> Result<PixelBuffer> {
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as i64;
    let (width, height) = (buffer.width() as i64, buffer.height() as i64);
    let channels = buffer.channels();
    let (count, colour) = (channels.count(), channels.colour_count());
    let stride = buffer.stride();
    let src = buffer.as_bytes();

    let mut horizontal = vec![0f32; src.len()];
    horizontal.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        let line = &src[y * stride..(y + 1) * stride];
        for x in 0..width {
            for c in 0..colour {
                let mut acc = 0f32;
                for (k, weight) in kernel.iter().enumerate() {
                    let sx = (x + k as i64 - radius).clamp(0, width - 1) as usize;
                    acc += weight * line[sx * count + c] as f32;
                }
                row[x as usize * count + c] = acc;
            }
        }
    });

    let mut data = src.to_vec();
    data.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        let y = y as i64;
        for x in 0..width as usize {
            for c in 0..colour {
                let mut acc = 0f32;
                for (k, weight) in kernel.iter().enumerate() {
                    let sy = (y + k as i64 - radius).clamp(0, height - 1) as usize;
                    acc += weight * horizontal[sy * stride + x * count + c];
                }
                row[x * count + c] = acc.round().clamp(0.0, 255.0) as u8;
            }
        }
    });

    PixelBuffer::from_raw(buffer.width(), buffer.height(), channels, data)
}

/// Mild 3x3 sharpen, or an unsharp mask when `sigma` is given
pub fn sharpen(
    buffer: &PixelBuffer,
    sigma: Option<f32>,
    flat: Option<f32>,
    jagged: Option<f32>,
) -> Result<PixelBuffer> {
    let Some(sigma) = sigma else {
        return convolve3x3(buffer, &SHARPEN_KERNEL, SHARPEN_DIVISOR);
    };

    let flat = flat.unwrap_or(DEFAULT_SHARPEN_FLAT);
    let jagged = jagged.unwrap_or(DEFAULT_SHARPEN_JAGGED);
    debug!("Unsharp mask: sigma={}, flat={}, jagged={}", sigma, flat, jagged);

    let blurred = gaussian(buffer, sigma)?;
    let channels = buffer.channels();
    let (count, colour) = (channels.count(), channels.colour_count());

    let data = buffer
        .as_bytes()
        .iter()
        .zip(blurred.as_bytes())
        .enumerate()
        .map(|(i, (&x, &b))| {
            if i % count >= colour {
                return x;
            }
            let d = x as f32 - b as f32;
            let gain = if d.abs() <= FLAT_THRESHOLD { flat } else { jagged };
            (x as f32 + gain * d).round().clamp(0.0, 255.0) as u8
        })
        .collect();

    PixelBuffer::from_raw(buffer.width(), buffer.height(), channels, data)
}

/// Mild 3x3 box blur, or a gaussian blur when `sigma` is given
pub fn blur(buffer: &PixelBuffer, sigma: Option<f32>) -> Result<PixelBuffer> {
    match sigma {
        Some(sigma) => gaussian(buffer, sigma),
        None => convolve3x3(buffer, &BLUR_KERNEL, BLUR_DIVISOR),
    }
}
