//! Choosing the window a cover resize keeps: fixed gravity or content scoring

use image::GrayImage;
use imageproc::gradients::sobel_gradients;
use rayon::prelude::*;
use tracing::debug;

use crate::config::CropPosition;
use crate::processing::buffer::{Channels, PixelBuffer};

/// Evenly spaced candidate offsets per axis, both ends included
const CANDIDATE_STEPS: u32 = 32;

/// Saliency added to pixels that look like skin
const SKIN_BOOST: u64 = 128;

/// Top-left corner of the `width`x`height` window to keep. The window never
/// leaves the image; if the image is not larger than the window on an axis
/// the offset on that axis is 0.
pub fn window_offset(
    buffer: &PixelBuffer,
    width: u32,
    height: u32,
    position: CropPosition,
) -> (u32, u32) {
    let overflow_x = buffer.width().saturating_sub(width);
    let overflow_y = buffer.height().saturating_sub(height);
    if overflow_x == 0 && overflow_y == 0 {
        return (0, 0);
    }

    let offset = match position.anchor() {
        Some((fx, fy)) => (anchored(overflow_x, fx), anchored(overflow_y, fy)),
        None => {
            let scorer = Scorer::new(buffer, position);
            best_window(&scorer, overflow_x, overflow_y, width, height)
        }
    };

    debug!(
        "Crop window {}x{} at {:?} in {}x{} ({:?})",
        width,
        height,
        offset,
        buffer.width(),
        buffer.height(),
        position
    );
    offset
}

fn anchored(overflow: u32, fraction: f32) -> u32 {
    ((overflow as f32 * fraction).floor() as u32).min(overflow)
}

/// Offsets tried along one axis: at most 33 evenly spaced ones plus the centre
pub fn candidate_offsets(overflow: u32) -> Vec<u32> {
    let mut offsets: Vec<u32> = (0..=CANDIDATE_STEPS)
        .map(|i| (overflow as u64 * i as u64 / CANDIDATE_STEPS as u64) as u32)
        .collect();
    offsets.push(overflow / 2);
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

fn best_window(
    scorer: &Scorer,
    overflow_x: u32,
    overflow_y: u32,
    width: u32,
    height: u32,
) -> (u32, u32) {
    let xs = candidate_offsets(overflow_x);
    let ys = candidate_offsets(overflow_y);
    let candidates: Vec<(u32, u32)> = ys
        .iter()
        .flat_map(|&y| xs.iter().map(move |&x| (x, y)))
        .collect();

    let scores: Vec<f64> = candidates
        .par_iter()
        .map(|&(x, y)| scorer.score(x, y, width, height))
        .collect();

    let (cx, cy) = (overflow_x / 2, overflow_y / 2);
    let distance = |(x, y): (u32, u32)| x.abs_diff(cx) as u64 + y.abs_diff(cy) as u64;

    let mut best = 0;
    for i in 1..candidates.len() {
        let (score, best_score) = (scores[i], scores[best]);
        let better = score > best_score
            || (score == best_score
                && (distance(candidates[i]), candidates[i].1, candidates[i].0)
                    < (distance(candidates[best]), candidates[best].1, candidates[best].0));
        if better {
            best = i;
        }
    }
    candidates[best]
}

/// Per-pixel data needed to score windows for one strategy
enum Scorer {
    /// Luminance plane for histogram entropy
    Entropy { luma: Vec<u8>, stride: usize },
    /// Summed-area table of saliency, `(width + 1) * (height + 1)` entries
    Attention { table: Vec<u64>, stride: usize },
}

impl Scorer {
    fn new(buffer: &PixelBuffer, position: CropPosition) -> Self {
        let luma = luma_plane(buffer);
        match position {
            CropPosition::Attention => {
                let saliency = saliency_map(buffer, luma);
                let (width, height) = (buffer.width() as usize, buffer.height() as usize);
                Self::Attention {
                    table: summed_area(&saliency, width, height),
                    stride: width + 1,
                }
            }
            _ => Self::Entropy {
                luma,
                stride: buffer.width() as usize,
            },
        }
    }

    fn score(&self, left: u32, top: u32, width: u32, height: u32) -> f64 {
        let (left, top) = (left as usize, top as usize);
        let (width, height) = (width as usize, height as usize);
        match self {
            Self::Entropy { luma, stride } => {
                let mut histogram = [0u64; 256];
                for y in top..top + height {
                    let row = &luma[y * stride + left..y * stride + left + width];
                    for &v in row {
                        histogram[v as usize] += 1;
                    }
                }
                entropy(&histogram, (width * height) as f64)
            }
            Self::Attention { table, stride } => {
                let at = |x: usize, y: usize| table[y * stride + x];
                let sum = at(left + width, top + height) + at(left, top)
                    - at(left + width, top)
                    - at(left, top + height);
                sum as f64
            }
        }
    }
}

/// Shannon entropy in bits of a histogram holding `total` samples
pub fn entropy(histogram: &[u64; 256], total: f64) -> f64 {
    histogram
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

fn luma_plane(buffer: &PixelBuffer) -> Vec<u8> {
    let mut plane = Vec::with_capacity(buffer.pixel_count() as usize);
    for y in 0..buffer.height() {
        for x in 0..buffer.width() {
            plane.push(buffer.luma_at(x, y));
        }
    }
    plane
}

/// Edge magnitude plus saturation plus a boost for skin tones
fn saliency_map(buffer: &PixelBuffer, luma: Vec<u8>) -> Vec<u64> {
    let (width, height) = (buffer.width(), buffer.height());
    let edges = match GrayImage::from_raw(width, height, luma) {
        Some(grey) => sobel_gradients(&grey).into_raw(),
        None => vec![0u16; buffer.pixel_count() as usize],
    };

    let colour = matches!(buffer.channels(), Channels::Rgb | Channels::Rgba);
    let mut saliency = Vec::with_capacity(edges.len());
    for y in 0..height {
        for x in 0..width {
            let edge = edges[(y * width + x) as usize] as u64;
            let extra = if colour {
                let p = buffer.pixel(x, y);
                let (r, g, b) = (p[0], p[1], p[2]);
                let saturation = (r.max(g).max(b) - r.min(g).min(b)) as u64;
                let skin = if is_skin(r, g, b) { SKIN_BOOST } else { 0 };
                saturation + skin
            } else {
                0
            };
            saliency.push(edge + extra);
        }
    }
    saliency
}

/// RGB skin classifier for uniform daylight illumination
fn is_skin(r: u8, g: u8, b: u8) -> bool {
    let spread = r.max(g).max(b) - r.min(g).min(b);
    r > 95 && g > 40 && b > 20 && spread > 15 && r.abs_diff(g) > 15 && r > g && r > b
}

fn summed_area(values: &[u64], width: usize, height: usize) -> Vec<u64> {
    let stride = width + 1;
    let mut table = vec![0u64; stride * (height + 1)];
    for y in 0..height {
        let mut row_sum = 0u64;
        for x in 0..width {
            row_sum += values[y * width + x];
            table[(y + 1) * stride + x + 1] = table[y * stride + x + 1] + row_sum;
        }
    }
    table
}
