//! Geometric stage: resampling, fit modes, rotation, region extraction and mirroring

use rayon::prelude::*;
use tracing::debug;

use crate::config::{Background, CropPosition, FitMode, Kernel};
use crate::error::{FastPipeError, Result};
use crate::processing::buffer::{background_for, PixelBuffer};
use crate::processing::crop;

/// Angles closer than this to a multiple of 90 degrees use the exact permutation path
const RIGHT_ANGLE_EPSILON: f32 = 1e-4;

impl Kernel {
    /// Support radius in source pixels at unit scale
    pub fn radius(self) -> f32 {
        match self {
            Kernel::Nearest => 0.5,
            Kernel::Cubic | Kernel::Mitchell => 2.0,
            Kernel::Lanczos2 => 2.0,
            Kernel::Lanczos3 => 3.0,
        }
    }

    /// Kernel weight at distance `x`
    pub fn weight(self, x: f32) -> f32 {
        match self {
            Kernel::Nearest => {
                if (-0.5..0.5).contains(&x) {
                    1.0
                } else {
                    0.0
                }
            }
            Kernel::Cubic => bicubic(x, 0.0, 0.5),
            Kernel::Mitchell => bicubic(x, 1.0 / 3.0, 1.0 / 3.0),
            Kernel::Lanczos2 => lanczos(x, 2.0),
            Kernel::Lanczos3 => lanczos(x, 3.0),
        }
    }
}

/// Mitchell-Netravali family of cubic filters
fn bicubic(x: f32, b: f32, c: f32) -> f32 {
    let x = x.abs();
    if x < 1.0 {
        ((12.0 - 9.0 * b - 6.0 * c) * x * x * x
            + (-18.0 + 12.0 * b + 6.0 * c) * x * x
            + (6.0 - 2.0 * b))
            / 6.0
    } else if x < 2.0 {
        ((-b - 6.0 * c) * x * x * x
            + (6.0 * b + 30.0 * c) * x * x
            + (-12.0 * b - 48.0 * c) * x
            + (8.0 * b + 24.0 * c))
            / 6.0
    } else {
        0.0
    }
}

fn sinc(x: f32) -> f32 {
    if x == 0.0 {
        1.0
    } else {
        let px = std::f32::consts::PI * x;
        px.sin() / px
    }
}

fn lanczos(x: f32, a: f32) -> f32 {
    if x.abs() < a {
        sinc(x) * sinc(x / a)
    } else {
        0.0
    }
}

/// Precomputed contributions of source samples to one output sample
#[derive(Debug, Clone)]
struct Contribution {
    start: usize,
    weights: Vec<f32>,
}

/// Weights for resampling an axis of `src_len` samples to `dst_len`
fn contributions(src_len: u32, dst_len: u32, kernel: Kernel) -> Vec<Contribution> {
    let ratio = src_len as f32 / dst_len as f32;

    if kernel == Kernel::Nearest {
        return (0..dst_len)
            .map(|i| {
                let center = (i as f32 + 0.5) * ratio;
                let start = (center.floor() as usize).min(src_len as usize - 1);
                Contribution { start, weights: vec![1.0] }
            })
            .collect();
    }

    // Downscaling widens the kernel so every source sample contributes
    let filter_scale = ratio.max(1.0);
    let support = kernel.radius() * filter_scale;

    (0..dst_len)
        .map(|i| {
            let center = (i as f32 + 0.5) * ratio;
            let left = ((center - support).floor().max(0.0)) as usize;
            let right = ((center + support).ceil() as usize).min(src_len as usize);

            let mut weights: Vec<f32> = (left..right)
                .map(|j| kernel.weight((j as f32 + 0.5 - center) / filter_scale))
                .collect();

            let sum: f32 = weights.iter().sum();
            if sum.abs() > f32::EPSILON {
                weights.iter_mut().for_each(|w| *w /= sum);
                Contribution { start: left, weights }
            } else {
                let nearest = (center.floor() as usize).min(src_len as usize - 1);
                Contribution { start: nearest, weights: vec![1.0] }
            }
        })
        .collect()
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Separable two-pass resampler with per-output precomputed weights
#[derive(Debug, Clone, Copy)]
pub struct Resampler {
    kernel: Kernel,
}

impl Resampler {
    pub fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }

    /// Resample to exactly `width`x`height`, ignoring aspect ratio
    pub fn resample(&self, buffer: &PixelBuffer, width: u32, height: u32) -> Result<PixelBuffer> {
        if width == buffer.width() && height == buffer.height() {
            return Ok(buffer.clone());
        }

        let channels = buffer.channels();
        let count = channels.count();
        let src_width = buffer.width() as usize;

        // Horizontal pass: src rows -> intermediate rows of `width` samples
        let horizontal = contributions(buffer.width(), width, self.kernel);
        let mid_stride = width as usize * count;
        let mut intermediate = vec![0f32; mid_stride * buffer.height() as usize];
        let src = buffer.as_bytes();

        intermediate
            .par_chunks_mut(mid_stride)
            .enumerate()
            .for_each(|(y, row)| {
                let src_row = &src[y * src_width * count..(y + 1) * src_width * count];
                for (x, contribution) in horizontal.iter().enumerate() {
                    for c in 0..count {
                        let mut acc = 0f32;
                        for (k, w) in contribution.weights.iter().enumerate() {
                            acc += *w * src_row[(contribution.start + k) * count + c] as f32;
                        }
                        row[x * count + c] = acc;
                    }
                }
            });

        // Vertical pass: intermediate columns -> output rows
        let vertical = contributions(buffer.height(), height, self.kernel);
        let mut output = vec![0u8; mid_stride * height as usize];

        output
            .par_chunks_mut(mid_stride)
            .zip(vertical.par_iter())
            .for_each(|(row, contribution)| {
                for (i, out) in row.iter_mut().enumerate() {
                    let mut acc = 0f32;
                    for (k, w) in contribution.weights.iter().enumerate() {
                        acc += *w * intermediate[(contribution.start + k) * mid_stride + i];
                    }
                    *out = clamp_u8(acc);
                }
            });

        PixelBuffer::from_raw(width, height, channels, output)
    }
}

fn check_ceiling(width: u32, height: u32, max_pixels: u64) -> Result<()> {
    if width as u64 * height as u64 > max_pixels {
        return Err(FastPipeError::resource_limit(width, height, max_pixels));
    }
    Ok(())
}

/// Parameters of a resize operation
#[derive(Debug, Clone, Copy)]
pub struct ResizeRequest {
    pub width: u32,
    pub height: u32,
    pub fit: FitMode,
    pub position: CropPosition,
    pub kernel: Kernel,
    pub background: Background,
}

/// Resize to exactly the requested dimensions using the requested fit
pub fn resize(
    buffer: &PixelBuffer,
    request: &ResizeRequest,
    max_pixels: u64,
) -> Result<PixelBuffer> {
    let (width, height) = (request.width, request.height);
    if width == 0 || height == 0 {
        return Err(FastPipeError::invalid_parameters(format!(
            "Resize dimensions must be greater than 0, got {}x{}",
            width, height
        )));
    }
    check_ceiling(width, height, max_pixels)?;

    let (src_w, src_h) = (buffer.width() as f64, buffer.height() as f64);
    let resampler = Resampler::new(request.kernel);

    debug!(
        "Resizing {}x{} -> {}x{} ({:?}, {:?})",
        buffer.width(),
        buffer.height(),
        width,
        height,
        request.fit,
        request.kernel
    );

    match request.fit {
        FitMode::Fill => resampler.resample(buffer, width, height),

        FitMode::Cover => {
            // The window is chosen in source space, so only the kept region
            // is ever resampled
            let scale = (width as f64 / src_w).max(height as f64 / src_h);
            let window_w = ((width as f64 / scale).round() as u32).clamp(1, buffer.width());
            let window_h = ((height as f64 / scale).round() as u32).clamp(1, buffer.height());

            let (left, top) = crop::window_offset(buffer, window_w, window_h, request.position);
            let window = extract(buffer, left, top, window_w, window_h)?;
            resampler.resample(&window, width, height)
        }

        FitMode::Contain => {
            let scale = (width as f64 / src_w).min(height as f64 / src_h);
            let inner_w = ((src_w * scale).round() as u32).clamp(1, width);
            let inner_h = ((src_h * scale).round() as u32).clamp(1, height);

            let inner = resampler.resample(buffer, inner_w, inner_h)?;
            let left = (width - inner_w) / 2;
            let top = (height - inner_h) / 2;
            pad(&inner, width, height, left, top, request.background)
        }
    }
}

/// Place `buffer` on a `width`x`height` canvas filled with `background`
fn pad(
    buffer: &PixelBuffer,
    width: u32,
    height: u32,
    left: u32,
    top: u32,
    background: Background,
) -> Result<PixelBuffer> {
    if buffer.width() == width && buffer.height() == height {
        return Ok(buffer.clone());
    }

    let fill = buffer.background_pixel(background.0);
    let canvas = PixelBuffer::filled(width, height, buffer.channels(), &fill)?;
    let mut data = canvas.into_bytes();

    let count = buffer.channels().count();
    let stride = width as usize * count;
    for y in 0..buffer.height() {
        let start = (top + y) as usize * stride + left as usize * count;
        data[start..start + buffer.stride()].copy_from_slice(buffer.row(y));
    }

    PixelBuffer::from_raw(width, height, buffer.channels(), data)
}

/// Crop the region `left, top, width, height`; it must lie inside the image
pub fn extract(
    buffer: &PixelBuffer,
    left: u32,
    top: u32,
    width: u32,
    height: u32,
) -> Result<PixelBuffer> {
    let fits = width > 0
        && height > 0
        && left as u64 + width as u64 <= buffer.width() as u64
        && top as u64 + height as u64 <= buffer.height() as u64;
    if !fits {
        return Err(FastPipeError::invalid_parameters(format!(
            "Extract region {}x{}+{}+{} is outside the {}x{} image",
            width,
            height,
            left,
            top,
            buffer.width(),
            buffer.height()
        )));
    }

    if left == 0 && top == 0 && width == buffer.width() && height == buffer.height() {
        return Ok(buffer.clone());
    }

    let count = buffer.channels().count();
    let mut data = Vec::with_capacity(width as usize * height as usize * count);
    for y in top..top + height {
        let row = buffer.row(y);
        data.extend_from_slice(&row[left as usize * count..(left + width) as usize * count]);
    }

    PixelBuffer::from_raw(width, height, buffer.channels(), data)
}

/// Mirror vertically (top row becomes bottom row)
pub fn flip(buffer: &PixelBuffer) -> Result<PixelBuffer> {
    PixelBuffer::from_dynamic(buffer.to_dynamic()?.flipv())
}

/// Mirror horizontally (left column becomes right column)
pub fn flop(buffer: &PixelBuffer) -> Result<PixelBuffer> {
    PixelBuffer::from_dynamic(buffer.to_dynamic()?.fliph())
}

/// Bounding box of a `width`x`height` rectangle rotated by `angle` degrees
pub fn rotated_bounds(width: u32, height: u32, angle: f32) -> (u32, u32) {
    let radians = (angle as f64).to_radians();
    let (sin, cos) = (radians.sin().abs(), radians.cos().abs());
    let (w, h) = (width as f64, height as f64);

    // Trim float noise so a near-exact bound does not gain a pixel
    let new_w = (w * cos + h * sin - 1e-6).ceil() as u32;
    let new_h = (w * sin + h * cos - 1e-6).ceil() as u32;
    (new_w.max(1), new_h.max(1))
}

/// Rotate clockwise by `angle` degrees. Multiples of 90 are exact; other
/// angles expand the canvas and fill uncovered pixels with `background`.
pub fn rotate(
    buffer: &PixelBuffer,
    angle: f32,
    background: Background,
    max_pixels: u64,
) -> Result<PixelBuffer> {
    if !angle.is_finite() {
        return Err(FastPipeError::invalid_parameters("Rotation angle must be finite"));
    }

    let normalized = angle.rem_euclid(360.0);
    let quarter = (normalized / 90.0).round();
    if (normalized - quarter * 90.0).abs() < RIGHT_ANGLE_EPSILON {
        let image = buffer.to_dynamic()?;
        let rotated = match quarter as u32 % 4 {
            0 => return Ok(buffer.clone()),
            1 => image.rotate90(),
            2 => image.rotate180(),
            _ => image.rotate270(),
        };
        return PixelBuffer::from_dynamic(rotated);
    }

    let (dst_w, dst_h) = rotated_bounds(buffer.width(), buffer.height(), normalized);
    check_ceiling(dst_w, dst_h, max_pixels)?;
    debug!(
        "Rotating {}x{} by {} degrees -> {}x{}",
        buffer.width(),
        buffer.height(),
        normalized,
        dst_w,
        dst_h
    );

    let radians = (normalized as f64).to_radians();
    let (sin, cos) = (radians.sin(), radians.cos());
    let src_cx = buffer.width() as f64 / 2.0;
    let src_cy = buffer.height() as f64 / 2.0;
    let dst_cx = dst_w as f64 / 2.0;
    let dst_cy = dst_h as f64 / 2.0;

    let channels = buffer.channels();
    let count = channels.count();
    let fill: Vec<f64> = background_for(channels, background.0)
        .into_iter()
        .map(f64::from)
        .collect();
    let stride = dst_w as usize * count;
    let mut data = vec![0u8; stride * dst_h as usize];

    data.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        let dy = y as f64 + 0.5 - dst_cy;
        for x in 0..dst_w as usize {
            let dx = x as f64 + 0.5 - dst_cx;

            // Inverse of a clockwise rotation in y-down coordinates
            let sx = dx * cos + dy * sin + src_cx - 0.5;
            let sy = -dx * sin + dy * cos + src_cy - 0.5;

            sample_bilinear(buffer, sx, sy, &fill, &mut row[x * count..(x + 1) * count]);
        }
    });

    PixelBuffer::from_raw(dst_w, dst_h, channels, data)
}

/// Bilinear sample at pixel-centre coordinates; neighbours outside the image
/// contribute the fill colour
fn sample_bilinear(buffer: &PixelBuffer, x: f64, y: f64, fill: &[f64], out: &mut [u8]) {
    let (w, h) = (buffer.width() as i64, buffer.height() as i64);
    if x <= -1.0 || y <= -1.0 || x >= w as f64 || y >= h as f64 {
        for (o, f) in out.iter_mut().zip(fill) {
            *o = f.round() as u8;
        }
        return;
    }

    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let taps = [
        (x0, y0, (1.0 - fx) * (1.0 - fy)),
        (x0 + 1, y0, fx * (1.0 - fy)),
        (x0, y0 + 1, (1.0 - fx) * fy),
        (x0 + 1, y0 + 1, fx * fy),
    ];

    for (c, o) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for &(tx, ty, weight) in &taps {
            let sample = if tx >= 0 && ty >= 0 && tx < w && ty < h {
                buffer.pixel(tx as u32, ty as u32)[c] as f64
            } else {
                fill[c]
            };
            acc += sample * weight;
        }
        *o = acc.round().clamp(0.0, 255.0) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::buffer::Channels;

    fn create_test_image(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::from_fn(width, height, Channels::Rgb, |x, y| {
            let intensity = ((x + y) % 255) as u8;
            [intensity, intensity, intensity, 255]
        })
        .unwrap()
    }

    fn request(width: u32, height: u32, fit: FitMode) -> ResizeRequest {
        ResizeRequest {
            width,
            height,
            fit,
            position: CropPosition::Centre,
            kernel: Kernel::Lanczos3,
            background: Background([255, 0, 0, 255]),
        }
    }

    #[test]
    fn test_kernel_weights() {
        for kernel in [Kernel::Cubic, Kernel::Mitchell, Kernel::Lanczos2, Kernel::Lanczos3] {
            assert!(kernel.weight(0.0) > 0.5, "{:?}", kernel);
            assert_eq!(kernel.weight(kernel.radius() + 0.1), 0.0);
        }
        assert_eq!(Kernel::Cubic.weight(1.0), 0.0);
        assert!((Kernel::Lanczos3.weight(0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_contributions_are_normalized() {
        for (src, dst) in [(1000, 640), (10, 37), (5, 5)] {
            for c in contributions(src, dst, Kernel::Lanczos3) {
                let sum: f32 = c.weights.iter().sum();
                assert!((sum - 1.0).abs() < 1e-4);
                assert!(c.start + c.weights.len() <= src as usize);
            }
        }
    }

    #[test]
    fn test_flat_image_stays_flat() {
        let buffer = PixelBuffer::filled(50, 40, Channels::Rgba, &[10, 120, 230, 77]).unwrap();
        let kernels = [
            Kernel::Nearest,
            Kernel::Cubic,
            Kernel::Mitchell,
            Kernel::Lanczos2,
            Kernel::Lanczos3,
        ];
        for kernel in kernels {
            let out = Resampler::new(kernel).resample(&buffer, 23, 61).unwrap();
            assert!(out.as_bytes().chunks(4).all(|p| p == [10, 120, 230, 77]), "{:?}", kernel);
        }
    }

    #[test]
    fn test_fit_modes_produce_exact_dimensions() {
        let image = create_test_image(800, 600);
        for fit in [FitMode::Cover, FitMode::Contain, FitMode::Fill] {
            let out = resize(&image, &request(640, 392, fit), u64::MAX).unwrap();
            assert_eq!((out.width(), out.height()), (640, 392), "{:?}", fit);
        }
    }

    #[test]
    fn test_contain_pads_with_background() {
        let image = PixelBuffer::filled(100, 50, Channels::Rgb, &[0, 0, 255]).unwrap();
        let out = resize(&image, &request(100, 100, FitMode::Contain), u64::MAX).unwrap();
        assert_eq!(out.pixel(50, 0), &[255, 0, 0]);
        assert_eq!(out.pixel(50, 50), &[0, 0, 255]);
        assert_eq!(out.pixel(50, 99), &[255, 0, 0]);
    }

    #[test]
    fn test_contain_default_background_is_opaque_black() {
        let mut contain = request(40, 40, FitMode::Contain);
        contain.background = Background::default();

        let rgba = PixelBuffer::filled(40, 20, Channels::Rgba, &[200, 200, 200, 128]).unwrap();
        let out = resize(&rgba, &contain, u64::MAX).unwrap();
        assert_eq!(out.pixel(20, 0), &[0, 0, 0, 255]);

        let rgb = PixelBuffer::filled(40, 20, Channels::Rgb, &[200, 200, 200]).unwrap();
        let out = resize(&rgb, &contain, u64::MAX).unwrap();
        assert_eq!(out.pixel(20, 0), &[0, 0, 0]);
    }

    #[test]
    fn test_cover_gravity() {
        // Left half black, right half white
        let image = PixelBuffer::from_fn(200, 100, Channels::Luma, |x, _| {
            let v = if x < 100 { 0 } else { 255 };
            [v, v, v, 255]
        })
        .unwrap();

        let mut west = request(50, 50, FitMode::Cover);
        west.position = CropPosition::West;
        west.kernel = Kernel::Nearest;
        let out = resize(&image, &west, u64::MAX).unwrap();
        assert!(out.as_bytes().iter().all(|&v| v == 0));

        west.position = CropPosition::East;
        let out = resize(&image, &west, u64::MAX).unwrap();
        assert!(out.as_bytes().iter().all(|&v| v == 255));
    }

    #[test]
    fn test_cover_of_extreme_aspect_ratio() {
        // Scaling the whole strip to cover 100x100 would need 100_000x100 pixels
        let image = create_test_image(10_000, 10);
        let out = resize(&image, &request(100, 100, FitMode::Cover), 20_000).unwrap();
        assert_eq!((out.width(), out.height()), (100, 100));
    }

    #[test]
    fn test_resize_ceiling() {
        let image = create_test_image(10, 10);
        let err = resize(&image, &request(1000, 1000, FitMode::Fill), 10_000).unwrap_err();
        assert!(matches!(err, FastPipeError::ResourceLimit { .. }));

        let err = resize(&image, &request(0, 10, FitMode::Fill), u64::MAX).unwrap_err();
        assert!(matches!(err, FastPipeError::InvalidParameters { .. }));
    }

    #[test]
    fn test_extract_bounds() {
        let image = create_test_image(100, 80);
        let region = extract(&image, 10, 20, 30, 40).unwrap();
        assert_eq!((region.width(), region.height()), (30, 40));
        assert_eq!(region.pixel(0, 0), image.pixel(10, 20));

        assert!(extract(&image, 90, 0, 20, 10).is_err());
        assert!(extract(&image, 0, 0, 0, 10).is_err());
    }

    #[test]
    fn test_right_angle_rotations() {
        let image = create_test_image(30, 20);
        let quarter = rotate(&image, 90.0, Background::default(), u64::MAX).unwrap();
        assert_eq!((quarter.width(), quarter.height()), (20, 30));
        // Clockwise: bottom-left pixel moves to top-left
        assert_eq!(quarter.pixel(0, 0), image.pixel(0, 19));

        let full = rotate(&image, -360.0, Background::default(), u64::MAX).unwrap();
        assert_eq!(full, image);

        let back = rotate(&quarter, 270.0, Background::default(), u64::MAX).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn test_arbitrary_rotation_expands_canvas() {
        let image = PixelBuffer::filled(40, 40, Channels::Rgb, &[200, 200, 200]).unwrap();
        let out = rotate(&image, 45.0, Background([0, 0, 0, 255]), u64::MAX).unwrap();
        assert_eq!((out.width(), out.height()), rotated_bounds(40, 40, 45.0));
        assert!(out.width() > 40);
        assert_eq!(out.pixel(0, 0), &[0, 0, 0]);
        let c = out.width() / 2;
        assert_eq!(out.pixel(c, c), &[200, 200, 200]);
    }

    #[test]
    fn test_flip_and_flop() {
        let image = create_test_image(5, 3);
        let flipped = flip(&image).unwrap();
        assert_eq!(flipped.pixel(1, 0), image.pixel(1, 2));
        let flopped = flop(&image).unwrap();
        assert_eq!(flopped.pixel(0, 1), image.pixel(4, 1));
        assert_eq!(flip(&flipped).unwrap(), image);
    }
}
