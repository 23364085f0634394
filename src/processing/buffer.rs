//! Owned pixel buffers passed between pipeline stages

use image::DynamicImage;

use crate::error::{FastPipeError, Result};

/// Channel layout of a [`PixelBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channels {
    Luma,
    LumaAlpha,
    Rgb,
    Rgba,
}

impl Channels {
    /// Samples per pixel
    pub fn count(self) -> usize {
        match self {
            Self::Luma => 1,
            Self::LumaAlpha => 2,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }

    /// Whether the last sample of each pixel is alpha
    pub fn has_alpha(self) -> bool {
        matches!(self, Self::LumaAlpha | Self::Rgba)
    }

    /// Number of colour (non-alpha) samples per pixel
    pub fn colour_count(self) -> usize {
        if self.has_alpha() {
            self.count() - 1
        } else {
            self.count()
        }
    }
}

/// An immutable 8-bit image: contiguous row-major samples plus geometry.
///
/// Stages consume a buffer and return a new one; nothing mutates a buffer
/// after it has been produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    channels: Channels,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Bits per sample; decoders normalise everything to 8
    pub const BIT_DEPTH: u8 = 8;

    /// Wrap raw samples, checking the length matches the geometry
    pub fn from_raw(width: u32, height: u32, channels: Channels, data: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(FastPipeError::invalid_parameters(format!(
                "Image dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }
        let expected = width as usize * height as usize * channels.count();
        if data.len() != expected {
            return Err(FastPipeError::invalid_parameters(format!(
                "Pixel data length {} does not match {}x{}x{} = {}",
                data.len(),
                width,
                height,
                channels.count(),
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// A buffer filled with one pixel value (`pixel.len()` must equal the channel count)
    pub fn filled(width: u32, height: u32, channels: Channels, pixel: &[u8]) -> Result<Self> {
        if pixel.len() != channels.count() {
            return Err(FastPipeError::invalid_parameters(
                "Fill pixel does not match channel count",
            ));
        }
        let data = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * channels.count())
            .collect();
        Self::from_raw(width, height, channels, data)
    }

    /// Build a buffer by evaluating `f(x, y)` for every pixel
    pub fn from_fn<F>(width: u32, height: u32, channels: Channels, mut f: F) -> Result<Self>
    where
        F: FnMut(u32, u32) -> [u8; 4],
    {
        let count = channels.count();
        let mut data = Vec::with_capacity(width as usize * height as usize * count);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&f(x, y)[..count]);
            }
        }
        Self::from_raw(width, height, channels, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> Channels {
        self.channels
    }

    pub fn bit_depth(&self) -> u8 {
        Self::BIT_DEPTH
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Bytes in one row
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels.count()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Samples of row `y`
    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.stride();
        let start = y as usize * stride;
        &self.data[start..start + stride]
    }

    /// Samples of the pixel at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let count = self.channels.count();
        let start = (y as usize * self.width as usize + x as usize) * count;
        &self.data[start..start + count]
    }

    /// Rec.709 luminance of the pixel at (x, y)
    pub fn luma_at(&self, x: u32, y: u32) -> u8 {
        let p = self.pixel(x, y);
        match self.channels {
            Channels::Luma | Channels::LumaAlpha => p[0],
            Channels::Rgb | Channels::Rgba => luma(p[0], p[1], p[2]),
        }
    }

    /// Expand a background colour into this buffer's channel layout
    pub fn background_pixel(&self, rgba: [u8; 4]) -> Vec<u8> {
        background_for(self.channels, rgba)
    }

    /// Convert from a decoded image, narrowing to 8 bits per sample and
    /// keeping the channel layout
    pub fn from_dynamic(image: DynamicImage) -> Result<Self> {
        let (width, height) = (image.width(), image.height());
        let (channels, data) = match image {
            DynamicImage::ImageLuma8(img) => (Channels::Luma, img.into_raw()),
            DynamicImage::ImageLumaA8(img) => (Channels::LumaAlpha, img.into_raw()),
            DynamicImage::ImageRgb8(img) => (Channels::Rgb, img.into_raw()),
            DynamicImage::ImageRgba8(img) => (Channels::Rgba, img.into_raw()),
            DynamicImage::ImageLuma16(_) => (Channels::Luma, image.to_luma8().into_raw()),
            DynamicImage::ImageLumaA16(_) => {
                (Channels::LumaAlpha, image.to_luma_alpha8().into_raw())
            }
            DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgb32F(_) => {
                (Channels::Rgb, image.to_rgb8().into_raw())
            }
            other => (Channels::Rgba, other.to_rgba8().into_raw()),
        };
        Self::from_raw(width, height, channels, data)
    }

    /// Convert to an `image` crate value for codecs and imageproc
    pub fn to_dynamic(&self) -> Result<DynamicImage> {
        let (w, h, data) = (self.width, self.height, self.data.clone());
        let image = match self.channels {
            Channels::Luma => image::GrayImage::from_raw(w, h, data).map(DynamicImage::ImageLuma8),
            Channels::LumaAlpha => {
                image::GrayAlphaImage::from_raw(w, h, data).map(DynamicImage::ImageLumaA8)
            }
            Channels::Rgb => image::RgbImage::from_raw(w, h, data).map(DynamicImage::ImageRgb8),
            Channels::Rgba => image::RgbaImage::from_raw(w, h, data).map(DynamicImage::ImageRgba8),
        };
        image.ok_or_else(|| FastPipeError::system("Pixel buffer does not match its geometry"))
    }
}

/// Rec.709 luma with integer weights
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((2126 * r as u32 + 7152 * g as u32 + 722 * b as u32 + 5000) / 10_000) as u8
}

/// Expand an RGBA colour into a channel layout
pub fn background_for(channels: Channels, rgba: [u8; 4]) -> Vec<u8> {
    match channels {
        Channels::Luma => vec![luma(rgba[0], rgba[1], rgba[2])],
        Channels::LumaAlpha => vec![luma(rgba[0], rgba[1], rgba[2]), rgba[3]],
        Channels::Rgb => rgba[..3].to_vec(),
        Channels::Rgba => rgba.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_checks_length() {
        assert!(PixelBuffer::from_raw(2, 2, Channels::Rgb, vec![0; 12]).is_ok());
        assert!(PixelBuffer::from_raw(2, 2, Channels::Rgb, vec![0; 11]).is_err());
        assert!(PixelBuffer::from_raw(0, 2, Channels::Rgb, vec![]).is_err());
    }

    #[test]
    fn test_pixel_access() {
        let buffer =
            PixelBuffer::from_fn(3, 2, Channels::Rgba, |x, y| [x as u8, y as u8, 7, 255]).unwrap();
        assert_eq!(buffer.pixel(2, 1), &[2, 1, 7, 255]);
        assert_eq!(buffer.row(1).len(), 12);
        assert_eq!(buffer.pixel_count(), 6);
        assert_eq!(buffer.bit_depth(), 8);
    }

    #[test]
    fn test_dynamic_conversion_keeps_layout() {
        let buffer = PixelBuffer::filled(4, 3, Channels::LumaAlpha, &[10, 200]).unwrap();
        let dynamic = buffer.to_dynamic().unwrap();
        assert!(matches!(dynamic, DynamicImage::ImageLumaA8(_)));
        let back = PixelBuffer::from_dynamic(dynamic).unwrap();
        assert_eq!(back, buffer);
    }

    #[test]
    fn test_sixteen_bit_is_narrowed() {
        let pixel = image::Rgb([65535u16, 0, 32768]);
        let img = image::ImageBuffer::<image::Rgb<u16>, _>::from_pixel(2, 2, pixel);
        let buffer = PixelBuffer::from_dynamic(DynamicImage::ImageRgb16(img)).unwrap();
        assert_eq!(buffer.channels(), Channels::Rgb);
        assert_eq!(buffer.pixel(0, 0)[0], 255);
        assert_eq!(buffer.pixel(0, 0)[1], 0);
    }

    #[test]
    fn test_luma_weights() {
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(background_for(Channels::Rgb, [1, 2, 3, 4]), vec![1, 2, 3]);
    }
}
