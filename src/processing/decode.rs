//! Decoding: encoded bytes or files into an 8-bit [`PixelBuffer`]

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Seek};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use image::io::{Limits, Reader};
use image::ImageError;
use memmap2::{Mmap, MmapOptions};
use tracing::debug;

use crate::config::ImageFormat;
use crate::error::{FastPipeError, Result};
use crate::processing::buffer::PixelBuffer;
use crate::processing::formats::sniff_decodable;
use crate::processing::validation::{InputInfo, InputValidator};

/// Files above this size are memory mapped instead of read into memory
pub const MMAP_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Where a pipeline run reads its input from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Encoded image bytes held in memory
    Bytes(Vec<u8>),
    /// Path to an encoded image file
    File(PathBuf),
}

impl Source {
    /// Path of a file source
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Bytes(_) => None,
        }
    }
}

impl From<Vec<u8>> for Source {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for Source {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for Source {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

/// Encoded input loaded from a [`Source`]
pub enum Loaded<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Deref for Loaded<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Borrowed(bytes) => *bytes,
            Self::Owned(bytes) => bytes.as_slice(),
            Self::Mapped(map) => &map[..],
        }
    }
}

/// Result of decoding one input
#[derive(Debug, Clone)]
pub struct Decoded {
    pub buffer: PixelBuffer,
    pub format: ImageFormat,
}

/// Decoder bound to a pixel ceiling
#[derive(Debug, Clone)]
pub struct Decoder {
    validator: InputValidator,
}

impl Decoder {
    pub fn new(max_pixels: u64) -> Self {
        Self {
            validator: InputValidator::with_limit(max_pixels),
        }
    }

    pub fn max_pixels(&self) -> u64 {
        self.validator.max_pixels()
    }

    /// Load the encoded bytes of a source. Large files are memory mapped.
    pub fn load<'a>(&self, source: &'a Source) -> Result<Loaded<'a>> {
        match source {
            Source::Bytes(bytes) => Ok(Loaded::Borrowed(bytes)),
            Source::File(path) => {
                let file = File::open(path)?;
                let file_size = file.metadata()?.len();

                if file_size > MMAP_THRESHOLD {
                    debug!("Using memory mapping for large file: {:?}", path);
                    // The map is read-only and dropped before the run returns
                    let map = unsafe { MmapOptions::new().map(&file)? };
                    Ok(Loaded::Mapped(map))
                } else {
                    Ok(Loaded::Owned(std::fs::read(path)?))
                }
            }
        }
    }

    /// Decode in-memory bytes. The header is probed first so an oversized
    /// input fails without allocating its pixels.
    pub fn decode_bytes(&self, data: &[u8]) -> Result<Decoded> {
        let info = self.validator.probe(data)?;
        let reader = Reader::with_format(Cursor::new(data), info.format.into());
        self.decode_with(reader, info)
    }

    /// Decode a file in one front-to-back pass without buffering the whole
    /// encoded file
    pub fn decode_sequential(&self, path: &Path) -> Result<Decoded> {
        let mut reader = BufReader::new(File::open(path)?);

        let format = sniff_decodable(reader.fill_buf()?).map_err(|e| match e {
            FastPipeError::UnsupportedFormat { format, .. } => {
                FastPipeError::unsupported_format(format, Some(path.to_path_buf()))
            }
            other => other,
        })?;

        let (width, height) = {
            let mut probe = Reader::with_format(&mut reader, format.into());
            probe.no_limits();
            probe.into_dimensions()?
        };
        self.validator.validate_dimensions(width, height)?;
        reader.rewind()?;

        debug!("Sequential decode of {:?} ({} {}x{})", path, format, width, height);
        let info = InputInfo { format, width, height };
        self.decode_with(Reader::with_format(reader, format.into()), info)
    }

    /// Decode a source, choosing the sequential path when asked for a file
    pub fn decode_source(&self, source: &Source, sequential_read: bool) -> Result<Decoded> {
        match (source, sequential_read) {
            (Source::File(path), true) => self.decode_sequential(path),
            _ => {
                let loaded = self.load(source)?;
                self.decode_bytes(&loaded)
            }
        }
    }

    fn decode_with<R: BufRead + Seek>(
        &self,
        mut reader: Reader<R>,
        info: InputInfo,
    ) -> Result<Decoded> {
        let mut limits = Limits::default();
        limits.max_image_width = Some(info.width);
        limits.max_image_height = Some(info.height);
        // Room for the widest decoder output (16-bit RGBA)
        limits.max_alloc = Some(self.max_pixels().saturating_mul(8));
        reader.limits(limits);

        let image = reader.decode().map_err(|e| match e {
            ImageError::Limits(_) => {
                FastPipeError::resource_limit(info.width, info.height, self.max_pixels())
            }
            other => other.into(),
        })?;

        let buffer = PixelBuffer::from_dynamic(image)?;
        debug!(
            "Decoded {} input: {}x{} {:?}",
            info.format,
            buffer.width(),
            buffer.height(),
            buffer.channels()
        );

        Ok(Decoded {
            buffer,
            format: info.format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::processing::buffer::Channels;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn encoded(img: image::DynamicImage, format: image::ImageOutputFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn gradient_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x * 7) as u8, (y * 5) as u8, 90, 200])
        });
        encoded(image::DynamicImage::ImageRgba8(img), image::ImageOutputFormat::Png)
    }

    #[test]
    fn test_decode_png_keeps_alpha() {
        let decoder = Decoder::new(1_000_000);
        let decoded = decoder.decode_bytes(&gradient_png(16, 9)).unwrap();
        assert_eq!(decoded.format, ImageFormat::Png);
        assert_eq!(decoded.buffer.channels(), Channels::Rgba);
        assert_eq!((decoded.buffer.width(), decoded.buffer.height()), (16, 9));
        assert_eq!(decoded.buffer.pixel(3, 2), &[21, 10, 90, 200]);
    }

    #[test]
    fn test_decode_jpeg() {
        let img = image::RgbImage::from_pixel(32, 24, image::Rgb([120, 60, 30]));
        let data = encoded(image::DynamicImage::ImageRgb8(img), image::ImageOutputFormat::Jpeg(90));
        let decoded = Decoder::new(1_000_000).decode_bytes(&data).unwrap();
        assert_eq!(decoded.format, ImageFormat::Jpeg);
        assert_eq!(decoded.buffer.channels(), Channels::Rgb);
    }

    #[test]
    fn test_ceiling_enforced_from_header() {
        let err = Decoder::new(100).decode_bytes(&gradient_png(16, 9)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
    }

    #[test]
    fn test_truncated_input_is_decode_error() {
        let data = gradient_png(64, 64);
        let err = Decoder::new(1_000_000).decode_bytes(&data[..data.len() / 2]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Decode | ErrorKind::Io));
    }

    #[test]
    fn test_sequential_matches_buffered() {
        let data = gradient_png(20, 20);
        let mut file = NamedTempFile::with_suffix(".png").unwrap();
        file.write_all(&data).unwrap();

        let decoder = Decoder::new(1_000_000);
        let source = Source::from(file.path());
        let sequential = decoder.decode_source(&source, true).unwrap();
        let buffered = decoder.decode_source(&source, false).unwrap();
        let in_memory = decoder.decode_source(&Source::from(data), false).unwrap();

        assert_eq!(sequential.buffer, buffered.buffer);
        assert_eq!(buffered.buffer, in_memory.buffer);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Decoder::new(100)
            .decode_source(&Source::from(PathBuf::from("does-not-exist.png")), false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
