//! Pipeline specifications and named profiles

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::config::{ImageFormat, Operation};
use crate::error::{FastPipeError, Result, Stage};

/// Ordered operations plus output encoding; fully determines the output for a given input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Operations, applied in order
    #[serde(default)]
    pub operations: Vec<Operation>,

    /// Output format
    pub format: ImageFormat,

    /// Format specific encoder options
    #[serde(default)]
    pub encode: EncodeOptions,

    /// Decoder hints
    #[serde(default)]
    pub decode: DecodeOptions,
}

impl PipelineSpec {
    /// Create an empty spec encoding to `format`
    pub fn new(format: ImageFormat) -> Self {
        Self {
            operations: Vec::new(),
            format,
            encode: EncodeOptions::default(),
            decode: DecodeOptions::default(),
        }
    }

    /// Append an operation
    pub fn then(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Shorthand for appending a cover resize
    pub fn resize(self, width: u32, height: u32) -> Self {
        self.then(Operation::resize(width, height))
    }

    pub fn quality(mut self, quality: u8) -> Self {
        self.encode.quality = Some(quality);
        self
    }

    pub fn progressive(mut self, progressive: bool) -> Self {
        self.encode.progressive = Some(progressive);
        self
    }

    pub fn chroma_subsampling(mut self, subsampling: ChromaSubsampling) -> Self {
        self.encode.chroma_subsampling = Some(subsampling);
        self
    }

    pub fn adaptive_filtering(mut self, adaptive: bool) -> Self {
        self.encode.adaptive_filtering = Some(adaptive);
        self
    }

    pub fn compression_level(mut self, level: u8) -> Self {
        self.encode.compression_level = Some(level);
        self
    }

    pub fn sequential_read(mut self, sequential: bool) -> Self {
        self.decode.sequential_read = sequential;
        self
    }

    /// Validate every operation and the encode options, tagging failures with
    /// the stage they belong to
    pub fn validate(&self) -> Result<()> {
        for operation in &self.operations {
            operation.validate().map_err(|e| e.in_stage(operation.stage()))?;
        }
        self.encode
            .validate_for(self.format)
            .map_err(|e| e.in_stage(Stage::Encode))
    }
}

/// Chroma subsampling applied by the JPEG encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChromaSubsampling {
    /// Chroma at quarter resolution
    #[default]
    #[serde(rename = "4:2:0")]
    Yuv420,
    /// Chroma at half horizontal resolution
    #[serde(rename = "4:2:2")]
    Yuv422,
    /// Chroma at full resolution
    #[serde(rename = "4:4:4")]
    Yuv444,
}

impl fmt::Display for ChromaSubsampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Yuv420 => "4:2:0",
            Self::Yuv422 => "4:2:2",
            Self::Yuv444 => "4:4:4",
        })
    }
}

impl FromStr for ChromaSubsampling {
    type Err = FastPipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "4:2:0" | "420" => Ok(Self::Yuv420),
            "4:2:2" | "422" => Ok(Self::Yuv422),
            "4:4:4" | "444" => Ok(Self::Yuv444),
            other => Err(FastPipeError::invalid_parameters(format!(
                "Unknown chroma subsampling '{}', expected 4:2:0, 4:2:2 or 4:4:4",
                other
            ))),
        }
    }
}

/// Encoder options. `None` means "use the format default"; a `Some` value for a
/// format that does not support the option is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncodeOptions {
    /// JPEG quality (1-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,

    /// Progressive JPEG scans
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progressive: Option<bool>,

    /// JPEG chroma subsampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chroma_subsampling: Option<ChromaSubsampling>,

    /// PNG per-scanline adaptive filtering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_filtering: Option<bool>,

    /// PNG zlib compression level (0-9)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u8>,
}

impl EncodeOptions {
    /// Default JPEG quality
    pub const DEFAULT_QUALITY: u8 = 80;
    /// Default PNG compression level
    pub const DEFAULT_COMPRESSION_LEVEL: u8 = 6;

    /// Names of the options that are set
    fn set_options(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        if self.quality.is_some() {
            set.push("quality");
        }
        if self.progressive.is_some() {
            set.push("progressive");
        }
        if self.chroma_subsampling.is_some() {
            set.push("chroma_subsampling");
        }
        if self.adaptive_filtering.is_some() {
            set.push("adaptive_filtering");
        }
        if self.compression_level.is_some() {
            set.push("compression_level");
        }
        set
    }

    /// Reject options the format cannot honour and out-of-range values
    pub fn validate_for(&self, format: ImageFormat) -> Result<()> {
        if !format.can_encode() {
            return Err(FastPipeError::encode(
                format,
                format!("{} output is not supported", format),
            ));
        }

        if let Some(option) = self
            .set_options()
            .into_iter()
            .find(|option| !format.supports_option(option))
        {
            return Err(FastPipeError::unsupported_option(format, option));
        }

        if let Some(quality) = self.quality {
            if quality == 0 || quality > 100 {
                return Err(FastPipeError::invalid_parameters(format!(
                    "Quality must be between 1-100, got {}",
                    quality
                )));
            }
        }

        if let Some(level) = self.compression_level {
            if level > 9 {
                return Err(FastPipeError::invalid_parameters(format!(
                    "Compression level must be between 0-9, got {}",
                    level
                )));
            }
        }

        Ok(())
    }
}

/// Decoder hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// Read the input front to back in one pass, bypassing the decode cache
    #[serde(default)]
    pub sequential_read: bool,
}

/// A named pipeline with output naming rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// What to do with each image
    pub spec: PipelineSpec,

    /// File naming configuration
    #[serde(default)]
    pub naming: NamingConfig,
}

impl Profile {
    /// Create a profile with default naming
    pub fn new(spec: PipelineSpec) -> Self {
        Self {
            spec,
            naming: NamingConfig::default(),
        }
    }

    /// Set the naming configuration
    pub fn naming(mut self, naming: NamingConfig) -> Self {
        self.naming = naming;
        self
    }

    /// Validate the profile configuration
    pub fn validate(&self) -> Result<()> {
        self.spec.validate()?;
        self.naming.validate()
    }
}

/// File naming configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Prefix to add to filenames
    pub prefix: Option<String>,

    /// Suffix to add to filenames (before extension)
    pub suffix: Option<String>,

    /// Keep original file stems (ignore prefix/suffix)
    pub keep_original: bool,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            suffix: None,
            keep_original: false,
        }
    }
}

impl NamingConfig {
    /// Generate the output filename for a given input; the extension always
    /// follows the output format
    pub fn generate_filename(&self, input_name: &str, output_format: ImageFormat) -> String {
        let name = match input_name.rfind('.') {
            Some(dot_pos) if dot_pos > 0 => &input_name[..dot_pos],
            _ => input_name,
        };

        let mut new_name = String::new();
        if !self.keep_original {
            if let Some(prefix) = &self.prefix {
                new_name.push_str(prefix);
            }
        }
        new_name.push_str(name);
        if !self.keep_original {
            if let Some(suffix) = &self.suffix {
                new_name.push_str(suffix);
            }
        }
        new_name.push('.');
        new_name.push_str(output_format.extension());
        new_name
    }

    /// Validate naming configuration
    pub fn validate(&self) -> Result<()> {
        for (label, value) in [("Prefix", &self.prefix), ("Suffix", &self.suffix)] {
            if let Some(value) = value {
                if value.contains(['/', '\\', ':', '*', '?', '"', '<', '>', '|']) {
                    return Err(FastPipeError::invalid_parameters(format!(
                        "{} contains invalid filename characters",
                        label
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Predefined profiles for common use cases
pub struct Profiles;

impl Profiles {
    /// Square attention-cropped WebP thumbnails
    pub fn thumbnail() -> Profile {
        let spec = PipelineSpec::new(ImageFormat::WebP).then(Operation::resize_with(
            300,
            300,
            crate::config::FitMode::Cover,
            crate::config::CropPosition::Attention,
            crate::config::Kernel::Lanczos3,
        ));
        Profile::new(spec).naming(NamingConfig {
            suffix: Some("_thumb".to_string()),
            ..Default::default()
        })
    }

    /// Letterboxed, lightly sharpened progressive JPEG for the web
    pub fn web() -> Profile {
        let spec = PipelineSpec::new(ImageFormat::Jpeg)
            .then(Operation::resize_with(
                1920,
                1080,
                crate::config::FitMode::Contain,
                crate::config::CropPosition::Centre,
                crate::config::Kernel::Lanczos3,
            ))
            .then(Operation::sharpen())
            .quality(85)
            .progressive(true);
        Profile::new(spec).naming(NamingConfig {
            suffix: Some("_web".to_string()),
            ..Default::default()
        })
    }

    /// Lossless PNG with adaptive filtering, no geometric change
    pub fn archive() -> Profile {
        let spec = PipelineSpec::new(ImageFormat::Png)
            .adaptive_filtering(true)
            .compression_level(9);
        Profile::new(spec).naming(NamingConfig {
            suffix: Some("_archive".to_string()),
            ..Default::default()
        })
    }

    /// Get all predefined profiles
    pub fn all() -> std::collections::HashMap<String, Profile> {
        let mut profiles = std::collections::HashMap::new();
        profiles.insert("thumbnail".to_string(), Self::thumbnail());
        profiles.insert("web".to_string(), Self::web());
        profiles.insert("archive".to_string(), Self::archive());
        profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_spec_builder() {
        let spec = PipelineSpec::new(ImageFormat::Jpeg)
            .resize(640, 392)
            .then(Operation::sharpen())
            .quality(85)
            .progressive(true);

        assert_eq!(spec.operations.len(), 2);
        assert_eq!(spec.encode.quality, Some(85));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_chroma_subsampling_rejected_for_png() {
        let spec =
            PipelineSpec::new(ImageFormat::Png).chroma_subsampling(ChromaSubsampling::Yuv444);
        let err = spec.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOption);
        assert_eq!(err.stage(), Some(Stage::Encode));
    }

    #[test]
    fn test_option_compatibility() {
        assert!(EncodeOptions { adaptive_filtering: Some(true), ..Default::default() }
            .validate_for(ImageFormat::Jpeg)
            .is_err());
        assert!(EncodeOptions { progressive: Some(true), ..Default::default() }
            .validate_for(ImageFormat::Png)
            .is_err());
        assert!(EncodeOptions { quality: Some(90), ..Default::default() }
            .validate_for(ImageFormat::WebP)
            .is_err());
        let png_options = EncodeOptions {
            compression_level: Some(9),
            adaptive_filtering: Some(false),
            ..Default::default()
        };
        assert!(png_options.validate_for(ImageFormat::Png).is_ok());
        assert!(EncodeOptions::default().validate_for(ImageFormat::Gif).is_err());
    }

    #[test]
    fn test_option_ranges() {
        let err = EncodeOptions { quality: Some(0), ..Default::default() }
            .validate_for(ImageFormat::Jpeg)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);

        assert!(EncodeOptions { compression_level: Some(10), ..Default::default() }
            .validate_for(ImageFormat::Png)
            .is_err());
    }

    #[test]
    fn test_invalid_operation_tagged_with_stage() {
        let spec = PipelineSpec::new(ImageFormat::Png).then(Operation::Blur { sigma: Some(0.0) });
        let err = spec.validate().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Filter));
    }

    #[test]
    fn test_chroma_parsing() {
        assert_eq!("4:4:4".parse::<ChromaSubsampling>().unwrap(), ChromaSubsampling::Yuv444);
        assert_eq!("420".parse::<ChromaSubsampling>().unwrap(), ChromaSubsampling::Yuv420);
        assert!("4:1:1".parse::<ChromaSubsampling>().is_err());
    }

    #[test]
    fn test_filename_generation() {
        let naming = NamingConfig {
            prefix: Some("web_".to_string()),
            suffix: Some("_small".to_string()),
            keep_original: false,
        };
        assert_eq!(
            naming.generate_filename("photo.jpg", ImageFormat::WebP),
            "web_photo_small.webp"
        );

        let original = NamingConfig { keep_original: true, ..naming };
        assert_eq!(original.generate_filename("photo.jpg", ImageFormat::Png), "photo.png");

        assert_eq!(
            NamingConfig::default().generate_filename(".hidden", ImageFormat::Png),
            ".hidden.png"
        );
    }

    #[test]
    fn test_naming_validation() {
        let naming = NamingConfig {
            suffix: Some("a/b".to_string()),
            ..Default::default()
        };
        assert!(naming.validate().is_err());
    }

    #[test]
    fn test_predefined_profiles() {
        let all_profiles = Profiles::all();
        assert_eq!(all_profiles.len(), 3);
        for profile in all_profiles.values() {
            assert!(profile.validate().is_ok());
        }
    }
}
