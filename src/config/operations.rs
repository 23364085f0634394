//! Pipeline operations and their parameters

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{FastPipeError, Result, Stage};

/// Default exponent used by [`Operation::Gamma`] when no value is given
pub const DEFAULT_GAMMA: f32 = 2.2;
/// Default gain applied to flat areas by a sigma sharpen
pub const DEFAULT_SHARPEN_FLAT: f32 = 1.0;
/// Default gain applied to jagged areas by a sigma sharpen
pub const DEFAULT_SHARPEN_JAGGED: f32 = 2.0;

/// A single transform applied by the pipeline, in caller order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Resize to exactly `width`x`height`
    Resize {
        width: u32,
        height: u32,
        #[serde(default)]
        fit: FitMode,
        #[serde(default)]
        position: CropPosition,
        #[serde(default)]
        kernel: Kernel,
        #[serde(default)]
        background: Background,
    },

    /// Rotate clockwise by `angle` degrees
    Rotate {
        angle: f32,
        #[serde(default)]
        background: Background,
    },

    /// Crop a region out of the image
    Extract {
        left: u32,
        top: u32,
        width: u32,
        height: u32,
    },

    /// Mirror vertically (about the x axis)
    Flip,

    /// Mirror horizontally (about the y axis)
    Flop,

    /// Sharpen; without sigma a mild fixed kernel is used
    Sharpen {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sigma: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flat: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jagged: Option<f32>,
    },

    /// Blur; without sigma a mild box blur is used
    Blur {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sigma: Option<f32>,
    },

    /// Gamma encoding, defaults to 2.2
    Gamma {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<f32>,
    },

    /// Stretch luminance to the full range
    Normalize,

    /// Convert to a single luminance channel
    Greyscale,
}

impl Operation {
    /// Cover resize with default position and kernel
    pub fn resize(width: u32, height: u32) -> Self {
        Self::Resize {
            width,
            height,
            fit: FitMode::default(),
            position: CropPosition::default(),
            kernel: Kernel::default(),
            background: Background::default(),
        }
    }

    /// Resize with an explicit fit mode
    pub fn resize_with(
        width: u32,
        height: u32,
        fit: FitMode,
        position: CropPosition,
        kernel: Kernel,
    ) -> Self {
        Self::Resize {
            width,
            height,
            fit,
            position,
            kernel,
            background: Background::default(),
        }
    }

    pub fn rotate(angle: f32) -> Self {
        Self::Rotate {
            angle,
            background: Background::default(),
        }
    }

    /// Mild sharpen
    pub fn sharpen() -> Self {
        Self::Sharpen {
            sigma: None,
            flat: None,
            jagged: None,
        }
    }

    /// Mild blur
    pub fn blur() -> Self {
        Self::Blur { sigma: None }
    }

    /// Gamma with the default exponent
    pub fn gamma() -> Self {
        Self::Gamma { value: None }
    }

    /// Name used in logs and the compact text form
    pub fn name(&self) -> &'static str {
        match self {
            Self::Resize { .. } => "resize",
            Self::Rotate { .. } => "rotate",
            Self::Extract { .. } => "extract",
            Self::Flip => "flip",
            Self::Flop => "flop",
            Self::Sharpen { .. } => "sharpen",
            Self::Blur { .. } => "blur",
            Self::Gamma { .. } => "gamma",
            Self::Normalize => "normalize",
            Self::Greyscale => "greyscale",
        }
    }

    /// Stage this operation runs in
    pub fn stage(&self) -> Stage {
        match self {
            Self::Resize { .. }
            | Self::Rotate { .. }
            | Self::Extract { .. }
            | Self::Flip
            | Self::Flop => Stage::Geometric,

            Self::Sharpen { .. }
            | Self::Blur { .. }
            | Self::Gamma { .. }
            | Self::Normalize
            | Self::Greyscale => Stage::Filter,
        }
    }

    /// Check parameters that can be validated without an image
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Resize { width, height, .. } => {
                if *width == 0 || *height == 0 {
                    return Err(FastPipeError::invalid_parameters(format!(
                        "Resize dimensions must be greater than 0, got {}x{}",
                        width, height
                    )));
                }
            }
            Self::Rotate { angle, .. } => {
                if !angle.is_finite() {
                    return Err(FastPipeError::invalid_parameters("Rotation angle must be finite"));
                }
            }
            Self::Extract { width, height, .. } => {
                if *width == 0 || *height == 0 {
                    return Err(FastPipeError::invalid_parameters(format!(
                        "Extract region must be non-empty, got {}x{}",
                        width, height
                    )));
                }
            }
            Self::Sharpen { sigma, flat, jagged } => {
                if let Some(sigma) = sigma {
                    check_range("sharpen sigma", *sigma, 0.01, 10_000.0)?;
                } else if flat.is_some() || jagged.is_some() {
                    return Err(FastPipeError::invalid_parameters(
                        "Sharpen flat/jagged gains require a sigma",
                    ));
                }
                if let Some(flat) = flat {
                    check_range("sharpen flat", *flat, 0.0, 10_000.0)?;
                }
                if let Some(jagged) = jagged {
                    check_range("sharpen jagged", *jagged, 0.0, 10_000.0)?;
                }
            }
            Self::Blur { sigma } => {
                if let Some(sigma) = sigma {
                    check_range("blur sigma", *sigma, 0.3, 1000.0)?;
                }
            }
            Self::Gamma { value } => {
                if let Some(value) = value {
                    check_range("gamma", *value, 1.0, 3.0)?;
                }
            }
            Self::Flip | Self::Flop | Self::Normalize | Self::Greyscale => {}
        }
        Ok(())
    }
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(FastPipeError::invalid_parameters(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        )));
    }
    Ok(())
}

/// Policy for reconciling source and target aspect ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Cover the target, cropping the overflow
    #[default]
    Cover,
    /// Fit inside the target, padding with the background
    Contain,
    /// Stretch to the target, ignoring aspect ratio
    Fill,
}

/// Which window of a cover resize is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropPosition {
    #[default]
    Centre,
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
    /// Window with the highest luminance entropy
    Entropy,
    /// Window with the highest saliency
    Attention,
}

impl CropPosition {
    /// Fixed anchor as fractions of the overflow, `None` for scored strategies
    pub fn anchor(self) -> Option<(f32, f32)> {
        match self {
            Self::Centre => Some((0.5, 0.5)),
            Self::North => Some((0.5, 0.0)),
            Self::NorthEast => Some((1.0, 0.0)),
            Self::East => Some((1.0, 0.5)),
            Self::SouthEast => Some((1.0, 1.0)),
            Self::South => Some((0.5, 1.0)),
            Self::SouthWest => Some((0.0, 1.0)),
            Self::West => Some((0.0, 0.5)),
            Self::NorthWest => Some((0.0, 0.0)),
            Self::Entropy | Self::Attention => None,
        }
    }
}

/// Resampling kernel used by resize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kernel {
    /// Nearest neighbour (fastest, lowest quality)
    Nearest,
    /// Catmull-Rom cubic spline
    Cubic,
    /// Mitchell-Netravali (B = C = 1/3)
    Mitchell,
    /// Lanczos with radius 2
    Lanczos2,
    /// Lanczos with radius 3 (high quality, recommended)
    #[default]
    Lanczos3,
}

/// RGBA fill colour for padding and rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Background(pub [u8; 4]);

impl Default for Background {
    fn default() -> Self {
        Self([0, 0, 0, 255])
    }
}

impl FromStr for FitMode {
    type Err = FastPipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cover" => Ok(Self::Cover),
            "contain" => Ok(Self::Contain),
            "fill" => Ok(Self::Fill),
            other => Err(FastPipeError::invalid_parameters(format!(
                "Unknown fit mode '{}'",
                other
            ))),
        }
    }
}

impl FromStr for CropPosition {
    type Err = FastPipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "centre" | "center" => Ok(Self::Centre),
            "north" | "top" => Ok(Self::North),
            "north_east" | "northeast" => Ok(Self::NorthEast),
            "east" | "right" => Ok(Self::East),
            "south_east" | "southeast" => Ok(Self::SouthEast),
            "south" | "bottom" => Ok(Self::South),
            "south_west" | "southwest" => Ok(Self::SouthWest),
            "west" | "left" => Ok(Self::West),
            "north_west" | "northwest" => Ok(Self::NorthWest),
            "entropy" => Ok(Self::Entropy),
            "attention" => Ok(Self::Attention),
            other => Err(FastPipeError::invalid_parameters(format!(
                "Unknown crop position '{}'",
                other
            ))),
        }
    }
}

impl FromStr for Kernel {
    type Err = FastPipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "cubic" => Ok(Self::Cubic),
            "mitchell" => Ok(Self::Mitchell),
            "lanczos2" => Ok(Self::Lanczos2),
            "lanczos3" => Ok(Self::Lanczos3),
            other => Err(FastPipeError::invalid_parameters(format!("Unknown kernel '{}'", other))),
        }
    }
}

fn parse_number<T: FromStr>(what: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        FastPipeError::invalid_parameters(format!("Invalid {} value '{}'", what, value))
    })
}

/// Parse a dimension string (e.g., "640x392")
pub fn parse_dimensions(s: &str) -> Result<(u32, u32)> {
    let (width, height) = s.split_once(['x', 'X']).ok_or_else(|| {
        FastPipeError::invalid_parameters(format!(
            "Dimensions must be in format 'WIDTHxHEIGHT' (e.g., '640x392'), got '{}'",
            s
        ))
    })?;
    Ok((parse_number("width", width)?, parse_number("height", height)?))
}

/// Compact text form used by the CLI, e.g. `resize=640x392:cover:attention:lanczos3`,
/// `sharpen=3:1:3`, `blur`, `gamma=2.2`, `rotate=90`, `extract=10:10:100:100`.
impl FromStr for Operation {
    type Err = FastPipeError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, args) = match s.split_once('=') {
            Some((name, args)) => (name.trim(), Some(args.trim())),
            None => (s.trim(), None),
        };
        let parts: Vec<&str> = args
            .map(|a| a.split(':').collect())
            .unwrap_or_default();

        let operation = match (name.to_lowercase().as_str(), parts.as_slice()) {
            ("resize", [dims, rest @ ..]) => {
                let (width, height) = parse_dimensions(dims)?;
                let mut fit = FitMode::default();
                let mut position = CropPosition::default();
                let mut kernel = Kernel::default();
                for token in rest {
                    if let Ok(value) = token.parse::<FitMode>() {
                        fit = value;
                    } else if let Ok(value) = token.parse::<CropPosition>() {
                        position = value;
                    } else if let Ok(value) = token.parse::<Kernel>() {
                        kernel = value;
                    } else {
                        return Err(FastPipeError::invalid_parameters(format!(
                            "Unknown resize option '{}'",
                            token
                        )));
                    }
                }
                Self::resize_with(width, height, fit, position, kernel)
            }
            ("rotate", [angle]) => Self::rotate(parse_number("angle", angle)?),
            ("extract", [left, top, width, height]) => Self::Extract {
                left: parse_number("left", left)?,
                top: parse_number("top", top)?,
                width: parse_number("width", width)?,
                height: parse_number("height", height)?,
            },
            ("flip", []) => Self::Flip,
            ("flop", []) => Self::Flop,
            ("sharpen", []) => Self::sharpen(),
            ("sharpen", [sigma, gains @ ..]) if gains.len() <= 2 => Self::Sharpen {
                sigma: Some(parse_number("sigma", sigma)?),
                flat: gains.first().map(|v| parse_number("flat", v)).transpose()?,
                jagged: gains.get(1).map(|v| parse_number("jagged", v)).transpose()?,
            },
            ("blur", []) => Self::blur(),
            ("blur", [sigma]) => Self::Blur {
                sigma: Some(parse_number("sigma", sigma)?),
            },
            ("gamma", []) => Self::gamma(),
            ("gamma", [value]) => Self::Gamma {
                value: Some(parse_number("gamma", value)?),
            },
            ("normalize" | "normalise", []) => Self::Normalize,
            ("greyscale" | "grayscale", []) => Self::Greyscale,
            _ => {
                return Err(FastPipeError::invalid_parameters(format!(
                    "Cannot parse operation '{}'",
                    s
                )))
            }
        };

        operation.validate()?;
        Ok(operation)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resize { width, height, fit, position, kernel, .. } => {
                write!(f, "resize={}x{}:{:?}:{:?}:{:?}", width, height, fit, position, kernel)
            }
            Self::Rotate { angle, .. } => write!(f, "rotate={}", angle),
            Self::Extract { left, top, width, height } => {
                write!(f, "extract={}:{}:{}:{}", left, top, width, height)
            }
            Self::Sharpen { sigma: Some(sigma), flat, jagged } => write!(
                f,
                "sharpen={}:{}:{}",
                sigma,
                flat.unwrap_or(DEFAULT_SHARPEN_FLAT),
                jagged.unwrap_or(DEFAULT_SHARPEN_JAGGED)
            ),
            Self::Blur { sigma: Some(sigma) } => write!(f, "blur={}", sigma),
            Self::Gamma { value: Some(value) } => write!(f, "gamma={}", value),
            other => f.write_str(other.name()),
        }
    }
}
