use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;

/// Camera perspective of one generated view.
///
/// Variant order is the canonical iteration order used by ordered maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewAngle {
    Front,
    Back,
    Left,
    Right,
    Top,
}

impl ViewAngle {
    pub const ALL: [ViewAngle; 5] = [
        ViewAngle::Front,
        ViewAngle::Back,
        ViewAngle::Left,
        ViewAngle::Right,
        ViewAngle::Top,
    ];

    /// The four side views most providers accept for multi-view input.
    pub const MESH_DEFAULT: [ViewAngle; 4] = [
        ViewAngle::Front,
        ViewAngle::Back,
        ViewAngle::Left,
        ViewAngle::Right,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewAngle::Front => "front",
            ViewAngle::Back => "back",
            ViewAngle::Left => "left",
            ViewAngle::Right => "right",
            ViewAngle::Top => "top",
        }
    }

    /// Where the camera sits relative to the subject, in prompt wording.
    pub fn camera_phrase(&self) -> &'static str {
        match self {
            ViewAngle::Front => "directly in front of the subject, facing it head-on",
            ViewAngle::Back => "directly behind the subject, rotated 180 degrees from the front view",
            ViewAngle::Left => "at the subject's left side, rotated 90 degrees from the front view",
            ViewAngle::Right => "at the subject's right side, rotated 90 degrees from the front view",
            ViewAngle::Top => "directly above the subject, looking straight down",
        }
    }
}

impl fmt::Display for ViewAngle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewAngle {
    type Err = GenerationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "front" => Ok(ViewAngle::Front),
            "back" => Ok(ViewAngle::Back),
            "left" => Ok(ViewAngle::Left),
            "right" => Ok(ViewAngle::Right),
            "top" => Ok(ViewAngle::Top),
            other => Err(GenerationError::InvalidRequest(format!(
                "unknown view angle '{other}'"
            ))),
        }
    }
}

/// What a view image is for: geometry reconstruction or texture reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewKind {
    Mesh,
    Texture,
}

impl ViewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewKind::Mesh => "mesh",
            ViewKind::Texture => "texture",
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Styling applied to every generated view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    /// Flat colour regions and simplified geometry for multi-colour printing.
    #[default]
    Simplified,
    /// Faithful surface detail for single-material or painted prints.
    Detailed,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Simplified => "simplified",
            GenerationMode::Detailed => "detailed",
        }
    }
}

impl FromStr for GenerationMode {
    type Err = GenerationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "simplified" | "simple" => Ok(GenerationMode::Simplified),
            "detailed" | "detail" => Ok(GenerationMode::Detailed),
            other => Err(GenerationError::InvalidRequest(format!(
                "unknown generation mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRequest {
    pub angle: ViewAngle,
    pub kind: ViewKind,
    pub prompt: String,
}

/// One generated view image. Owned by the caller once returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedView {
    pub image_bytes: Vec<u8>,
    pub mime_type: String,
    pub color_palette: Option<Vec<String>>,
    pub warnings: Vec<String>,
}

impl GeneratedView {
    pub fn extension(&self) -> &'static str {
        let lowered = self.mime_type.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            "jpg"
        } else if lowered.contains("webp") {
            "webp"
        } else {
            "png"
        }
    }
}
