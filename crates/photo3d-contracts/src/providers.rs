use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;
use crate::tasks::ModelFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Meshy,
    Tripo,
    Hunyuan,
    Rodin,
    Hitem3d,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Meshy,
        ProviderKind::Tripo,
        ProviderKind::Hunyuan,
        ProviderKind::Rodin,
        ProviderKind::Hitem3d,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Meshy => "meshy",
            ProviderKind::Tripo => "tripo",
            ProviderKind::Hunyuan => "hunyuan",
            ProviderKind::Rodin => "rodin",
            ProviderKind::Hitem3d => "hitem3d",
        }
    }

    pub fn is_valid(raw: &str) -> bool {
        raw.parse::<ProviderKind>().is_ok()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = GenerationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                GenerationError::Configuration(format!("unknown provider '{}'", raw.trim()))
            })
    }
}

/// Vendor-neutral quality request; each adapter maps it onto its own
/// face-count or resolution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityTier {
    pub const ALL: [QualityTier; 3] = [QualityTier::Low, QualityTier::Medium, QualityTier::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
        }
    }

    /// Parse a caller-supplied tier. Absent or unknown values fall back to
    /// `Medium`; unknown values also return a warning.
    pub fn resolve(raw: Option<&str>) -> (QualityTier, Option<String>) {
        let Some(value) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
            return (QualityTier::default(), None);
        };
        match value.to_ascii_lowercase().as_str() {
            "low" | "draft" | "fast" => (QualityTier::Low, None),
            "medium" | "standard" | "normal" => (QualityTier::Medium, None),
            "high" | "fine" | "ultra" => (QualityTier::High, None),
            _ => (
                QualityTier::default(),
                Some(format!("Unknown quality tier '{value}'; using medium.")),
            ),
        }
    }
}

/// Options shared by every submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub quality: Option<String>,
    pub format: Option<ModelFormat>,
    #[serde(default)]
    pub enable_pbr: bool,
    /// Explicit face budget; overrides the tier table when set.
    pub face_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub supports_multi_view: bool,
    pub supports_pbr: bool,
    pub max_input_images: usize,
    pub min_face_count: Option<u32>,
    pub max_face_count: Option<u32>,
    pub supported_formats: Vec<ModelFormat>,
    /// Rough wall-clock seconds per tier.
    pub estimated_seconds: BTreeMap<QualityTier, u32>,
}

impl ProviderCapabilities {
    pub fn clamp_face_count(&self, requested: u32) -> u32 {
        let lower = self.min_face_count.unwrap_or(0);
        let upper = self.max_face_count.unwrap_or(u32::MAX);
        requested.clamp(lower, upper)
    }
}
