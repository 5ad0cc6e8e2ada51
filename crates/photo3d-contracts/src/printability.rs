//! Printability heuristics for generated meshes.
//!
//! Scores start at 5 and lose points per issue, never dropping below 1.

use serde::{Deserialize, Serialize};

pub const MAX_SCORE: u8 = 5;
pub const HIGH_FACE_COUNT: usize = 500_000;
pub const LOW_FACE_COUNT: usize = 100;
/// Larger than a typical consumer print bed, in mm.
pub const LARGE_DIMENSION_MM: f64 = 300.0;
pub const SMALL_DIMENSION_MM: f64 = 10.0;
pub const THIN_DIMENSION_MM: f64 = 1.0;
pub const BED_MARGIN: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshStats {
    pub vertex_count: usize,
    pub face_count: usize,
    /// Bounding-box width, height, depth.
    pub extents: [f64; 3],
    pub is_watertight: bool,
    pub degenerate_faces: usize,
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintabilityReport {
    pub stats: MeshStats,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BedSize {
    pub width: f64,
    pub height: f64,
    pub depth: f64,
}

impl BedSize {
    fn as_array(&self) -> [f64; 3] {
        [self.width, self.height, self.depth]
    }
}

pub fn assess_printability(stats: &MeshStats) -> PrintabilityReport {
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();
    let mut penalty: u8 = 0;

    if !stats.is_watertight {
        issues.push("Mesh is not watertight (has holes or gaps)".to_string());
        recommendations.push("Enable 'Fill Holes' to repair mesh".to_string());
        penalty += 2;
    }

    if stats.degenerate_faces > 0 {
        issues.push(format!(
            "Found {} degenerate faces (zero area)",
            stats.degenerate_faces
        ));
        recommendations.push("Consider mesh cleanup to remove degenerate faces".to_string());
        penalty += 1;
    }

    if stats.face_count > HIGH_FACE_COUNT {
        issues.push(format!(
            "High polygon count ({} faces) may slow printing software",
            stats.face_count
        ));
        recommendations.push("Enable simplification to reduce polygon count".to_string());
        penalty += 1;
    } else if stats.face_count < LOW_FACE_COUNT {
        issues.push(format!("Very low polygon count ({} faces)", stats.face_count));
        recommendations.push("Model may appear faceted when printed".to_string());
        penalty += 1;
    }

    let max_dim = stats.extents.iter().copied().fold(f64::MIN, f64::max);
    let min_dim = stats.extents.iter().copied().fold(f64::MAX, f64::min);
    if max_dim > LARGE_DIMENSION_MM {
        issues.push(format!(
            "Model is large ({max_dim:.1}mm) - may not fit print bed"
        ));
        recommendations.push("Consider scaling down to fit your printer".to_string());
        penalty += 1;
    } else if max_dim < SMALL_DIMENSION_MM {
        issues.push(format!(
            "Model is small ({max_dim:.1}mm) - fine details may not print"
        ));
        recommendations.push("Consider scaling up for better detail".to_string());
    }

    if min_dim < THIN_DIMENSION_MM {
        issues.push(format!("Minimum dimension is very thin ({min_dim:.2}mm)"));
        recommendations.push("Very thin features may not print successfully".to_string());
        penalty += 1;
    }

    PrintabilityReport {
        stats: stats.clone(),
        issues,
        recommendations,
        score: MAX_SCORE.saturating_sub(penalty).max(1),
    }
}

/// Mesh preparation requested before export. Scaling sources are
/// exclusive: a target size wins over a uniform scale, which wins over
/// fitting to a print bed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeOptions {
    #[serde(default)]
    pub target_size: [Option<f64>; 3],
    #[serde(default)]
    pub uniform_scale: Option<f64>,
    #[serde(default)]
    pub print_bed: Option<BedSize>,
    /// Center on the origin and rest the model on z = 0.
    #[serde(default = "default_center")]
    pub center: bool,
}

fn default_center() -> bool {
    true
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            target_size: [None; 3],
            uniform_scale: None,
            print_bed: None,
            center: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub original: MeshStats,
    pub optimized: MeshStats,
    /// Findings on the input mesh, before any operation ran.
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub score: u8,
    /// Applied operations in order, e.g. `fit_to_bed:0.4750`.
    pub operations: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleStep {
    Target(f64),
    Uniform(f64),
    FitToBed(f64),
}

impl ScaleStep {
    pub fn factor(&self) -> f64 {
        match self {
            ScaleStep::Target(factor) | ScaleStep::Uniform(factor) | ScaleStep::FitToBed(factor) => *factor,
        }
    }

    pub fn operation(&self) -> String {
        match self {
            ScaleStep::Target(factor) => format!("scale_to_target:{factor:.4}"),
            ScaleStep::Uniform(factor) => format!("uniform_scale:{factor}"),
            ScaleStep::FitToBed(factor) => format!("fit_to_bed:{factor:.4}"),
        }
    }
}

/// Pick the scale to apply for `options`. Requests that cannot be honoured
/// are skipped with a warning; a model that already fits the bed needs none.
pub fn plan_scale(extents: [f64; 3], options: &OptimizeOptions, warnings: &mut Vec<String>) -> Option<ScaleStep> {
    if options.target_size.iter().any(Option::is_some) {
        let step = target_size_scale(extents, options.target_size).map(ScaleStep::Target);
        if step.is_none() {
            warnings.push("target size ignored: model has no extent along the requested axes".to_string());
        }
        return step;
    }
    if let Some(factor) = options.uniform_scale {
        if factor.is_finite() && factor > 0.0 {
            return Some(ScaleStep::Uniform(factor));
        }
        warnings.push(format!("uniform scale {factor} ignored: must be positive"));
        return None;
    }
    let bed = options.print_bed?;
    fit_to_bed_scale(extents, bed).map(ScaleStep::FitToBed)
}

/// Uniform scale that fits the model inside the bed with a 5% margin.
/// Returns `None` when the model already fits; models are never enlarged.
pub fn fit_to_bed_scale(extents: [f64; 3], bed: BedSize) -> Option<f64> {
    let scale = extents
        .iter()
        .zip(bed.as_array())
        .map(|(extent, limit)| {
            if *extent > 0.0 {
                (limit * BED_MARGIN) / extent
            } else {
                1.0
            }
        })
        .fold(f64::MAX, f64::min);
    (scale < 1.0).then_some(scale)
}

/// Uniform scale that makes the model match the tightest requested
/// dimension while keeping its aspect ratio.
pub fn target_size_scale(extents: [f64; 3], target: [Option<f64>; 3]) -> Option<f64> {
    extents
        .iter()
        .zip(target)
        .filter_map(|(extent, wanted)| match wanted {
            Some(value) if *extent > 0.0 && value > 0.0 => Some(value / extent),
            _ => None,
        })
        .reduce(f64::min)
}
