//! Downloaded model geometry: statistics for the printability report and
//! the optimize pass that prepares a printable binary STL.

mod glb;
mod obj;
mod stl;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use photo3d_contracts::printability::{
    assess_printability, plan_scale, MeshStats, OptimizeOptions, OptimizeReport, PrintabilityReport,
};
use photo3d_contracts::tasks::{sniff_format, ModelFormat};

const DEGENERATE_AREA_EPSILON: f64 = 1e-12;

pub type Vertex = [f32; 3];
pub type Triangle = [Vertex; 3];

#[derive(Debug, Clone)]
pub struct OptimizedMesh {
    pub stl: Vec<u8>,
    pub report: OptimizeReport,
}

/// Triangle soup from a GLB, OBJ or STL file, picked by content.
pub fn load_triangles(bytes: &[u8]) -> Result<Vec<Triangle>> {
    let triangles = match sniff_format(bytes) {
        Some(ModelFormat::Glb) => glb::parse(bytes)?,
        Some(ModelFormat::Obj) => obj::parse(bytes)?,
        Some(ModelFormat::Stl) | None => stl::parse(bytes)?,
        Some(other) => bail!("{other} models cannot be analyzed; export glb, obj or stl"),
    };
    if triangles.is_empty() {
        bail!("model contains no triangles");
    }
    Ok(triangles)
}

pub fn mesh_stats(bytes: &[u8]) -> Result<MeshStats> {
    Ok(stats_for(&load_triangles(bytes)?))
}

pub fn analyze_model_file(path: &Path) -> Result<PrintabilityReport> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let stats = mesh_stats(&bytes).with_context(|| format!("failed parsing model {}", path.display()))?;
    Ok(assess_printability(&stats))
}

/// Remove degenerate faces, scale, then center and ground the model,
/// returning it as binary STL with before and after statistics.
pub fn optimize_stl(bytes: &[u8], options: &OptimizeOptions) -> Result<OptimizedMesh> {
    let triangles = load_triangles(bytes)?;
    let original = stats_for(&triangles);
    let assessment = assess_printability(&original);
    let mut operations = Vec::new();
    let mut warnings = Vec::new();

    let mut kept = triangles
        .iter()
        .filter(|triangle| !is_degenerate(triangle))
        .map(|triangle| triangle.map(|vertex| vertex.map(f64::from)))
        .collect::<Vec<[[f64; 3]; 3]>>();
    operations.push(format!("remove_degenerate_faces:{}", triangles.len() - kept.len()));
    if kept.is_empty() {
        bail!("every face is degenerate; nothing left to export");
    }

    if let Some(step) = plan_scale(bounds(&kept).extents(), options, &mut warnings) {
        let factor = step.factor();
        for point in kept.iter_mut().flatten() {
            *point = point.map(|value| value * factor);
        }
        operations.push(step.operation());
    }

    if options.center {
        let centroid = area_centroid(&kept);
        for point in kept.iter_mut().flatten() {
            for axis in 0..3 {
                point[axis] -= centroid[axis];
            }
        }
        let floor = bounds(&kept).min[2];
        for point in kept.iter_mut().flatten() {
            point[2] -= floor;
        }
        operations.push("center_and_ground".to_string());
    }

    for warning in &warnings {
        warn!(%warning, "mesh optimize");
    }
    let output = kept
        .iter()
        .map(|triangle| triangle.map(|point| point.map(|value| value as f32)))
        .collect::<Vec<Triangle>>();
    let optimized = stats_for(&output);
    info!(
        faces_before = original.face_count,
        faces_after = optimized.face_count,
        operations = operations.len(),
        "mesh optimized"
    );
    Ok(OptimizedMesh {
        stl: stl::write_binary(&output)?,
        report: OptimizeReport {
            original,
            optimized,
            issues: assessment.issues,
            recommendations: assessment.recommendations,
            score: assessment.score,
            operations,
            warnings,
        },
    })
}

pub fn optimize_model_file(input: &Path, output: &Path, options: &OptimizeOptions) -> Result<OptimizeReport> {
    let bytes = fs::read(input).with_context(|| format!("failed reading {}", input.display()))?;
    let optimized =
        optimize_stl(&bytes, options).with_context(|| format!("failed optimizing {}", input.display()))?;
    fs::write(output, &optimized.stl).with_context(|| format!("failed writing {}", output.display()))?;
    Ok(optimized.report)
}

/// Coincident corners share one key; `-0.0` and `0.0` weld together.
fn weld_key(vertex: &Vertex) -> [u32; 3] {
    vertex.map(|value| if value == 0.0 { 0 } else { value.to_bits() })
}

fn is_degenerate(triangle: &Triangle) -> bool {
    let [a, b, c] = triangle.map(|vertex| weld_key(&vertex));
    let [pa, pb, pc] = triangle.map(|vertex| vertex.map(f64::from));
    a == b || b == c || a == c || doubled_area(pa, pb, pc) < DEGENERATE_AREA_EPSILON
}

fn stats_for(triangles: &[Triangle]) -> MeshStats {
    let mut index_of: HashMap<[u32; 3], usize> = HashMap::new();
    let mut edges: HashMap<(usize, usize), u32> = HashMap::new();
    let mut degenerate_faces = 0;
    let mut signed_volume = 0.0;

    for triangle in triangles {
        let mut ids = [0usize; 3];
        for (slot, vertex) in ids.iter_mut().zip(triangle) {
            let next = index_of.len();
            *slot = *index_of.entry(weld_key(vertex)).or_insert(next);
        }
        if is_degenerate(triangle) {
            degenerate_faces += 1;
        }
        for (from, to) in [(ids[0], ids[1]), (ids[1], ids[2]), (ids[2], ids[0])] {
            *edges.entry((from.min(to), from.max(to))).or_insert(0) += 1;
        }
        let [a, b, c] = triangle.map(|vertex| vertex.map(f64::from));
        signed_volume += dot(a, cross(b, c)) / 6.0;
    }

    let widened = triangles
        .iter()
        .map(|triangle| triangle.map(|vertex| vertex.map(f64::from)))
        .collect::<Vec<[[f64; 3]; 3]>>();
    let is_watertight = !edges.is_empty() && edges.values().all(|count| *count == 2);
    MeshStats {
        vertex_count: index_of.len(),
        face_count: triangles.len(),
        extents: bounds(&widened).extents(),
        is_watertight,
        degenerate_faces,
        volume: is_watertight.then_some(signed_volume.abs()),
    }
}

struct Bounds {
    min: [f64; 3],
    max: [f64; 3],
}

impl Bounds {
    fn extents(&self) -> [f64; 3] {
        [0, 1, 2].map(|axis| (self.max[axis] - self.min[axis]).max(0.0))
    }
}

fn bounds(triangles: &[[[f64; 3]; 3]]) -> Bounds {
    let mut min = [f64::MAX; 3];
    let mut max = [f64::MIN; 3];
    for point in triangles.iter().flatten() {
        for axis in 0..3 {
            min[axis] = min[axis].min(point[axis]);
            max[axis] = max[axis].max(point[axis]);
        }
    }
    Bounds { min, max }
}

/// Surface centroid: triangle centers weighted by area.
fn area_centroid(triangles: &[[[f64; 3]; 3]]) -> [f64; 3] {
    let mut weighted = [0.0; 3];
    let mut total = 0.0;
    for [a, b, c] in triangles {
        let area = doubled_area(*a, *b, *c);
        for axis in 0..3 {
            weighted[axis] += area * (a[axis] + b[axis] + c[axis]) / 3.0;
        }
        total += area;
    }
    if total > 0.0 {
        weighted.map(|value| value / total)
    } else {
        weighted
    }
}

pub(crate) fn normal_of(triangle: &Triangle) -> [f32; 3] {
    let [a, b, c] = triangle.map(|vertex| vertex.map(f64::from));
    let normal = cross(sub(b, a), sub(c, a));
    let length = dot(normal, normal).sqrt();
    if length > f64::EPSILON {
        normal.map(|value| (value / length) as f32)
    } else {
        [0.0; 3]
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn doubled_area(a: [f64; 3], b: [f64; 3], c: [f64; 3]) -> f64 {
    let normal = cross(sub(b, a), sub(c, a));
    dot(normal, normal).sqrt()
}
