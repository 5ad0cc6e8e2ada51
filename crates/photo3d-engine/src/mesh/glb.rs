//! Triangles from binary glTF (`.glb`) containers.
//!
//! Every triangle primitive reachable from the default scene is flattened
//! into world space. glTF is Y-up; positions are turned so +Y becomes +Z,
//! the up axis of slicers.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::{Triangle, Vertex};

const MAGIC: &[u8; 4] = b"glTF";
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;
const MODE_TRIANGLES: u32 = 4;
const COMPONENT_U8: u32 = 5121;
const COMPONENT_U16: u32 = 5123;
const COMPONENT_U32: u32 = 5125;
const COMPONENT_F32: u32 = 5126;

/// Column-major 4x4, as glTF stores `matrix`.
type Matrix = [f64; 16];

const IDENTITY: Matrix = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    scene: Option<usize>,
    #[serde(default)]
    scenes: Vec<Scene>,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    meshes: Vec<Mesh>,
    #[serde(default)]
    accessors: Vec<Accessor>,
    #[serde(default)]
    buffer_views: Vec<BufferView>,
}

#[derive(Debug, Default, Deserialize)]
struct Scene {
    #[serde(default)]
    nodes: Vec<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct Node {
    #[serde(default)]
    children: Vec<usize>,
    mesh: Option<usize>,
    matrix: Option<Matrix>,
    translation: Option<[f64; 3]>,
    rotation: Option<[f64; 4]>,
    scale: Option<[f64; 3]>,
}

#[derive(Debug, Default, Deserialize)]
struct Mesh {
    #[serde(default)]
    primitives: Vec<Primitive>,
}

#[derive(Debug, Default, Deserialize)]
struct Primitive {
    #[serde(default)]
    attributes: HashMap<String, usize>,
    indices: Option<usize>,
    mode: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Accessor {
    buffer_view: Option<usize>,
    #[serde(default)]
    byte_offset: usize,
    component_type: u32,
    count: usize,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BufferView {
    #[serde(default)]
    buffer: usize,
    #[serde(default)]
    byte_offset: usize,
    byte_length: usize,
    byte_stride: Option<usize>,
}

pub(super) fn parse(bytes: &[u8]) -> Result<Vec<Triangle>> {
    let (document, bin) = split_container(bytes)?;
    let roots = match document.scenes.get(document.scene.unwrap_or(0)) {
        Some(scene) => scene.nodes.clone(),
        None => {
            let children = document
                .nodes
                .iter()
                .flat_map(|node| node.children.iter().copied())
                .collect::<HashSet<usize>>();
            (0..document.nodes.len())
                .filter(|index| !children.contains(index))
                .collect()
        }
    };

    let mut triangles = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = roots
        .into_iter()
        .map(|node| (node, IDENTITY))
        .collect::<Vec<(usize, Matrix)>>();
    while let Some((index, parent)) = pending.pop() {
        if !visited.insert(index) {
            continue;
        }
        let node = document
            .nodes
            .get(index)
            .with_context(|| format!("node {index} does not exist"))?;
        let world = multiply(&parent, &local_transform(node));
        if let Some(mesh_index) = node.mesh {
            let mesh = document
                .meshes
                .get(mesh_index)
                .with_context(|| format!("mesh {mesh_index} does not exist"))?;
            for primitive in &mesh.primitives {
                append_primitive(&document, bin, primitive, &world, &mut triangles)?;
            }
        }
        pending.extend(node.children.iter().map(|child| (*child, world)));
    }
    Ok(triangles)
}

fn split_container(bytes: &[u8]) -> Result<(Document, &[u8])> {
    if bytes.len() < 12 || &bytes[..4] != MAGIC {
        bail!("not a binary glTF container");
    }
    let version = read_u32(bytes, 4)?;
    if version != 2 {
        bail!("unsupported glTF container version {version}");
    }
    let mut offset = 12;
    let mut json = None;
    let mut bin: &[u8] = &[];
    while offset + 8 <= bytes.len() {
        let length = read_u32(bytes, offset)? as usize;
        let kind = read_u32(bytes, offset + 4)?;
        let start = offset + 8;
        let chunk = bytes
            .get(start..start + length)
            .with_context(|| format!("glTF chunk at byte {offset} overruns the file"))?;
        match kind {
            CHUNK_JSON => json = Some(chunk),
            CHUNK_BIN => bin = chunk,
            _ => {}
        }
        offset = start + length;
    }
    let json = json.context("glTF container has no JSON chunk")?;
    let document = serde_json::from_slice::<Document>(json).context("invalid glTF JSON chunk")?;
    Ok((document, bin))
}

fn append_primitive(
    document: &Document,
    bin: &[u8],
    primitive: &Primitive,
    world: &Matrix,
    triangles: &mut Vec<Triangle>,
) -> Result<()> {
    let mode = primitive.mode.unwrap_or(MODE_TRIANGLES);
    if mode != MODE_TRIANGLES {
        debug!(mode, "skipping non-triangle glTF primitive");
        return Ok(());
    }
    let Some(position) = primitive.attributes.get("POSITION") else {
        return Ok(());
    };
    let positions = read_positions(document, bin, *position)?
        .into_iter()
        .map(|point| to_z_up(transform_point(world, point)))
        .collect::<Vec<Vertex>>();
    let indices = match primitive.indices {
        Some(accessor) => read_indices(document, bin, accessor)?,
        None => (0..positions.len()).collect(),
    };
    for corners in indices.chunks_exact(3) {
        let corner = |slot: usize| {
            positions
                .get(slot)
                .copied()
                .with_context(|| format!("index {slot} exceeds {} positions", positions.len()))
        };
        triangles.push([corner(corners[0])?, corner(corners[1])?, corner(corners[2])?]);
    }
    Ok(())
}

/// Byte window for an accessor: slice start, stride and element size.
fn accessor_window<'a>(
    document: &Document,
    bin: &'a [u8],
    index: usize,
    element: usize,
) -> Result<(&'a [u8], usize, usize)> {
    let accessor = document
        .accessors
        .get(index)
        .with_context(|| format!("accessor {index} does not exist"))?;
    let view_index = accessor
        .buffer_view
        .with_context(|| format!("accessor {index} has no buffer view"))?;
    let view = document
        .buffer_views
        .get(view_index)
        .with_context(|| format!("buffer view {view_index} does not exist"))?;
    if view.buffer != 0 {
        bail!("buffer view {view_index} points at an external buffer");
    }
    let region = bin
        .get(view.byte_offset..view.byte_offset + view.byte_length)
        .with_context(|| format!("buffer view {view_index} overruns the binary chunk"))?;
    let stride = view.byte_stride.unwrap_or(element);
    let needed = match accessor.count {
        0 => 0,
        count => accessor.byte_offset + stride * (count - 1) + element,
    };
    if needed > region.len() {
        bail!("accessor {index} overruns buffer view {view_index}");
    }
    Ok((&region[accessor.byte_offset.min(region.len())..], stride, accessor.count))
}

fn read_positions(document: &Document, bin: &[u8], index: usize) -> Result<Vec<[f64; 3]>> {
    let accessor = document
        .accessors
        .get(index)
        .with_context(|| format!("accessor {index} does not exist"))?;
    if accessor.component_type != COMPONENT_F32 || accessor.kind != "VEC3" {
        bail!("POSITION accessor {index} is not float VEC3");
    }
    let (region, stride, count) = accessor_window(document, bin, index, 12)?;
    (0..count)
        .map(|element| {
            let base = element * stride;
            Ok([0, 1, 2].map(|axis| {
                let at = base + axis * 4;
                f64::from(f32::from_le_bytes([
                    region[at],
                    region[at + 1],
                    region[at + 2],
                    region[at + 3],
                ]))
            }))
        })
        .collect()
}

fn read_indices(document: &Document, bin: &[u8], index: usize) -> Result<Vec<usize>> {
    let accessor = document
        .accessors
        .get(index)
        .with_context(|| format!("accessor {index} does not exist"))?;
    if accessor.kind != "SCALAR" {
        bail!("index accessor {index} is not SCALAR");
    }
    let size = match accessor.component_type {
        COMPONENT_U8 => 1,
        COMPONENT_U16 => 2,
        COMPONENT_U32 => 4,
        other => bail!("index accessor {index} has component type {other}"),
    };
    let (region, stride, count) = accessor_window(document, bin, index, size)?;
    Ok((0..count)
        .map(|element| {
            let at = element * stride;
            match size {
                1 => usize::from(region[at]),
                2 => usize::from(u16::from_le_bytes([region[at], region[at + 1]])),
                _ => u32::from_le_bytes([region[at], region[at + 1], region[at + 2], region[at + 3]]) as usize,
            }
        })
        .collect())
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let raw = bytes
        .get(offset..offset + 4)
        .with_context(|| format!("glTF container truncated at byte {offset}"))?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn local_transform(node: &Node) -> Matrix {
    if let Some(matrix) = node.matrix {
        return matrix;
    }
    let [tx, ty, tz] = node.translation.unwrap_or([0.0; 3]);
    let [x, y, z, w] = node.rotation.unwrap_or([0.0, 0.0, 0.0, 1.0]);
    let [sx, sy, sz] = node.scale.unwrap_or([1.0; 3]);
    // T * R * S, columns scaled by S.
    [
        (1.0 - 2.0 * (y * y + z * z)) * sx,
        (2.0 * (x * y + z * w)) * sx,
        (2.0 * (x * z - y * w)) * sx,
        0.0,
        (2.0 * (x * y - z * w)) * sy,
        (1.0 - 2.0 * (x * x + z * z)) * sy,
        (2.0 * (y * z + x * w)) * sy,
        0.0,
        (2.0 * (x * z + y * w)) * sz,
        (2.0 * (y * z - x * w)) * sz,
        (1.0 - 2.0 * (x * x + y * y)) * sz,
        0.0,
        tx,
        ty,
        tz,
        1.0,
    ]
}

fn multiply(a: &Matrix, b: &Matrix) -> Matrix {
    let mut out = [0.0; 16];
    for column in 0..4 {
        for row in 0..4 {
            out[column * 4 + row] = (0..4).map(|k| a[k * 4 + row] * b[column * 4 + k]).sum();
        }
    }
    out
}

fn transform_point(m: &Matrix, [x, y, z]: [f64; 3]) -> [f64; 3] {
    [
        m[0] * x + m[4] * y + m[8] * z + m[12],
        m[1] * x + m[5] * y + m[9] * z + m[13],
        m[2] * x + m[6] * y + m[10] * z + m[14],
    ]
}

fn to_z_up([x, y, z]: [f64; 3]) -> Vertex {
    [x as f32, -z as f32, y as f32]
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::parse;

    /// Minimal GLB: one node with `node` JSON (mesh 0 attached) holding a
    /// single indexed triangle.
    pub(crate) fn triangle_glb(node: serde_json::Value) -> Vec<u8> {
        let mut bin = Vec::new();
        for value in [0.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0] {
            bin.extend_from_slice(&value.to_le_bytes());
        }
        for index in [0u16, 1, 2] {
            bin.extend_from_slice(&index.to_le_bytes());
        }
        bin.extend_from_slice(&[0, 0]);
        let mut node = node;
        node["mesh"] = json!(0);
        let document = json!({
            "asset": { "version": "2.0" },
            "scene": 0,
            "scenes": [{ "nodes": [0] }],
            "nodes": [node],
            "meshes": [{ "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1 }] }],
            "accessors": [
                { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3" },
                { "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }
            ],
            "bufferViews": [
                { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
                { "buffer": 0, "byteOffset": 36, "byteLength": 6 }
            ],
            "buffers": [{ "byteLength": bin.len() }]
        });
        let mut json_chunk = document.to_string().into_bytes();
        while json_chunk.len() % 4 != 0 {
            json_chunk.push(b' ');
        }
        let total = 12 + 8 + json_chunk.len() + 8 + bin.len();
        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(b"glTF");
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&(total as u32).to_le_bytes());
        bytes.extend_from_slice(&(json_chunk.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&0x4E4F_534Au32.to_le_bytes());
        bytes.extend_from_slice(&json_chunk);
        bytes.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&0x004E_4942u32.to_le_bytes());
        bytes.extend_from_slice(&bin);
        bytes
    }

    #[test]
    fn indexed_triangle_is_turned_z_up() -> anyhow::Result<()> {
        let triangles = parse(&triangle_glb(json!({})))?;
        assert_eq!(triangles, vec![[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]]);
        Ok(())
    }

    #[test]
    fn node_translation_and_scale_apply_before_axis_swap() -> anyhow::Result<()> {
        let triangles = parse(&triangle_glb(json!({
            "translation": [10.0, 0.0, 0.0],
            "scale": [2.0, 2.0, 2.0]
        })))?;
        assert_eq!(triangles[0][1], [12.0, 0.0, 0.0]);
        assert_eq!(triangles[0][2], [10.0, 0.0, 2.0]);
        Ok(())
    }

    #[test]
    fn foreign_containers_are_rejected() {
        assert!(parse(b"solid nope").is_err());
        let mut wrong_version = triangle_glb(json!({}));
        wrong_version[4] = 1;
        assert!(parse(&wrong_version).is_err());
    }
}
