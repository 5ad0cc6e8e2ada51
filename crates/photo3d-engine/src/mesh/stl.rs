//! STL reading and binary STL writing.

use anyhow::{bail, Context, Result};

use super::{normal_of, Triangle, Vertex};

const HEADER_LEN: usize = 80;
const TRIANGLE_LEN: usize = 50;
const EXPORT_HEADER: &[u8] = b"photo3d optimized binary STL";

pub(super) fn parse(bytes: &[u8]) -> Result<Vec<Triangle>> {
    if is_binary(bytes) {
        parse_binary(bytes)
    } else {
        parse_ascii(bytes)
    }
}

fn is_binary(bytes: &[u8]) -> bool {
    if bytes.len() < HEADER_LEN + 4 {
        return false;
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let sized_right = count
        .checked_mul(TRIANGLE_LEN)
        .and_then(|body| body.checked_add(HEADER_LEN + 4))
        == Some(bytes.len());
    sized_right || !bytes.trim_ascii_start().starts_with(b"solid")
}

fn parse_binary(bytes: &[u8]) -> Result<Vec<Triangle>> {
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let body = &bytes[HEADER_LEN + 4..];
    if body.len() < count.saturating_mul(TRIANGLE_LEN) {
        bail!(
            "binary STL declares {count} triangles but holds {} bytes",
            body.len()
        );
    }
    let read_f32 = |chunk: &[u8], offset: usize| {
        f32::from_le_bytes([
            chunk[offset],
            chunk[offset + 1],
            chunk[offset + 2],
            chunk[offset + 3],
        ])
    };
    Ok(body
        .chunks_exact(TRIANGLE_LEN)
        .take(count)
        .map(|chunk| {
            let mut triangle = [[0.0f32; 3]; 3];
            for (corner, vertex) in triangle.iter_mut().enumerate() {
                for (axis, value) in vertex.iter_mut().enumerate() {
                    // Skip the 12-byte facet normal.
                    *value = read_f32(chunk, 12 + corner * 12 + axis * 4);
                }
            }
            triangle
        })
        .collect())
}

fn parse_ascii(bytes: &[u8]) -> Result<Vec<Triangle>> {
    let text = std::str::from_utf8(bytes).context("ASCII STL is not valid UTF-8")?;
    let mut vertices = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("vertex") {
            continue;
        }
        let mut vertex: Vertex = [0.0; 3];
        for value in vertex.iter_mut() {
            let raw = parts
                .next()
                .with_context(|| format!("line {}: vertex needs three coordinates", line_no + 1))?;
            *value = raw
                .parse::<f32>()
                .with_context(|| format!("line {}: invalid coordinate '{raw}'", line_no + 1))?;
        }
        vertices.push(vertex);
    }
    if vertices.len() % 3 != 0 {
        bail!("ASCII STL has {} vertices, not a multiple of 3", vertices.len());
    }
    Ok(vertices
        .chunks_exact(3)
        .map(|corners| [corners[0], corners[1], corners[2]])
        .collect())
}

/// Binary STL with facet normals recomputed from the winding.
pub fn write_binary(triangles: &[Triangle]) -> Result<Vec<u8>> {
    let count = u32::try_from(triangles.len())
        .context("too many triangles for a binary STL")?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + 4 + triangles.len() * TRIANGLE_LEN);
    let mut header = [b' '; HEADER_LEN];
    header[..EXPORT_HEADER.len()].copy_from_slice(EXPORT_HEADER);
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&count.to_le_bytes());
    for triangle in triangles {
        for value in normal_of(triangle) {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        for vertex in triangle {
            for value in vertex {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        bytes.extend_from_slice(&0u16.to_le_bytes());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::{parse, write_binary};

    #[test]
    fn written_binary_reads_back_with_unit_normals() -> anyhow::Result<()> {
        let triangle = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let bytes = write_binary(&[triangle])?;
        assert_eq!(bytes.len(), 84 + 50);
        assert!(bytes.starts_with(b"photo3d"));
        let normal_z = f32::from_le_bytes([bytes[92], bytes[93], bytes[94], bytes[95]]);
        assert_eq!(normal_z, 1.0);
        assert_eq!(parse(&bytes)?, vec![triangle]);
        Ok(())
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let mut bytes = vec![0u8; 80];
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 50]);
        assert!(parse(&bytes).is_err());
    }
}
