//! Wavefront OBJ geometry: `v` positions and `f` polygons, fan-triangulated.

use anyhow::{bail, Context, Result};

use super::{Triangle, Vertex};

pub(super) fn parse(bytes: &[u8]) -> Result<Vec<Triangle>> {
    let text = String::from_utf8_lossy(bytes);
    let mut positions: Vec<Vertex> = Vec::new();
    let mut triangles = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("v") => {
                let mut vertex: Vertex = [0.0; 3];
                for value in vertex.iter_mut() {
                    let raw = parts
                        .next()
                        .with_context(|| format!("line {}: vertex needs three coordinates", line_no + 1))?;
                    *value = raw
                        .parse::<f32>()
                        .with_context(|| format!("line {}: invalid coordinate '{raw}'", line_no + 1))?;
                }
                positions.push(vertex);
            }
            Some("f") => {
                let corners = parts
                    .map(|corner| resolve_index(corner, positions.len()))
                    .collect::<Result<Vec<usize>>>()
                    .with_context(|| format!("line {}: invalid face", line_no + 1))?;
                if corners.len() < 3 {
                    bail!("line {}: face needs at least three corners", line_no + 1);
                }
                for pair in corners[1..].windows(2) {
                    triangles.push([positions[corners[0]], positions[pair[0]], positions[pair[1]]]);
                }
            }
            _ => {}
        }
    }
    Ok(triangles)
}

/// `7`, `7/2/3`, `7//3` or a negative index counted from the end.
fn resolve_index(corner: &str, known: usize) -> Result<usize> {
    let raw = corner.split('/').next().unwrap_or_default();
    let index = raw
        .parse::<i64>()
        .with_context(|| format!("invalid vertex reference '{corner}'"))?;
    let resolved = match index {
        0 => None,
        positive if positive > 0 => usize::try_from(positive - 1).ok(),
        negative => i64::try_from(known).ok().and_then(|len| usize::try_from(len + negative).ok()),
    };
    match resolved {
        Some(slot) if slot < known => Ok(slot),
        _ => bail!("vertex reference '{corner}' is out of range ({known} vertices)"),
    }
}

#[cfg(test)]
mod tests {
    use super::parse;

    #[test]
    fn quads_are_split_and_references_resolved() -> anyhow::Result<()> {
        let obj = "# square\nv 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nvt 0 0\nf 1/1 2/1 3/1 -1/1\n";
        let triangles = parse(obj.as_bytes())?;
        assert_eq!(triangles.len(), 2);
        assert_eq!(triangles[1], [[0.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn dangling_references_are_rejected() {
        assert!(parse(b"v 0 0 0\nv 1 0 0\nf 1 2 3\n").is_err());
        assert!(parse(b"v 0 0 0\nf 0 1 1\n").is_err());
    }
}
