use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::GenerationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Glb,
    Gltf,
    Fbx,
    Obj,
    Usdz,
    Stl,
}

impl ModelFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ModelFormat::Glb => "glb",
            ModelFormat::Gltf => "gltf",
            ModelFormat::Fbx => "fbx",
            ModelFormat::Obj => "obj",
            ModelFormat::Usdz => "usdz",
            ModelFormat::Stl => "stl",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ModelFormat::Glb => "model/gltf-binary",
            ModelFormat::Gltf => "model/gltf+json",
            ModelFormat::Fbx => "application/octet-stream",
            ModelFormat::Obj => "model/obj",
            ModelFormat::Usdz => "model/vnd.usdz+zip",
            ModelFormat::Stl => "model/stl",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "glb" => Some(ModelFormat::Glb),
            "gltf" => Some(ModelFormat::Gltf),
            "fbx" => Some(ModelFormat::Fbx),
            "obj" => Some(ModelFormat::Obj),
            "usdz" => Some(ModelFormat::Usdz),
            "stl" => Some(ModelFormat::Stl),
            _ => None,
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ModelFormat {
    type Err = GenerationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::from_extension(raw).ok_or_else(|| {
            GenerationError::InvalidRequest(format!("unsupported model format '{}'", raw.trim()))
        })
    }
}

/// Format implied by the final path segment's extension.
///
/// Only the path is inspected; query strings and fragments of signed URLs
/// are ignored so `...?response-content-type=glb` does not count.
pub fn format_from_url(raw_url: &str) -> Option<ModelFormat> {
    let path = match Url::parse(raw_url.trim()) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => raw_url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let last_segment = path.rsplit('/').next().unwrap_or_default();
    let (_, ext) = last_segment.rsplit_once('.')?;
    ModelFormat::from_extension(ext)
}

/// Format detected from the first bytes of a downloaded artifact.
pub fn sniff_format(bytes: &[u8]) -> Option<ModelFormat> {
    if bytes.starts_with(b"glTF") {
        return Some(ModelFormat::Glb);
    }
    if bytes.starts_with(b"Kaydara FBX Binary") {
        return Some(ModelFormat::Fbx);
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return Some(ModelFormat::Usdz);
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]);
    let trimmed = head.trim_start();
    if trimmed.starts_with('{') && trimmed.contains("\"asset\"") {
        return Some(ModelFormat::Gltf);
    }
    if trimmed.starts_with("solid") && !bytes[..bytes.len().min(80)].contains(&0) {
        return Some(ModelFormat::Stl);
    }
    if is_binary_stl(bytes) {
        return Some(ModelFormat::Stl);
    }
    if trimmed
        .lines()
        .take(20)
        .any(|line| line.starts_with("v ") || line.starts_with("mtllib") || line.starts_with("o "))
    {
        return Some(ModelFormat::Obj);
    }
    None
}

fn is_binary_stl(bytes: &[u8]) -> bool {
    if bytes.len() < 84 {
        return false;
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    count > 0 && bytes.len() == 84 + count * 50
}
