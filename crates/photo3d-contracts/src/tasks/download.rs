use serde::{Deserialize, Serialize};

use super::formats::{format_from_url, ModelFormat};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFile {
    pub url: String,
    pub name: String,
    /// `None` when neither the vendor nor the URL names a format; the
    /// artifact bytes are sniffed after download in that case.
    pub format: Option<ModelFormat>,
}

impl DownloadFile {
    /// Build an entry, inferring the format from the name or URL when the
    /// vendor gives no explicit type.
    pub fn new(url: impl Into<String>, name: impl Into<String>, hint: Option<ModelFormat>) -> Self {
        let url = url.into();
        let name = name.into();
        let format = hint
            .or_else(|| format_from_url(&name))
            .or_else(|| format_from_url(&url));
        Self { url, name, format }
    }
}

/// Final artifacts of a completed task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub files: Vec<DownloadFile>,
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl DownloadResult {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn find(&self, format: ModelFormat) -> Option<&DownloadFile> {
        self.files.iter().find(|file| file.format == Some(format))
    }

    /// The file to fetch: the required format when present, else the first
    /// GLB, else the first listed file.
    pub fn primary(&self, required: Option<ModelFormat>) -> Option<&DownloadFile> {
        required
            .and_then(|format| self.find(format))
            .or_else(|| self.find(ModelFormat::Glb))
            .or_else(|| self.files.first())
    }
}
