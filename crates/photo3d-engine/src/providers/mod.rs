//! Image(s) → 3D model vendors behind one task lifecycle.

mod hitem3d;
mod hunyuan;
mod meshy;
mod rodin;
mod signing;
mod tripo;

use std::collections::BTreeMap;

use reqwest::blocking::multipart::Part as MultipartPart;
use photo3d_contracts::providers::{
    GenerationOptions, ProviderCapabilities, ProviderKind, QualityTier,
};
use photo3d_contracts::tasks::{
    sniff_format, DownloadResult, ModelFormat, SubmittedTask, TaskStatusResult,
};
use photo3d_contracts::views::ViewAngle;
use photo3d_contracts::{GenerationError, GenerationResult};

pub use hitem3d::Hitem3dAdapter;
pub use hunyuan::HunyuanAdapter;
pub use meshy::MeshyAdapter;
pub use rodin::RodinAdapter;
pub use signing::{RequestSigner, SignableRequest, Tc3Signer};
pub use tripo::TripoAdapter;

/// One input image for a provider submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub view: Option<ViewAngle>,
}

impl InputImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
            view: None,
        }
    }

    pub fn with_view(mut self, view: ViewAngle) -> Self {
        self.view = Some(view);
        self
    }

    pub(crate) fn extension(&self) -> &'static str {
        if self.mime_type.contains("jpeg") || self.mime_type.contains("jpg") {
            "jpg"
        } else if self.mime_type.contains("webp") {
            "webp"
        } else {
            "png"
        }
    }

    pub(crate) fn file_name(&self, index: usize) -> String {
        let ext = self.extension();
        match self.view {
            Some(view) => format!("{view}.{ext}"),
            None => format!("image-{index}.{ext}"),
        }
    }
}

/// Multipart file part for an input image.
pub(crate) fn image_part(image: &InputImage, index: usize) -> GenerationResult<MultipartPart> {
    MultipartPart::bytes(image.bytes.clone())
        .file_name(image.file_name(index))
        .mime_str(&image.mime_type)
        .map_err(|err| {
            GenerationError::InvalidRequest(format!("invalid image mime '{}': {err}", image.mime_type))
        })
}

/// Contract every vendor adapter implements.
///
/// Adapters are stateless with respect to tasks: the caller persists the
/// returned handle and passes it back for polling and downloads.
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn generate_from_image(
        &self,
        image: &InputImage,
        options: &GenerationOptions,
    ) -> GenerationResult<SubmittedTask>;

    fn generate_from_multiple_images(
        &self,
        images: &[InputImage],
        options: &GenerationOptions,
    ) -> GenerationResult<SubmittedTask>;

    fn check_status(
        &self,
        task_id: &str,
        polling_credential: Option<&str>,
    ) -> GenerationResult<TaskStatusResult>;

    fn get_download_urls(
        &self,
        task_id: &str,
        required_format: Option<ModelFormat>,
    ) -> GenerationResult<DownloadResult>;

    fn download_model(&self, url: &str) -> GenerationResult<Vec<u8>>;

    fn capabilities(&self) -> ProviderCapabilities;

    fn supported_formats(&self) -> Vec<ModelFormat> {
        self.capabilities().supported_formats
    }
}

/// Face budget for a request: explicit override, else the adapter's tier
/// table, clamped to what the vendor accepts.
pub(crate) fn resolve_face_count(
    options: &GenerationOptions,
    table: &[(QualityTier, u32)],
    capabilities: &ProviderCapabilities,
    warnings: &mut Vec<String>,
) -> (QualityTier, u32) {
    let (tier, warning) = QualityTier::resolve(options.quality.as_deref());
    if let Some(warning) = warning {
        crate::http::push_unique_warning(warnings, warning);
    }
    let from_table = table
        .iter()
        .find(|(candidate, _)| *candidate == tier)
        .or_else(|| table.iter().find(|(candidate, _)| *candidate == QualityTier::Medium))
        .map(|(_, faces)| *faces)
        .unwrap_or(30_000);
    let requested = options.face_count.unwrap_or(from_table);
    (tier, capabilities.clamp_face_count(requested))
}

pub(crate) fn estimated_seconds(values: [u32; 3]) -> BTreeMap<QualityTier, u32> {
    QualityTier::ALL.into_iter().zip(values).collect()
}

pub(crate) fn require_images(provider: ProviderKind, images: &[InputImage], max: usize) -> GenerationResult<()> {
    if images.is_empty() {
        return Err(GenerationError::InvalidRequest(format!(
            "{provider} submission needs at least one image"
        )));
    }
    if images.len() > max {
        return Err(GenerationError::InvalidRequest(format!(
            "{provider} accepts at most {max} images, got {}",
            images.len()
        )));
    }
    Ok(())
}

/// Order images by canonical view angle, unlabelled images last in their
/// given order; vendors that key images by position expect front first.
pub(crate) fn ordered_by_view(images: &[InputImage]) -> Vec<&InputImage> {
    let mut ordered = images.iter().collect::<Vec<&InputImage>>();
    ordered.sort_by_key(|image| image.view.map(|view| view as u8).unwrap_or(u8::MAX));
    ordered
}

/// Attach a sniffed format to an artifact when its URL did not name one.
pub fn detect_artifact_format(bytes: &[u8], listed: Option<ModelFormat>) -> Option<ModelFormat> {
    listed.or_else(|| sniff_format(bytes))
}
