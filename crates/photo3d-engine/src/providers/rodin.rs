use reqwest::blocking::multipart::Form as MultipartForm;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use tracing::debug;

use photo3d_contracts::errors::mentions_insufficient_credit;
use photo3d_contracts::providers::{
    GenerationOptions, ProviderCapabilities, ProviderKind, QualityTier,
};
use photo3d_contracts::tasks::{
    DownloadFile, DownloadResult, ModelFormat, SubmittedTask, TaskStatus, TaskStatusResult,
};
use photo3d_contracts::{GenerationError, GenerationResult};

use super::{
    estimated_seconds, image_part, ordered_by_view, require_images, resolve_face_count,
    InputImage, ProviderAdapter,
};
use crate::config::ApiKeyCredential;
use crate::http::{
    build_http_client, download_bytes, push_unique_warning, send_json, str_field,
    DEFAULT_HTTP_TIMEOUT,
};

const NAME: &str = "rodin";
const DEFAULT_API_BASE: &str = "https://hyperhuman.deemos.com/api/v2";
const FACE_TABLE: [(QualityTier, u32); 3] = [
    (QualityTier::Low, 8_000),
    (QualityTier::Medium, 18_000),
    (QualityTier::High, 50_000),
];
/// Vendor quality presets and the face budget each one stands for.
const QUALITY_PRESETS: [(&str, u32); 4] = [
    ("extra-low", 4_000),
    ("low", 8_000),
    ("medium", 18_000),
    ("high", 50_000),
];
const GEOMETRY_FORMATS: [ModelFormat; 5] = [
    ModelFormat::Glb,
    ModelFormat::Usdz,
    ModelFormat::Fbx,
    ModelFormat::Obj,
    ModelFormat::Stl,
];
const PREVIEW_EXTENSIONS: [&str; 4] = [".webp", ".png", ".jpg", ".jpeg"];

pub struct RodinAdapter {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl RodinAdapter {
    pub fn static_capabilities() -> ProviderCapabilities {
        ProviderCapabilities {
            supports_multi_view: true,
            supports_pbr: true,
            max_input_images: 5,
            min_face_count: Some(2_000),
            max_face_count: Some(200_000),
            supported_formats: GEOMETRY_FORMATS.to_vec(),
            estimated_seconds: estimated_seconds([40, 70, 120]),
        }
    }

    pub fn new(credential: &ApiKeyCredential) -> GenerationResult<Self> {
        let api_key = credential.api_key.clone().ok_or_else(|| {
            GenerationError::Configuration("rodin provider requires RODIN_API_KEY".to_string())
        })?;
        Ok(Self {
            api_base: credential
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key,
            http: build_http_client(DEFAULT_HTTP_TIMEOUT)?,
        })
    }

    /// Smallest preset that covers the face budget.
    pub(crate) fn quality_preset(faces: u32) -> &'static str {
        QUALITY_PRESETS
            .iter()
            .find(|(_, budget)| faces <= *budget)
            .map(|(name, _)| *name)
            .unwrap_or("high")
    }

    fn post_json(&self, path: &str, body: &Value) -> GenerationResult<Value> {
        let response = send_json(
            NAME,
            self.http
                .post(format!("{}/{path}", self.api_base))
                .bearer_auth(&self.api_key)
                .json(body),
        )?;
        check_error_field(response)
    }

    fn submit(&self, images: &[InputImage], options: &GenerationOptions) -> GenerationResult<SubmittedTask> {
        let mut warnings = Vec::new();
        let (_, faces) = resolve_face_count(options, &FACE_TABLE, &self.capabilities(), &mut warnings);
        let geometry = match options.format {
            Some(format) if GEOMETRY_FORMATS.contains(&format) => format,
            Some(format) => {
                push_unique_warning(
                    &mut warnings,
                    format!("rodin cannot export {format}; requesting glb instead"),
                );
                ModelFormat::Glb
            }
            None => ModelFormat::Glb,
        };
        let mut form = MultipartForm::new();
        for (index, image) in ordered_by_view(images).into_iter().enumerate() {
            form = form.part("images", image_part(image, index)?);
        }
        form = form
            .text("tier", "Regular")
            .text("quality", Self::quality_preset(faces))
            .text("geometry_file_format", geometry.extension())
            .text("material", if options.enable_pbr { "PBR" } else { "Shaded" });
        if let Some(explicit) = options.face_count {
            form = form.text("quality_override", self.capabilities().clamp_face_count(explicit).to_string());
        }
        if images.len() > 1 {
            form = form.text("condition_mode", "concat");
        }
        let response = send_json(
            NAME,
            self.http
                .post(format!("{}/rodin", self.api_base))
                .bearer_auth(&self.api_key)
                .multipart(form),
        )?;
        let submitted = Self::parse_submission(check_error_field(response)?)?;
        debug!(task_id = %submitted.task_id, images = images.len(), "rodin job submitted");
        Ok(SubmittedTask { warnings, ..submitted })
    }

    pub(crate) fn parse_submission(response: Value) -> GenerationResult<SubmittedTask> {
        let task_id = str_field(&response, &["uuid"]).ok_or_else(|| {
            GenerationError::provider_internal(NAME, format!("submission returned no uuid: {response}"))
        })?;
        let subscription_key = response
            .get("jobs")
            .and_then(|jobs| str_field(jobs, &["subscription_key"]))
            .ok_or_else(|| {
                GenerationError::provider_internal(NAME, "submission returned no subscription key")
            })?;
        Ok(SubmittedTask {
            task_id: task_id.to_string(),
            polling_credential: Some(subscription_key.to_string()),
            warnings: Vec::new(),
        })
    }

    /// Rodin splits one submission into several jobs; the task is only as
    /// far along as its slowest job.
    pub(crate) fn aggregate_jobs(response: &Value) -> TaskStatusResult {
        let jobs = response
            .get("jobs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if jobs.is_empty() {
            return TaskStatusResult::new(TaskStatus::Pending);
        }
        let states = jobs
            .iter()
            .map(|job| str_field(job, &["status"]).unwrap_or_default().to_ascii_lowercase())
            .collect::<Vec<String>>();
        let done = states.iter().filter(|state| state.as_str() == "done").count();
        if states.iter().any(|state| state.as_str() == "failed") {
            let failed = states.iter().filter(|state| state.as_str() == "failed").count();
            return TaskStatusResult::failed(format!("{failed} of {} rodin jobs failed", states.len()));
        }
        if done == states.len() {
            return TaskStatusResult::new(TaskStatus::Completed).with_progress(Some(100.0));
        }
        let progress = Some(done as f64 * 100.0 / states.len() as f64);
        if states.iter().any(|state| state.as_str() == "generating") || done > 0 {
            return TaskStatusResult::new(TaskStatus::Processing).with_progress(progress);
        }
        TaskStatusResult::new(TaskStatus::Pending)
    }

    pub(crate) fn parse_downloads(response: &Value) -> DownloadResult {
        let mut result = DownloadResult::default();
        let entries = response
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in &entries {
            let Some(url) = str_field(entry, &["url"]) else {
                continue;
            };
            let name = str_field(entry, &["name"]).unwrap_or("model").to_string();
            let lowered = name.to_ascii_lowercase();
            if PREVIEW_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext)) {
                if result.thumbnail_url.is_none() {
                    result.thumbnail_url = Some(url.to_string());
                }
                continue;
            }
            result.files.push(DownloadFile::new(url, name, None));
        }
        result
    }
}

/// Rodin reports some failures as HTTP 200 with a populated `error`.
pub(crate) fn check_error_field(response: Value) -> GenerationResult<Value> {
    let Some(code) = str_field(&response, &["error"]) else {
        return Ok(response);
    };
    let message = str_field(&response, &["message"]).unwrap_or(code);
    let detail = format!("{code}: {message}");
    let provider = NAME.to_string();
    let upper = code.to_ascii_uppercase();
    Err(if upper.contains("CREDIT") || mentions_insufficient_credit(message) {
        GenerationError::InsufficientProviderCredit { provider, message: detail }
    } else if upper.contains("UNAUTHORIZED") || upper.contains("AUTH") {
        GenerationError::Unauthenticated { provider, message: detail }
    } else if upper.contains("RATE") || upper.contains("TOO_MANY") {
        GenerationError::RateLimited { provider, message: detail }
    } else if upper.contains("INVALID") {
        GenerationError::InvalidRequest(detail)
    } else {
        GenerationError::ProviderInternal { provider, message: detail }
    })
}

impl ProviderAdapter for RodinAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Rodin
    }

    fn generate_from_image(
        &self,
        image: &InputImage,
        options: &GenerationOptions,
    ) -> GenerationResult<SubmittedTask> {
        self.submit(std::slice::from_ref(image), options)
    }

    fn generate_from_multiple_images(
        &self,
        images: &[InputImage],
        options: &GenerationOptions,
    ) -> GenerationResult<SubmittedTask> {
        require_images(ProviderKind::Rodin, images, self.capabilities().max_input_images)?;
        self.submit(images, options)
    }

    fn check_status(
        &self,
        task_id: &str,
        polling_credential: Option<&str>,
    ) -> GenerationResult<TaskStatusResult> {
        let subscription_key = polling_credential.filter(|key| !key.trim().is_empty()).ok_or_else(|| {
            GenerationError::InvalidRequest(format!(
                "rodin task {task_id} cannot be polled without its subscription key"
            ))
        })?;
        let response = self.post_json("status", &json!({ "subscription_key": subscription_key }))?;
        Ok(Self::aggregate_jobs(&response))
    }

    fn get_download_urls(
        &self,
        task_id: &str,
        _required_format: Option<ModelFormat>,
    ) -> GenerationResult<DownloadResult> {
        let response = self.post_json("download", &json!({ "task_uuid": task_id }))?;
        Ok(Self::parse_downloads(&response))
    }

    fn download_model(&self, url: &str) -> GenerationResult<Vec<u8>> {
        download_bytes(&self.http, NAME, url)
    }

    fn capabilities(&self) -> ProviderCapabilities {
        Self::static_capabilities()
    }
}
