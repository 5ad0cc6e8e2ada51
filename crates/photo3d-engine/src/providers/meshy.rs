use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use tracing::debug;

use photo3d_contracts::providers::{
    GenerationOptions, ProviderCapabilities, ProviderKind, QualityTier,
};
use photo3d_contracts::tasks::{
    DownloadFile, DownloadResult, ModelFormat, SubmittedTask, TaskStatus, TaskStatusResult,
};
use photo3d_contracts::{GenerationError, GenerationResult};

use super::{estimated_seconds, require_images, resolve_face_count, InputImage, ProviderAdapter};
use crate::config::ApiKeyCredential;
use crate::http::{
    build_http_client, data_uri, download_bytes, f64_field, map_object, send_json, str_field,
    DEFAULT_HTTP_TIMEOUT,
};

const NAME: &str = "meshy";
const DEFAULT_API_BASE: &str = "https://api.meshy.ai/openapi/v1";
/// Task ids of multi-image jobs carry this prefix so polling hits the
/// matching endpoint.
const MULTI_PREFIX: &str = "multi:";
const POLYCOUNT_TABLE: [(QualityTier, u32); 3] = [
    (QualityTier::Low, 10_000),
    (QualityTier::Medium, 30_000),
    (QualityTier::High, 100_000),
];

pub struct MeshyAdapter {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl MeshyAdapter {
    pub fn static_capabilities() -> ProviderCapabilities {
        ProviderCapabilities {
            supports_multi_view: true,
            supports_pbr: true,
            max_input_images: 4,
            min_face_count: Some(100),
            max_face_count: Some(300_000),
            supported_formats: vec![
                ModelFormat::Glb,
                ModelFormat::Fbx,
                ModelFormat::Obj,
                ModelFormat::Usdz,
                ModelFormat::Stl,
            ],
            estimated_seconds: estimated_seconds([60, 120, 240]),
        }
    }

    pub fn new(credential: &ApiKeyCredential) -> GenerationResult<Self> {
        let api_key = credential.api_key.clone().ok_or_else(|| {
            GenerationError::Configuration("meshy provider requires MESHY_API_KEY".to_string())
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

    fn task_endpoint(&self, task_id: &str) -> String {
        match task_id.strip_prefix(MULTI_PREFIX) {
            Some(raw) => format!("{}/multi-image-to-3d/{raw}", self.api_base),
            None => format!("{}/image-to-3d/{task_id}", self.api_base),
        }
    }

    fn base_payload(&self, options: &GenerationOptions) -> (Map<String, Value>, Vec<String>) {
        let mut warnings = Vec::new();
        let (_, polycount) =
            resolve_face_count(options, &POLYCOUNT_TABLE, &self.capabilities(), &mut warnings);
        let payload = json!({
            "ai_model": "latest",
            "topology": "triangle",
            "target_polycount": polycount,
            "should_remesh": true,
            "should_texture": true,
            "enable_pbr": options.enable_pbr,
        });
        (map_object(payload), warnings)
    }

    fn submit(&self, path: &str, payload: Map<String, Value>) -> GenerationResult<String> {
        let endpoint = format!("{}/{path}", self.api_base);
        let response = send_json(
            NAME,
            self.http
                .post(&endpoint)
                .bearer_auth(&self.api_key)
                .json(&Value::Object(payload)),
        )?;
        str_field(&response, &["result", "id"])
            .map(str::to_string)
            .ok_or_else(|| {
                GenerationError::provider_internal(NAME, format!("submission returned no task id: {response}"))
            })
    }

    fn fetch_task(&self, task_id: &str) -> GenerationResult<Value> {
        send_json(
            NAME,
            self.http
                .get(self.task_endpoint(task_id))
                .bearer_auth(&self.api_key),
        )
    }

    pub(crate) fn parse_status(task: &Value) -> TaskStatusResult {
        let raw = str_field(task, &["status"]).unwrap_or_default().to_ascii_uppercase();
        let status = match raw.as_str() {
            "SUCCEEDED" => TaskStatus::Completed,
            "FAILED" | "CANCELED" | "EXPIRED" => TaskStatus::Failed,
            "IN_PROGRESS" => TaskStatus::Processing,
            _ => TaskStatus::Pending,
        };
        if status == TaskStatus::Failed {
            let message = task
                .get("task_error")
                .and_then(|error| str_field(error, &["message"]))
                .map(str::to_string)
                .unwrap_or_else(|| format!("task {}", raw.to_ascii_lowercase()));
            return TaskStatusResult::failed(message);
        }
        TaskStatusResult::new(status).with_progress(f64_field(task, "progress"))
    }

    pub(crate) fn parse_downloads(task: &Value) -> DownloadResult {
        let mut files = Vec::new();
        if let Some(urls) = task.get("model_urls").and_then(Value::as_object) {
            for (key, value) in urls {
                let Some(url) = value.as_str().map(str::trim).filter(|url| !url.is_empty()) else {
                    continue;
                };
                let hint = key.parse::<ModelFormat>().ok();
                files.push(DownloadFile::new(url, format!("model.{key}"), hint));
            }
        }
        DownloadResult {
            files,
            thumbnail_url: str_field(task, &["thumbnail_url"]).map(str::to_string),
            warnings: Vec::new(),
        }
    }
}

impl ProviderAdapter for MeshyAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Meshy
    }

    fn generate_from_image(
        &self,
        image: &InputImage,
        options: &GenerationOptions,
    ) -> GenerationResult<SubmittedTask> {
        let (mut payload, warnings) = self.base_payload(options);
        payload.insert(
            "image_url".to_string(),
            Value::String(data_uri(&image.mime_type, &image.bytes)),
        );
        let task_id = self.submit("image-to-3d", payload)?;
        debug!(%task_id, "meshy single-image task submitted");
        Ok(SubmittedTask {
            task_id,
            polling_credential: None,
            warnings,
        })
    }

    fn generate_from_multiple_images(
        &self,
        images: &[InputImage],
        options: &GenerationOptions,
    ) -> GenerationResult<SubmittedTask> {
        require_images(ProviderKind::Meshy, images, self.capabilities().max_input_images)?;
        if images.len() == 1 {
            return self.generate_from_image(&images[0], options);
        }
        let (mut payload, warnings) = self.base_payload(options);
        let urls = super::ordered_by_view(images)
            .into_iter()
            .map(|image| Value::String(data_uri(&image.mime_type, &image.bytes)))
            .collect::<Vec<Value>>();
        payload.insert("image_urls".to_string(), Value::Array(urls));
        let raw_id = self.submit("multi-image-to-3d", payload)?;
        debug!(task_id = %raw_id, images = images.len(), "meshy multi-image task submitted");
        Ok(SubmittedTask {
            task_id: format!("{MULTI_PREFIX}{raw_id}"),
            polling_credential: None,
            warnings,
        })
    }

    fn check_status(
        &self,
        task_id: &str,
        _polling_credential: Option<&str>,
    ) -> GenerationResult<TaskStatusResult> {
        let task = self.fetch_task(task_id)?;
        Ok(Self::parse_status(&task))
    }

    fn get_download_urls(
        &self,
        task_id: &str,
        _required_format: Option<ModelFormat>,
    ) -> GenerationResult<DownloadResult> {
        let task = self.fetch_task(task_id)?;
        let status = Self::parse_status(&task);
        if status.status != TaskStatus::Completed {
            return Err(GenerationError::InvalidRequest(format!(
                "meshy task {task_id} is {} and has no downloads yet",
                status.status
            )));
        }
        Ok(Self::parse_downloads(&task))
    }

    fn download_model(&self, url: &str) -> GenerationResult<Vec<u8>> {
        download_bytes(&self.http, NAME, url)
    }

    fn capabilities(&self) -> ProviderCapabilities {
        Self::static_capabilities()
    }
}
