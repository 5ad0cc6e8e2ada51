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
use photo3d_contracts::views::ViewAngle;
use photo3d_contracts::{GenerationError, GenerationResult};

use super::{
    estimated_seconds, image_part, require_images, resolve_face_count, InputImage, ProviderAdapter,
};
use crate::config::ApiKeyCredential;
use crate::http::{
    build_http_client, download_bytes, f64_field, push_unique_warning, send_json, str_field,
    DEFAULT_HTTP_TIMEOUT,
};

const NAME: &str = "tripo";
const DEFAULT_API_BASE: &str = "https://api.tripo3d.ai/v2/openapi";
const FACE_TABLE: [(QualityTier, u32); 3] = [
    (QualityTier::Low, 10_000),
    (QualityTier::Medium, 50_000),
    (QualityTier::High, 150_000),
];
/// Slot order of `multiview_to_model` files.
const MULTIVIEW_SLOTS: [ViewAngle; 4] = [
    ViewAngle::Front,
    ViewAngle::Left,
    ViewAngle::Back,
    ViewAngle::Right,
];
/// Output keys in preference order.
const OUTPUT_KEYS: [&str; 3] = ["pbr_model", "model", "base_model"];

pub struct TripoAdapter {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl TripoAdapter {
    pub fn static_capabilities() -> ProviderCapabilities {
        ProviderCapabilities {
            supports_multi_view: true,
            supports_pbr: true,
            max_input_images: MULTIVIEW_SLOTS.len(),
            min_face_count: Some(1_000),
            max_face_count: Some(500_000),
            supported_formats: vec![ModelFormat::Glb],
            estimated_seconds: estimated_seconds([45, 90, 180]),
        }
    }

    pub fn new(credential: &ApiKeyCredential) -> GenerationResult<Self> {
        let api_key = credential.api_key.clone().ok_or_else(|| {
            GenerationError::Configuration("tripo provider requires TRIPO_API_KEY".to_string())
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

    fn upload(&self, image: &InputImage, index: usize) -> GenerationResult<Value> {
        let form = MultipartForm::new().part("file", image_part(image, index)?);
        let response = send_json(
            NAME,
            self.http
                .post(format!("{}/upload", self.api_base))
                .bearer_auth(&self.api_key)
                .multipart(form),
        )?;
        let data = unwrap_envelope(response)?;
        let token = str_field(&data, &["image_token", "file_token"]).ok_or_else(|| {
            GenerationError::provider_internal(NAME, format!("upload returned no image token: {data}"))
        })?;
        Ok(json!({ "type": image.extension(), "file_token": token }))
    }

    fn create_task(&self, mut body: Value, options: &GenerationOptions) -> GenerationResult<SubmittedTask> {
        let mut warnings = Vec::new();
        let (_, faces) = resolve_face_count(options, &FACE_TABLE, &self.capabilities(), &mut warnings);
        body["face_limit"] = json!(faces);
        body["texture"] = json!(true);
        body["pbr"] = json!(options.enable_pbr);
        if let Some(format) = options.format.filter(|format| *format != ModelFormat::Glb) {
            push_unique_warning(
                &mut warnings,
                format!("tripo delivers GLB; requested {format} is not converted"),
            );
        }
        let response = send_json(
            NAME,
            self.http
                .post(format!("{}/task", self.api_base))
                .bearer_auth(&self.api_key)
                .json(&body),
        )?;
        let data = unwrap_envelope(response)?;
        let task_id = str_field(&data, &["task_id"]).ok_or_else(|| {
            GenerationError::provider_internal(NAME, format!("task creation returned no task_id: {data}"))
        })?;
        debug!(%task_id, kind = %body["type"], "tripo task created");
        Ok(SubmittedTask {
            task_id: task_id.to_string(),
            polling_credential: None,
            warnings,
        })
    }

    fn fetch_task(&self, task_id: &str) -> GenerationResult<Value> {
        let response = send_json(
            NAME,
            self.http
                .get(format!("{}/task/{task_id}", self.api_base))
                .bearer_auth(&self.api_key),
        )?;
        unwrap_envelope(response)
    }

    /// Four fixed slots; views the caller did not supply stay empty objects.
    pub(crate) fn multiview_files(tokens: &[(Option<ViewAngle>, Value)]) -> GenerationResult<Vec<Value>> {
        let mut slots = vec![json!({}); MULTIVIEW_SLOTS.len()];
        let mut unlabelled = Vec::new();
        for (view, file) in tokens {
            match view.and_then(|view| MULTIVIEW_SLOTS.iter().position(|slot| *slot == view)) {
                Some(index) => slots[index] = file.clone(),
                None => unlabelled.push(file.clone()),
            }
        }
        for file in unlabelled {
            match slots.iter().position(|slot| slot.as_object().map(|map| map.is_empty()).unwrap_or(false)) {
                Some(index) => slots[index] = file,
                None => {
                    return Err(GenerationError::InvalidRequest(
                        "tripo multiview accepts one image per front/left/back/right slot".to_string(),
                    ))
                }
            }
        }
        if slots[0].as_object().map(|map| map.is_empty()).unwrap_or(true) {
            return Err(GenerationError::InvalidRequest(
                "tripo multiview requires a front image".to_string(),
            ));
        }
        Ok(slots)
    }

    pub(crate) fn parse_status(data: &Value) -> TaskStatusResult {
        let raw = str_field(data, &["status"]).unwrap_or_default().to_ascii_lowercase();
        match raw.as_str() {
            "success" => TaskStatusResult::new(TaskStatus::Completed).with_progress(Some(100.0)),
            "failed" | "cancelled" | "banned" | "expired" | "unknown" => {
                TaskStatusResult::failed(format!("task {raw}"))
            }
            "running" => {
                TaskStatusResult::new(TaskStatus::Processing).with_progress(f64_field(data, "progress"))
            }
            _ => TaskStatusResult::new(TaskStatus::Pending).with_progress(f64_field(data, "progress")),
        }
    }

    pub(crate) fn parse_downloads(data: &Value) -> DownloadResult {
        let mut result = DownloadResult::default();
        let Some(output) = data.get("output") else {
            return result;
        };
        for key in OUTPUT_KEYS {
            if let Some(url) = str_field(output, &[key]) {
                if result.files.iter().any(|file| file.url == url) {
                    continue;
                }
                result.files.push(DownloadFile::new(url, key, None));
            }
        }
        result.thumbnail_url = str_field(output, &["rendered_image"]).map(str::to_string);
        result
    }
}

/// Tripo wraps every answer as `{"code": 0, "data": {...}}`; a non-zero
/// code is a failure even on HTTP 200.
pub(crate) fn unwrap_envelope(response: Value) -> GenerationResult<Value> {
    let code = response.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(response.get("data").cloned().unwrap_or(Value::Null));
    }
    let message = str_field(&response, &["message", "suggestion"])
        .unwrap_or("request failed")
        .to_string();
    let detail = format!("code {code}: {message}");
    let provider = NAME.to_string();
    Err(match code {
        2010 => GenerationError::InsufficientProviderCredit { provider, message: detail },
        _ if mentions_insufficient_credit(&message) => {
            GenerationError::InsufficientProviderCredit { provider, message: detail }
        }
        1001 | 1002 => GenerationError::Unauthenticated { provider, message: detail },
        2000 => GenerationError::RateLimited { provider, message: detail },
        2001..=2009 => GenerationError::InvalidRequest(detail),
        _ => GenerationError::ProviderInternal { provider, message: detail },
    })
}

impl ProviderAdapter for TripoAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Tripo
    }

    fn generate_from_image(
        &self,
        image: &InputImage,
        options: &GenerationOptions,
    ) -> GenerationResult<SubmittedTask> {
        let file = self.upload(image, 0)?;
        self.create_task(json!({ "type": "image_to_model", "file": file }), options)
    }

    fn generate_from_multiple_images(
        &self,
        images: &[InputImage],
        options: &GenerationOptions,
    ) -> GenerationResult<SubmittedTask> {
        require_images(ProviderKind::Tripo, images, self.capabilities().max_input_images)?;
        if images.len() == 1 {
            return self.generate_from_image(&images[0], options);
        }
        let mut tokens = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            tokens.push((image.view, self.upload(image, index)?));
        }
        let files = Self::multiview_files(&tokens)?;
        self.create_task(json!({ "type": "multiview_to_model", "files": files }), options)
    }

    fn check_status(
        &self,
        task_id: &str,
        _polling_credential: Option<&str>,
    ) -> GenerationResult<TaskStatusResult> {
        Ok(Self::parse_status(&self.fetch_task(task_id)?))
    }

    fn get_download_urls(
        &self,
        task_id: &str,
        _required_format: Option<ModelFormat>,
    ) -> GenerationResult<DownloadResult> {
        let data = self.fetch_task(task_id)?;
        let status = Self::parse_status(&data);
        if status.status != TaskStatus::Completed {
            return Err(GenerationError::InvalidRequest(format!(
                "tripo task {task_id} is {} and has no downloads yet",
                status.status
            )));
        }
        Ok(Self::parse_downloads(&data))
    }

    fn download_model(&self, url: &str) -> GenerationResult<Vec<u8>> {
        download_bytes(&self.http, NAME, url)
    }

    fn capabilities(&self) -> ProviderCapabilities {
        Self::static_capabilities()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use photo3d_contracts::tasks::{ModelFormat, TaskStatus};
    use photo3d_contracts::views::ViewAngle;
    use photo3d_contracts::GenerationError;

    use super::{unwrap_envelope, TripoAdapter};

    #[test]
    fn envelope_codes_are_classified() {
        assert!(unwrap_envelope(json!({"code": 0, "data": {"task_id": "t"}})).is_ok());
        assert!(matches!(
            unwrap_envelope(json!({"code": 2010, "message": "not enough credit"})),
            Err(GenerationError::InsufficientProviderCredit { .. })
        ));
        assert!(matches!(
            unwrap_envelope(json!({"code": 1002, "message": "bad key"})),
            Err(GenerationError::Unauthenticated { .. })
        ));
        assert!(matches!(
            unwrap_envelope(json!({"code": 2000, "message": "too many"})),
            Err(GenerationError::RateLimited { .. })
        ));
        assert!(matches!(
            unwrap_envelope(json!({"code": 2003, "message": "bad image"})),
            Err(GenerationError::InvalidRequest(_))
        ));
    }

    #[test]
    fn statuses_map_to_shared_states() {
        assert_eq!(
            TripoAdapter::parse_status(&json!({"status": "queued"})).status,
            TaskStatus::Pending
        );
        let running = TripoAdapter::parse_status(&json!({"status": "running", "progress": 35}));
        assert_eq!(running.status, TaskStatus::Processing);
        assert_eq!(running.progress, Some(35));
        assert_eq!(
            TripoAdapter::parse_status(&json!({"status": "success"})).status,
            TaskStatus::Completed
        );
        let banned = TripoAdapter::parse_status(&json!({"status": "banned"}));
        assert_eq!(banned.status, TaskStatus::Failed);
        assert_eq!(banned.error.as_deref(), Some("task banned"));
    }

    #[test]
    fn outputs_prefer_pbr_model_and_skip_duplicates() {
        let data = json!({
            "status": "success",
            "output": {
                "model": "https://tripo.test/m/model.glb?sig=1",
                "pbr_model": "https://tripo.test/m/pbr.glb?sig=1",
                "base_model": "https://tripo.test/m/model.glb?sig=1",
                "rendered_image": "https://tripo.test/m/preview.webp",
            },
        });
        let result = TripoAdapter::parse_downloads(&data);
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.files[0].name, "pbr_model");
        assert_eq!(result.files[0].format, Some(ModelFormat::Glb));
        assert_eq!(result.thumbnail_url.as_deref(), Some("https://tripo.test/m/preview.webp"));
    }

    #[test]
    fn multiview_slots_follow_vendor_order() -> anyhow::Result<()> {
        let tokens = vec![
            (Some(ViewAngle::Back), json!({"file_token": "b"})),
            (Some(ViewAngle::Front), json!({"file_token": "f"})),
            (None, json!({"file_token": "x"})),
        ];
        let slots = TripoAdapter::multiview_files(&tokens)?;
        assert_eq!(slots[0]["file_token"], "f");
        assert_eq!(slots[1]["file_token"], "x");
        assert_eq!(slots[2]["file_token"], "b");
        assert_eq!(slots[3], json!({}));
        Ok(())
    }

    #[test]
    fn multiview_without_front_is_rejected() {
        let tokens = vec![(Some(ViewAngle::Back), json!({"file_token": "b"}))];
        assert!(matches!(
            TripoAdapter::multiview_files(&tokens),
            Err(GenerationError::InvalidRequest(_))
        ));
    }
}
