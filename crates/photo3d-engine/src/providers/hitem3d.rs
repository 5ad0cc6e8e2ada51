use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::blocking::multipart::Form as MultipartForm;
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;
use tracing::{debug, info};

use photo3d_contracts::errors::classify_http_failure;
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
use crate::config::KeyPairCredential;
use crate::http::{
    build_http_client, download_bytes, f64_field, push_unique_warning, send_json, str_field,
    DEFAULT_HTTP_TIMEOUT,
};

const NAME: &str = "hitem3d";
const DEFAULT_API_BASE: &str = "https://api.hitem3d.ai/open-api/v1";
/// Geometry plus texture.
const REQUEST_TYPE_FULL: &str = "3";
const FACE_TABLE: [(QualityTier, u32); 3] = [
    (QualityTier::Low, 100_000),
    (QualityTier::Medium, 300_000),
    (QualityTier::High, 600_000),
];
/// Refresh this long before the vendor's stated expiry.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + TOKEN_EXPIRY_SLACK < self.expires_at
    }
}

pub struct Hitem3dAdapter {
    api_base: String,
    access_key: String,
    secret_key: String,
    token: Mutex<Option<CachedToken>>,
    http: HttpClient,
}

impl Hitem3dAdapter {
    pub fn static_capabilities() -> ProviderCapabilities {
        ProviderCapabilities {
            supports_multi_view: true,
            supports_pbr: false,
            max_input_images: 4,
            min_face_count: Some(100_000),
            max_face_count: Some(2_000_000),
            supported_formats: vec![
                ModelFormat::Glb,
                ModelFormat::Obj,
                ModelFormat::Stl,
                ModelFormat::Fbx,
            ],
            estimated_seconds: estimated_seconds([60, 150, 300]),
        }
    }

    pub fn new(credential: &KeyPairCredential) -> GenerationResult<Self> {
        let (Some(access_key), Some(secret_key)) = (&credential.key_id, &credential.secret) else {
            return Err(GenerationError::Configuration(
                "hitem3d provider requires HITEM3D_ACCESS_KEY and HITEM3D_SECRET_KEY".to_string(),
            ));
        };
        Ok(Self {
            api_base: credential
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            access_key: access_key.clone(),
            secret_key: secret_key.clone(),
            token: Mutex::new(None),
            http: build_http_client(DEFAULT_HTTP_TIMEOUT)?,
        })
    }

    fn access_token(&self) -> GenerationResult<String> {
        let mut cached = self
            .token
            .lock()
            .map_err(|_| GenerationError::provider_internal(NAME, "token cache lock poisoned"))?;
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh(Instant::now())) {
            return Ok(token.value.clone());
        }
        let response = send_json(
            NAME,
            self.http
                .post(format!("{}/auth/token", self.api_base))
                .basic_auth(&self.access_key, Some(&self.secret_key)),
        )?;
        let data = unwrap_envelope(response)?;
        let value = str_field(&data, &["accessToken", "access_token", "token"])
            .ok_or_else(|| GenerationError::provider_internal(NAME, "token exchange returned no token"))?
            .to_string();
        let lifetime = f64_field(&data, "expiresIn")
            .or_else(|| f64_field(&data, "expires_in"))
            .filter(|seconds| *seconds > 0.0)
            .map(|seconds| Duration::from_secs_f64(seconds.min(86_400.0)))
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        info!(lifetime_secs = lifetime.as_secs(), "hitem3d access token refreshed");
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    fn forget_token(&self) {
        if let Ok(mut cached) = self.token.lock() {
            *cached = None;
        }
    }

    /// Run an authenticated call; a rejected token is refreshed once.
    fn authorized<T>(&self, call: impl Fn(&str) -> GenerationResult<T>) -> GenerationResult<T> {
        let token = self.access_token()?;
        match call(&token) {
            Err(GenerationError::Unauthenticated { .. }) => {
                debug!("hitem3d token rejected; refreshing");
                self.forget_token();
                let token = self.access_token()?;
                call(&token)
            }
            other => other,
        }
    }

    pub(crate) fn resolution(tier: QualityTier) -> &'static str {
        match tier {
            QualityTier::Low => "512",
            QualityTier::Medium => "1024",
            QualityTier::High => "1536",
        }
    }

    pub(crate) fn format_code(format: ModelFormat) -> Option<&'static str> {
        match format {
            ModelFormat::Obj => Some("1"),
            ModelFormat::Glb => Some("2"),
            ModelFormat::Stl => Some("3"),
            ModelFormat::Fbx => Some("4"),
            _ => None,
        }
    }

    /// Format the task is submitted with; unsupported requests fall back to glb.
    pub(crate) fn exported_format(requested: Option<ModelFormat>) -> ModelFormat {
        requested
            .filter(|format| Self::format_code(*format).is_some())
            .unwrap_or(ModelFormat::Glb)
    }

    fn submit(&self, images: &[InputImage], options: &GenerationOptions) -> GenerationResult<SubmittedTask> {
        let mut warnings = Vec::new();
        let (tier, faces) = resolve_face_count(options, &FACE_TABLE, &self.capabilities(), &mut warnings);
        let exported = Self::exported_format(options.format);
        if let Some(requested) = options.format.filter(|requested| *requested != exported) {
            push_unique_warning(
                &mut warnings,
                format!("hitem3d cannot export {requested}; requesting {exported} instead"),
            );
        }
        let format_code = Self::format_code(exported).unwrap_or("2");
        let ordered = ordered_by_view(images);
        let field = if ordered.len() > 1 { "multi_images" } else { "images" };
        let response = self.authorized(|token| {
            let mut form = MultipartForm::new();
            for (index, image) in ordered.iter().enumerate() {
                form = form.part(field, image_part(image, index)?);
            }
            form = form
                .text("request_type", REQUEST_TYPE_FULL)
                .text("resolution", Self::resolution(tier))
                .text("face", faces.to_string())
                .text("format", format_code);
            let response = send_json(
                NAME,
                self.http
                    .post(format!("{}/submit-task", self.api_base))
                    .bearer_auth(token)
                    .multipart(form),
            )?;
            unwrap_envelope(response)
        })?;
        let task_id = str_field(&response, &["task_id", "taskId"]).ok_or_else(|| {
            GenerationError::provider_internal(NAME, format!("submission returned no task id: {response}"))
        })?;
        debug!(%task_id, images = images.len(), "hitem3d task submitted");
        Ok(SubmittedTask {
            task_id: task_id.to_string(),
            polling_credential: None,
            warnings,
        })
    }

    fn query(&self, task_id: &str) -> GenerationResult<Value> {
        self.authorized(|token| {
            let response = send_json(
                NAME,
                self.http
                    .get(format!("{}/query-task", self.api_base))
                    .query(&[("task_id", task_id)])
                    .bearer_auth(token),
            )?;
            unwrap_envelope(response)
        })
    }

    pub(crate) fn parse_status(data: &Value) -> TaskStatusResult {
        let raw = str_field(data, &["state", "status"]).unwrap_or_default().to_ascii_uppercase();
        match raw.as_str() {
            "SUCCEEDED" | "SUCCESS" => TaskStatusResult::new(TaskStatus::Completed).with_progress(Some(100.0)),
            "FAILED" | "FAIL" => TaskStatusResult::failed(
                str_field(data, &["message", "error"]).unwrap_or("task failed").to_string(),
            ),
            "RUNNING" | "PROCESSING" => {
                TaskStatusResult::new(TaskStatus::Processing).with_progress(f64_field(data, "progress"))
            }
            _ => TaskStatusResult::new(TaskStatus::Pending),
        }
    }

    /// One signed URL without an extension, labelled with the format the
    /// task was submitted for.
    pub(crate) fn parse_downloads(data: &Value, required_format: Option<ModelFormat>) -> DownloadResult {
        let mut result = DownloadResult::default();
        if let Some(url) = str_field(data, &["url"]) {
            let format = Self::exported_format(required_format);
            result.files.push(DownloadFile::new(url, "model", Some(format)));
        }
        result.thumbnail_url = str_field(data, &["cover_url"]).map(str::to_string);
        result
    }
}

/// `{"code": 200, "data": ...}` on success; other codes mirror HTTP statuses.
pub(crate) fn unwrap_envelope(response: Value) -> GenerationResult<Value> {
    let code = response.get("code").and_then(Value::as_i64).unwrap_or(200);
    if code == 200 || code == 0 {
        return Ok(response.get("data").cloned().unwrap_or(Value::Null));
    }
    let message = str_field(&response, &["msg", "message"]).unwrap_or("request failed");
    Err(match u16::try_from(code).ok().filter(|status| (400..600).contains(status)) {
        Some(status) => classify_http_failure(NAME, status, message),
        None => GenerationError::provider_internal(NAME, format!("code {code}: {message}")),
    })
}

impl ProviderAdapter for Hitem3dAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hitem3d
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
        require_images(ProviderKind::Hitem3d, images, self.capabilities().max_input_images)?;
        self.submit(images, options)
    }

    fn check_status(
        &self,
        task_id: &str,
        _polling_credential: Option<&str>,
    ) -> GenerationResult<TaskStatusResult> {
        Ok(Self::parse_status(&self.query(task_id)?))
    }

    fn get_download_urls(
        &self,
        task_id: &str,
        required_format: Option<ModelFormat>,
    ) -> GenerationResult<DownloadResult> {
        let data = self.query(task_id)?;
        let status = Self::parse_status(&data);
        if status.status != TaskStatus::Completed {
            return Err(GenerationError::InvalidRequest(format!(
                "hitem3d task {task_id} is {} and has no downloads yet",
                status.status
            )));
        }
        Ok(Self::parse_downloads(&data, required_format))
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
    use std::time::{Duration, Instant};

    use serde_json::json;

    use photo3d_contracts::providers::QualityTier;
    use photo3d_contracts::tasks::{ModelFormat, TaskStatus};
    use photo3d_contracts::GenerationError;

    use super::{unwrap_envelope, CachedToken, Hitem3dAdapter};

    #[test]
    fn token_is_refreshed_before_expiry() {
        let now = Instant::now();
        let fresh = CachedToken {
            value: "t".to_string(),
            expires_at: now + Duration::from_secs(600),
        };
        let stale = CachedToken {
            value: "t".to_string(),
            expires_at: now + Duration::from_secs(30),
        };
        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
    }

    #[test]
    fn envelope_codes_follow_http_classification() {
        assert!(unwrap_envelope(json!({"code": 200, "data": {"task_id": "t"}})).is_ok());
        assert!(matches!(
            unwrap_envelope(json!({"code": 401, "msg": "token expired"})),
            Err(GenerationError::Unauthenticated { .. })
        ));
        assert!(matches!(
            unwrap_envelope(json!({"code": 402, "msg": "balance"})),
            Err(GenerationError::InsufficientProviderCredit { .. })
        ));
        assert!(matches!(
            unwrap_envelope(json!({"code": 50010, "msg": "engine down"})),
            Err(GenerationError::ProviderInternal { .. })
        ));
    }

    #[test]
    fn states_map_to_shared_states() {
        assert_eq!(
            Hitem3dAdapter::parse_status(&json!({"state": "QUEUED"})).status,
            TaskStatus::Pending
        );
        assert_eq!(
            Hitem3dAdapter::parse_status(&json!({"state": "RUNNING"})).status,
            TaskStatus::Processing
        );
        assert_eq!(
            Hitem3dAdapter::parse_status(&json!({"state": "SUCCEEDED"})).status,
            TaskStatus::Completed
        );
        let failed = Hitem3dAdapter::parse_status(&json!({"state": "FAILED", "message": "no subject"}));
        assert_eq!(failed.error.as_deref(), Some("no subject"));
    }

    #[test]
    fn extensionless_url_carries_the_submitted_format() {
        let data = json!({
            "state": "SUCCEEDED",
            "url": "https://cdn.hitem3d.test/obj/8f2a?sign=abc",
            "cover_url": "https://cdn.hitem3d.test/cover/8f2a.png",
        });
        let result = Hitem3dAdapter::parse_downloads(&data, Some(ModelFormat::Stl));
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].format, Some(ModelFormat::Stl));
        assert_eq!(
            result.thumbnail_url.as_deref(),
            Some("https://cdn.hitem3d.test/cover/8f2a.png")
        );
        let defaulted = Hitem3dAdapter::parse_downloads(&data, None);
        assert_eq!(defaulted.files[0].format, Some(ModelFormat::Glb));
        let unsupported = Hitem3dAdapter::parse_downloads(&data, Some(ModelFormat::Usdz));
        assert_eq!(unsupported.files[0].format, Some(ModelFormat::Glb));
    }

    #[test]
    fn tiers_and_formats_map_to_vendor_codes() {
        assert_eq!(Hitem3dAdapter::resolution(QualityTier::High), "1536");
        assert_eq!(Hitem3dAdapter::format_code(ModelFormat::Stl), Some("3"));
        assert_eq!(Hitem3dAdapter::format_code(ModelFormat::Usdz), None);
    }
}
