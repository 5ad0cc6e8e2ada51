use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
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

use super::signing::{RequestSigner, SignableRequest, Tc3Signer, JSON_CONTENT_TYPE};
use super::{
    estimated_seconds, ordered_by_view, require_images, resolve_face_count, InputImage,
    ProviderAdapter,
};
use crate::config::KeyPairCredential;
use crate::http::{build_http_client, download_bytes, send_json, str_field, DEFAULT_HTTP_TIMEOUT};

const NAME: &str = "hunyuan";
const DEFAULT_API_BASE: &str = "https://ai3d.tencentcloudapi.com";
const DEFAULT_REGION: &str = "ap-guangzhou";
const SERVICE: &str = "ai3d";
const API_VERSION: &str = "2025-05-13";
const SUBMIT_ACTION: &str = "SubmitHunyuanTo3DJob";
const QUERY_ACTION: &str = "QueryHunyuanTo3DJob";
const FACE_TABLE: [(QualityTier, u32); 3] = [
    (QualityTier::Low, 40_000),
    (QualityTier::Medium, 150_000),
    (QualityTier::High, 500_000),
];

pub struct HunyuanAdapter {
    api_base: String,
    host: String,
    region: String,
    signer: Box<dyn RequestSigner>,
    http: HttpClient,
}

impl HunyuanAdapter {
    pub fn static_capabilities() -> ProviderCapabilities {
        ProviderCapabilities {
            supports_multi_view: true,
            supports_pbr: true,
            max_input_images: 5,
            min_face_count: Some(40_000),
            max_face_count: Some(1_500_000),
            supported_formats: vec![
                ModelFormat::Glb,
                ModelFormat::Obj,
                ModelFormat::Fbx,
                ModelFormat::Stl,
                ModelFormat::Usdz,
            ],
            estimated_seconds: estimated_seconds([90, 180, 300]),
        }
    }

    pub fn new(credential: &KeyPairCredential) -> GenerationResult<Self> {
        let (Some(secret_id), Some(secret_key)) = (&credential.key_id, &credential.secret) else {
            return Err(GenerationError::Configuration(
                "hunyuan provider requires HUNYUAN_SECRET_ID and HUNYUAN_SECRET_KEY".to_string(),
            ));
        };
        Self::with_signer(
            credential.api_base.as_deref().unwrap_or(DEFAULT_API_BASE),
            credential.region.as_deref().unwrap_or(DEFAULT_REGION),
            Box::new(Tc3Signer::new(secret_id.clone(), secret_key.clone())),
        )
    }

    pub fn with_signer(
        api_base: &str,
        region: &str,
        signer: Box<dyn RequestSigner>,
    ) -> GenerationResult<Self> {
        let parsed = reqwest::Url::parse(api_base).map_err(|err| {
            GenerationError::Configuration(format!("invalid hunyuan api base '{api_base}': {err}"))
        })?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(GenerationError::Configuration(format!(
                    "hunyuan api base '{api_base}' has no host"
                )))
            }
        };
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            host,
            region: region.to_string(),
            signer,
            http: build_http_client(DEFAULT_HTTP_TIMEOUT)?,
        })
    }

    fn call(&self, action: &str, body: &Value) -> GenerationResult<Value> {
        let payload = serde_json::to_vec(body).map_err(|err| {
            GenerationError::InvalidRequest(format!("failed encoding {action} body: {err}"))
        })?;
        let auth_headers = self.signer.sign(&SignableRequest {
            host: &self.host,
            service: SERVICE,
            payload: &payload,
            timestamp: Utc::now().timestamp(),
        })?;
        let mut request = self
            .http
            .post(format!("{}/", self.api_base))
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header("X-TC-Action", action)
            .header("X-TC-Version", API_VERSION)
            .header("X-TC-Region", &self.region);
        for (name, value) in auth_headers {
            request = request.header(name, value);
        }
        let envelope = send_json(NAME, request.body(payload))?;
        unwrap_envelope(envelope)
    }

    fn query(&self, task_id: &str) -> GenerationResult<Value> {
        self.call(QUERY_ACTION, &json!({ "JobId": task_id }))
    }

    pub(crate) fn submission_body(
        images: &[InputImage],
        options: &GenerationOptions,
        face_count: u32,
    ) -> GenerationResult<Value> {
        let ordered = ordered_by_view(images);
        let Some((main, rest)) = ordered.split_first() else {
            return Err(GenerationError::InvalidRequest(
                "hunyuan submission needs at least one image".to_string(),
            ));
        };
        let mut body = json!({
            "ImageBase64": BASE64.encode(&main.bytes),
            "FaceCount": face_count,
            "EnablePBR": options.enable_pbr,
            "GenerateType": "Normal",
        });
        if !rest.is_empty() {
            let mut views = Vec::with_capacity(rest.len());
            for image in rest {
                let view = match image.view {
                    Some(ViewAngle::Front) | None => {
                        return Err(GenerationError::InvalidRequest(
                            "hunyuan extra images need a distinct non-front view angle".to_string(),
                        ))
                    }
                    Some(view) => view,
                };
                views.push(json!({
                    "ViewType": view.as_str(),
                    "ViewImageBase64": BASE64.encode(&image.bytes),
                }));
            }
            body["MultiViewImages"] = Value::Array(views);
        }
        if let Some(format) = options.format.filter(|format| {
            matches!(format, ModelFormat::Stl | ModelFormat::Usdz | ModelFormat::Fbx)
        }) {
            body["ResultFormat"] = Value::String(format.extension().to_ascii_uppercase());
        }
        Ok(body)
    }

    fn submit(&self, images: &[InputImage], options: &GenerationOptions) -> GenerationResult<SubmittedTask> {
        let mut warnings = Vec::new();
        let (_, faces) = resolve_face_count(options, &FACE_TABLE, &self.capabilities(), &mut warnings);
        let body = Self::submission_body(images, options, faces)?;
        let response = self.call(SUBMIT_ACTION, &body)?;
        let task_id = str_field(&response, &["JobId"]).ok_or_else(|| {
            GenerationError::provider_internal(NAME, format!("submission returned no JobId: {response}"))
        })?;
        debug!(%task_id, images = images.len(), "hunyuan job submitted");
        Ok(SubmittedTask {
            task_id: task_id.to_string(),
            polling_credential: None,
            warnings,
        })
    }

    pub(crate) fn parse_status(response: &Value) -> TaskStatusResult {
        match str_field(response, &["Status"]).unwrap_or_default().to_ascii_uppercase().as_str() {
            "DONE" => TaskStatusResult::new(TaskStatus::Completed).with_progress(Some(100.0)),
            "FAIL" => TaskStatusResult::failed(
                str_field(response, &["ErrorMessage", "ErrorCode"])
                    .unwrap_or("job failed")
                    .to_string(),
            ),
            "RUN" => TaskStatusResult::new(TaskStatus::Processing),
            _ => TaskStatusResult::new(TaskStatus::Pending),
        }
    }

    pub(crate) fn parse_downloads(response: &Value) -> DownloadResult {
        let mut result = DownloadResult::default();
        let entries = response
            .get("ResultFile3Ds")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in &entries {
            let Some(url) = str_field(entry, &["Url"]) else {
                continue;
            };
            let kind = str_field(entry, &["Type"]).unwrap_or_default().to_ascii_lowercase();
            let hint = kind.parse::<ModelFormat>().ok();
            let name = match hint {
                Some(format) => format!("model.{format}"),
                None => format!("model-{}", result.files.len()),
            };
            result.files.push(DownloadFile::new(url, name, hint));
            if result.thumbnail_url.is_none() {
                result.thumbnail_url = str_field(entry, &["PreviewImageUrl"]).map(str::to_string);
            }
        }
        result
    }
}

/// Tencent answers HTTP 200 even for failures; the real outcome sits in
/// `Response.Error`.
pub(crate) fn unwrap_envelope(envelope: Value) -> GenerationResult<Value> {
    let Some(response) = envelope.get("Response") else {
        return Err(GenerationError::provider_internal(
            NAME,
            format!("response has no Response envelope: {envelope}"),
        ));
    };
    if let Some(error) = response.get("Error") {
        let code = str_field(error, &["Code"]).unwrap_or("Unknown");
        let message = str_field(error, &["Message"]).unwrap_or("request failed");
        return Err(classify_envelope_error(code, message));
    }
    Ok(response.clone())
}

pub(crate) fn classify_envelope_error(code: &str, message: &str) -> GenerationError {
    let detail = format!("{code}: {message}");
    let provider = NAME.to_string();
    if mentions_insufficient_credit(message)
        || code.contains("Balance")
        || code.contains("Arrears")
        || code.starts_with("ResourceInsufficient")
    {
        return GenerationError::InsufficientProviderCredit { provider, message: detail };
    }
    if code.starts_with("AuthFailure") || code.starts_with("UnauthorizedOperation") {
        return GenerationError::Unauthenticated { provider, message: detail };
    }
    if code.starts_with("RequestLimitExceeded") || code.starts_with("LimitExceeded") {
        return GenerationError::RateLimited { provider, message: detail };
    }
    if code.contains("ImageIllegal") || code.contains("TextIllegal") {
        return GenerationError::ContentBlocked(detail);
    }
    if code.starts_with("InvalidParameter")
        || code.starts_with("MissingParameter")
        || code.starts_with("UnsupportedOperation")
        || code.starts_with("ResourceNotFound")
    {
        return GenerationError::InvalidRequest(detail);
    }
    GenerationError::ProviderInternal { provider, message: detail }
}

impl ProviderAdapter for HunyuanAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hunyuan
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
        require_images(ProviderKind::Hunyuan, images, self.capabilities().max_input_images)?;
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
        _required_format: Option<ModelFormat>,
    ) -> GenerationResult<DownloadResult> {
        let response = self.query(task_id)?;
        let status = Self::parse_status(&response);
        if status.status != TaskStatus::Completed {
            return Err(GenerationError::InvalidRequest(format!(
                "hunyuan job {task_id} is {} and has no downloads yet",
                status.status
            )));
        }
        Ok(Self::parse_downloads(&response))
    }

    fn download_model(&self, url: &str) -> GenerationResult<Vec<u8>> {
        download_bytes(&self.http, NAME, url)
    }

    fn capabilities(&self) -> ProviderCapabilities {
        Self::static_capabilities()
    }
}
