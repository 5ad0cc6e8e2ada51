//! Single-view calls to the image-generation service.

use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use tracing::debug;

use photo3d_contracts::errors::classify_http_failure;
use photo3d_contracts::palette::extract_colors_from_text;
use photo3d_contracts::views::GeneratedView;
use photo3d_contracts::{GenerationError, GenerationResult};

use crate::config::ImageServiceConfig;
use crate::http::{
    build_http_client, is_retryable_transport_error, push_unique_warning, response_json_or_error,
};

const PROVIDER: &str = "gemini";
const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const SAFETY_FINISH_REASONS: [&str; 6] = [
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "RECITATION",
];

/// One reference-image + prompt call.
#[derive(Debug, Clone, Copy)]
pub struct SingleViewRequest<'a> {
    pub reference_image: &'a [u8],
    pub mime_type: &'a str,
    pub prompt: &'a str,
    pub extract_colors: bool,
    pub expected_color_count: usize,
}

/// Anything that can turn a reference image and a prompt into one view.
pub trait ImageGenerator: Send + Sync {
    fn generate_single_view(&self, request: &SingleViewRequest<'_>) -> GenerationResult<GeneratedView>;
}

pub struct GeminiImageClient {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
    transport_retries: usize,
    retry_backoff: Duration,
}

impl GeminiImageClient {
    pub fn new(config: &ImageServiceConfig) -> GenerationResult<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            GenerationError::Configuration(
                "image service is not configured; set GEMINI_API_KEY or GOOGLE_API_KEY".to_string(),
            )
        })?;
        Ok(Self {
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key,
            model: config.model.clone(),
            http: build_http_client(config.effective_timeout())?,
            transport_retries: config.effective_retries(),
            retry_backoff: config.retry_backoff,
        })
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &SingleViewRequest<'_>) -> Value {
        let modalities = if request.extract_colors {
            json!(["IMAGE", "TEXT"])
        } else {
            json!(["IMAGE"])
        };
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": request.mime_type,
                            "data": BASE64.encode(request.reference_image),
                        }
                    },
                    { "text": request.prompt },
                ],
            }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": modalities,
                "imageConfig": { "aspectRatio": "1:1" },
            },
        })
    }

    fn post_with_transport_retries(
        &self,
        payload: &Value,
        warnings: &mut Vec<String>,
    ) -> GenerationResult<HttpResponse> {
        let endpoint = self.endpoint();
        let mut attempt = 0;
        loop {
            let sent = self
                .http
                .post(&endpoint)
                .header("x-goog-api-key", &self.api_key)
                .json(payload)
                .send();
            match sent {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if !is_retryable_transport_error(&err) || attempt >= self.transport_retries {
                        return Err(GenerationError::provider_internal(
                            PROVIDER,
                            format!("request failed ({endpoint}): {err}"),
                        ));
                    }
                    attempt += 1;
                    push_unique_warning(
                        warnings,
                        format!(
                            "Image service transport retry {attempt}/{} after transient request failure.",
                            self.transport_retries
                        ),
                    );
                    thread::sleep(self.retry_backoff.mul_f64(attempt as f64));
                }
            }
        }
    }
}

impl ImageGenerator for GeminiImageClient {
    fn generate_single_view(&self, request: &SingleViewRequest<'_>) -> GenerationResult<GeneratedView> {
        let payload = Self::build_payload(request);
        let mut warnings = Vec::new();
        let response = self.post_with_transport_retries(&payload, &mut warnings)?;
        let body = response_json_or_error(PROVIDER, response)?;
        let mut view = interpret_response(&body, request.extract_colors, request.expected_color_count)?;
        for warning in warnings {
            push_unique_warning(&mut view.warnings, warning);
        }
        Ok(view)
    }
}

/// Decide what a `generateContent` answer means.
///
/// Checked in order: API error envelope, prompt-level block, safety stop
/// without an image, missing image, success.
pub fn interpret_response(
    payload: &Value,
    extract_colors: bool,
    expected_color_count: usize,
) -> GenerationResult<GeneratedView> {
    if let Some(error) = payload.get("error").filter(|error| !error.is_null()) {
        let code = error.get("code").and_then(Value::as_u64).unwrap_or(500) as u16;
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(classify_http_failure(PROVIDER, code, message));
    }

    if let Some(feedback) = payload.get("promptFeedback") {
        if let Some(reason) = feedback
            .get("blockReason")
            .and_then(Value::as_str)
            .filter(|reason| !reason.trim().is_empty())
        {
            let detail = feedback
                .get("blockReasonMessage")
                .and_then(Value::as_str)
                .map(|message| format!("{reason}: {message}"))
                .unwrap_or_else(|| reason.to_string());
            return Err(GenerationError::ContentBlocked(detail));
        }
    }

    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut image: Option<(Vec<u8>, String)> = None;
    let mut texts: Vec<String> = Vec::new();
    let mut safety_reason: Option<String> = None;

    for candidate in &candidates {
        if let Some(reason) = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .filter(|reason| SAFETY_FINISH_REASONS.contains(reason))
        {
            safety_reason.get_or_insert_with(|| reason.to_string());
        }
        if let Some(blocked) = candidate
            .get("safetyRatings")
            .and_then(Value::as_array)
            .and_then(|ratings| {
                ratings
                    .iter()
                    .find(|rating| rating.get("blocked").and_then(Value::as_bool) == Some(true))
            })
        {
            let category = blocked
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or("SAFETY");
            safety_reason.get_or_insert_with(|| category.to_string());
        }

        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    texts.push(text.to_string());
                }
            }
            if image.is_some() {
                continue;
            }
            let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                continue;
            };
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64.decode(data.as_bytes()).map_err(|err| {
                GenerationError::provider_internal(PROVIDER, format!("image base64 decode failed: {err}"))
            })?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png")
                .to_string();
            image = Some((bytes, mime_type));
        }
    }

    let text = texts.join("\n");
    let Some((image_bytes, mime_type)) = image else {
        if let Some(reason) = safety_reason {
            return Err(GenerationError::ContentBlocked(reason));
        }
        return Err(GenerationError::NoImageReturned {
            partial_text: (!text.is_empty()).then_some(text),
        });
    };

    let mut warnings = Vec::new();
    let color_palette = if extract_colors {
        let extracted = extract_colors_from_text(&text, expected_color_count);
        debug!(
            colors = extracted.colors.len(),
            labeled = extracted.from_labeled_section,
            "extracted view colors"
        );
        if let Some(warning) = extracted.warning {
            push_unique_warning(&mut warnings, format!("Color count mismatch: {warning}."));
        }
        Some(extracted.colors)
    } else {
        None
    };

    Ok(GeneratedView {
        image_bytes,
        mime_type,
        color_palette,
        warnings,
    })
}
