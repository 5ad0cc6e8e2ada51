//! Request/response plumbing shared by the image service client and the
//! provider adapters.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use serde_json::{Map, Value};

use photo3d_contracts::errors::{classify_http_failure, truncate_text};
use photo3d_contracts::{GenerationError, GenerationResult};

pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn build_http_client(timeout: Duration) -> GenerationResult<HttpClient> {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| GenerationError::Configuration(format!("http client setup failed: {err}")))
}

/// Send a request and classify transport failures.
pub(crate) fn send(provider: &str, request: RequestBuilder) -> GenerationResult<HttpResponse> {
    request
        .send()
        .map_err(|err| transport_error(provider, anyhow::Error::new(err)))
}

/// Send a request and parse a JSON body, classifying non-2xx answers.
pub(crate) fn send_json(provider: &str, request: RequestBuilder) -> GenerationResult<Value> {
    let response = send(provider, request)?;
    response_json_or_error(provider, response)
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> GenerationResult<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().map_err(|err| {
        GenerationError::provider_internal(provider, format!("response body read failed: {err}"))
    })?;
    if !status.is_success() {
        return Err(classify_http_failure(provider, code, &body));
    }
    serde_json::from_str(&body).map_err(|err| {
        GenerationError::provider_internal(
            provider,
            format!(
                "returned invalid JSON payload ({err}): {}",
                truncate_text(&body, 256)
            ),
        )
    })
}

/// Fetch raw bytes (model artifacts, thumbnails) with the same
/// classification as JSON calls.
pub(crate) fn download_bytes(http: &HttpClient, provider: &str, url: &str) -> GenerationResult<Vec<u8>> {
    let response = send(provider, http.get(url))?;
    let status = response.status();
    if !status.is_success() {
        let code = status.as_u16();
        let body = response.text().unwrap_or_default();
        return Err(classify_http_failure(provider, code, &body));
    }
    response
        .bytes()
        .map(|bytes| bytes.to_vec())
        .map_err(|err| GenerationError::provider_internal(provider, format!("failed reading artifact bytes: {err}")))
}

pub(crate) fn transport_error(provider: &str, err: anyhow::Error) -> GenerationError {
    GenerationError::provider_internal(provider, error_chain_text(&err, 512))
}

pub(crate) fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    tracing::warn!(%message, "generation warning");
    warnings.push(message);
}

pub(crate) fn data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// First non-empty string at any of the given keys.
pub(crate) fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|text| !text.is_empty())
}

pub(crate) fn f64_field(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{data_uri, error_chain_text, f64_field, push_unique_warning, str_field};

    #[test]
    fn error_chain_text_preserves_nested_contexts() {
        let err = anyhow::anyhow!("socket closed")
            .context("read failed")
            .context("meshy poll request failed");
        assert_eq!(
            error_chain_text(&err, 512),
            "meshy poll request failed | caused by: read failed | caused by: socket closed"
        );
    }

    #[test]
    fn warnings_are_deduplicated() {
        let mut warnings = Vec::new();
        push_unique_warning(&mut warnings, "tier fallback".to_string());
        push_unique_warning(&mut warnings, "tier fallback".to_string());
        push_unique_warning(&mut warnings, "  ".to_string());
        assert_eq!(warnings, vec!["tier fallback".to_string()]);
    }

    #[test]
    fn field_helpers_skip_blanks_and_parse_numbers() {
        let value = json!({"a": " ", "b": "task-1", "progress": "42.5", "n": 7});
        assert_eq!(str_field(&value, &["a", "b"]), Some("task-1"));
        assert_eq!(f64_field(&value, "progress"), Some(42.5));
        assert_eq!(f64_field(&value, "n"), Some(7.0));
        assert_eq!(f64_field(&value, "missing"), None);
    }

    #[test]
    fn data_uri_encodes_bytes() {
        assert_eq!(data_uri("image/png", b"abc"), "data:image/png;base64,YWJj");
    }
}
