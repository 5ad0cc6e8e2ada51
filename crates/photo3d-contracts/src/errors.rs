use thiserror::Error;

pub type GenerationResult<T> = Result<T, GenerationError>;

/// Shared failure taxonomy for the image service and every 3D provider.
///
/// Adapters classify vendor failures into one of these variants; the
/// orchestration layer never swallows them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("{provider} rejected the credentials: {message}")]
    Unauthenticated { provider: String, message: String },

    #[error("{provider} rate limit reached: {message}")]
    RateLimited { provider: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("content blocked: {0}")]
    ContentBlocked(String),

    #[error("no image returned{}", .partial_text.as_deref().map(|text| format!(" (text: {text})")).unwrap_or_default())]
    NoImageReturned { partial_text: Option<String> },

    #[error("{provider} account has insufficient credit: {message}")]
    InsufficientProviderCredit { provider: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{provider} internal error: {message}")]
    ProviderInternal { provider: String, message: String },
}

impl GenerationError {
    pub fn provider_internal(provider: &str, message: impl Into<String>) -> Self {
        Self::ProviderInternal {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Stable label persisted next to the message in task records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ContentBlocked(_) => "content_blocked",
            Self::NoImageReturned { .. } => "no_image_returned",
            Self::InsufficientProviderCredit { .. } => "insufficient_provider_credit",
            Self::Configuration(_) => "configuration_error",
            Self::ProviderInternal { .. } => "provider_internal_error",
        }
    }

    /// Whether a later attempt (by a caller or an operator) can succeed
    /// without changing input or configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ProviderInternal { .. }
        )
    }
}

const CREDIT_MARKERS: [&str; 6] = [
    "insufficient balance",
    "insufficient credit",
    "insufficient funds",
    "not enough credit",
    "balance is not enough",
    "quota exhausted",
];

/// True when a vendor message reports an exhausted account balance.
pub fn mentions_insufficient_credit(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    CREDIT_MARKERS.iter().any(|marker| lowered.contains(marker))
        || (lowered.contains("insufficient") && lowered.contains("balance"))
}

/// Map a non-success HTTP response onto the shared taxonomy.
pub fn classify_http_failure(provider: &str, status: u16, body: &str) -> GenerationError {
    let message = format!("HTTP {status}: {}", truncate_text(body.trim(), 512));
    if status == 402 || mentions_insufficient_credit(body) {
        return GenerationError::InsufficientProviderCredit {
            provider: provider.to_string(),
            message,
        };
    }
    match status {
        401 | 403 => GenerationError::Unauthenticated {
            provider: provider.to_string(),
            message,
        },
        429 => GenerationError::RateLimited {
            provider: provider.to_string(),
            message,
        },
        400 | 404 | 422 => GenerationError::InvalidRequest(format!("{provider} {message}")),
        _ => GenerationError::provider_internal(provider, message),
    }
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
