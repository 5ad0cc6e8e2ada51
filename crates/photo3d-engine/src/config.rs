use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use photo3d_contracts::providers::ProviderKind;
use photo3d_contracts::{GenerationError, GenerationResult};

pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_CREDIT_COST: u32 = 10;

/// Top-level engine configuration. Every field has an environment-derived
/// default; a JSON file may override any subset of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub providers: ProviderCredentials,
    pub image_service: ImageServiceConfig,
    pub scheduler: SchedulerConfig,
    pub download: DownloadRetryPolicy,
    pub credit_cost: u32,
    pub default_provider: ProviderKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            providers: ProviderCredentials::default(),
            image_service: ImageServiceConfig::default(),
            scheduler: SchedulerConfig::default(),
            download: DownloadRetryPolicy::default(),
            credit_cost: DEFAULT_CREDIT_COST,
            default_provider: ProviderKind::Meshy,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            providers: ProviderCredentials::from_env(),
            image_service: ImageServiceConfig::from_env(),
            ..Self::default()
        };
        if let Some(provider) = non_empty_env("PHOTO3D_DEFAULT_PROVIDER")
            .and_then(|raw| raw.parse::<ProviderKind>().ok())
        {
            config.default_provider = provider;
        }
        config
    }

    /// Environment defaults overlaid with the fields present in a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let mut base = serde_json::to_value(Self::from_env())?;
        let overlay: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;
        merge_json(&mut base, overlay);
        serde_json::from_value(base)
            .with_context(|| format!("invalid engine config in {}", path.display()))
    }
}

fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeyCredential {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyPairCredential {
    pub key_id: Option<String>,
    pub secret: Option<String>,
    pub api_base: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCredentials {
    pub meshy: ApiKeyCredential,
    pub tripo: ApiKeyCredential,
    pub rodin: ApiKeyCredential,
    pub hunyuan: KeyPairCredential,
    pub hitem3d: KeyPairCredential,
}

impl ProviderCredentials {
    pub fn from_env() -> Self {
        Self {
            meshy: ApiKeyCredential {
                api_key: non_empty_env("MESHY_API_KEY"),
                api_base: api_base_env("MESHY_API_BASE"),
            },
            tripo: ApiKeyCredential {
                api_key: non_empty_env("TRIPO_API_KEY"),
                api_base: api_base_env("TRIPO_API_BASE"),
            },
            rodin: ApiKeyCredential {
                api_key: non_empty_env("RODIN_API_KEY"),
                api_base: api_base_env("RODIN_API_BASE"),
            },
            hunyuan: KeyPairCredential {
                key_id: non_empty_env("HUNYUAN_SECRET_ID")
                    .or_else(|| non_empty_env("TENCENTCLOUD_SECRET_ID")),
                secret: non_empty_env("HUNYUAN_SECRET_KEY")
                    .or_else(|| non_empty_env("TENCENTCLOUD_SECRET_KEY")),
                api_base: api_base_env("HUNYUAN_API_BASE"),
                region: non_empty_env("HUNYUAN_REGION"),
            },
            hitem3d: KeyPairCredential {
                key_id: non_empty_env("HITEM3D_ACCESS_KEY"),
                secret: non_empty_env("HITEM3D_SECRET_KEY"),
                api_base: api_base_env("HITEM3D_API_BASE"),
                region: None,
            },
        }
    }

    /// Names of the missing settings for a provider; empty when usable.
    pub fn missing_for(&self, kind: ProviderKind) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match kind {
            ProviderKind::Meshy if self.meshy.api_key.is_none() => missing.push("MESHY_API_KEY"),
            ProviderKind::Tripo if self.tripo.api_key.is_none() => missing.push("TRIPO_API_KEY"),
            ProviderKind::Rodin if self.rodin.api_key.is_none() => missing.push("RODIN_API_KEY"),
            ProviderKind::Hunyuan => {
                if self.hunyuan.key_id.is_none() {
                    missing.push("HUNYUAN_SECRET_ID");
                }
                if self.hunyuan.secret.is_none() {
                    missing.push("HUNYUAN_SECRET_KEY");
                }
            }
            ProviderKind::Hitem3d => {
                if self.hitem3d.key_id.is_none() {
                    missing.push("HITEM3D_ACCESS_KEY");
                }
                if self.hitem3d.secret.is_none() {
                    missing.push("HITEM3D_SECRET_KEY");
                }
            }
            _ => {}
        }
        missing
    }

    pub fn ensure_configured(&self, kind: ProviderKind) -> GenerationResult<()> {
        let missing = self.missing_for(kind);
        if missing.is_empty() {
            return Ok(());
        }
        Err(GenerationError::Configuration(format!(
            "{kind} provider is not configured; set {}",
            missing.join(" and ")
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageServiceConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub model: String,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    pub transport_retries: usize,
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
}

impl Default for ImageServiceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: None,
            model: DEFAULT_IMAGE_MODEL.to_string(),
            request_timeout: Duration::from_secs(90),
            transport_retries: 2,
            retry_backoff: Duration::from_millis(1200),
        }
    }
}

impl ImageServiceConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            api_key: non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
            api_base: api_base_env("GEMINI_API_BASE"),
            ..Self::default()
        };
        if let Some(model) = non_empty_env("PHOTO3D_IMAGE_MODEL") {
            config.model = model;
        }
        config
    }

    /// Timeout clamped to 15..=300 seconds.
    pub fn effective_timeout(&self) -> Duration {
        self.request_timeout
            .clamp(Duration::from_secs(15), Duration::from_secs(300))
    }

    pub fn effective_retries(&self) -> usize {
        self.transport_retries.min(4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Start offset between consecutive view calls.
    #[serde(with = "duration_ms")]
    pub min_inter_call_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_inter_call_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadRetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
}

impl Default for DownloadRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(3),
        }
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn api_base_env(key: &str) -> Option<String> {
    non_empty_env(key).map(|value| value.trim_end_matches('/').to_string())
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
