//! Durable pipeline state and the collaborators that hold it.
//!
//! The engine keeps nothing between calls; every operation loads the
//! pipeline document, acts, and saves it back.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use photo3d_contracts::palette::AggregatedPalette;
use photo3d_contracts::tasks::{GenerationTask, ModelFormat, TaskStatus};
use photo3d_contracts::views::{GenerationMode, ViewAngle};
use photo3d_contracts::GenerationError;

/// Deducts credits before a provider submission and returns them when the
/// provider never accepted the task.
pub trait CreditLedger: Send + Sync {
    fn deduct(&self, pipeline_id: &str, amount: u32, reason: &str) -> Result<()>;
    fn refund(&self, pipeline_id: &str, amount: u32, reason: &str) -> Result<()>;
}

/// Persists one document per pipeline.
pub trait DocumentStore: Send + Sync {
    fn load(&self, pipeline_id: &str) -> Result<Option<PipelineRecord>>;
    fn save(&self, record: &PipelineRecord) -> Result<()>;
}

/// Binary blobs (reference photo, view images, models) keyed by name
/// within a pipeline.
pub trait FileStorage: Send + Sync {
    fn read(&self, pipeline_id: &str, name: &str) -> Result<Vec<u8>>;
    /// Store bytes and return the public location of the stored file.
    fn upload(&self, pipeline_id: &str, name: &str, bytes: &[u8], content_type: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    pub name: String,
    pub mime_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_palette: Option<Vec<String>>,
}

/// Error persisted alongside the pipeline before it is surfaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_error(error: &GenerationError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationState {
    pub task: GenerationTask,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub required_format: Option<ModelFormat>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub model_format: Option<ModelFormat>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    /// Vendor-reported failure of the task itself.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationState {
    pub fn new(task: GenerationTask, required_format: Option<ModelFormat>, warnings: Vec<String>) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            progress: None,
            required_format,
            download_url: None,
            model_format: None,
            thumbnail_url: None,
            error: None,
            warnings,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub pipeline_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub reference_image: Option<StoredImage>,
    #[serde(default)]
    pub mode: Option<GenerationMode>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mesh_views: BTreeMap<ViewAngle, StoredImage>,
    #[serde(default)]
    pub texture_views: BTreeMap<ViewAngle, StoredImage>,
    #[serde(default)]
    pub palette: Option<AggregatedPalette>,
    #[serde(default)]
    pub view_failures: BTreeMap<String, ErrorRecord>,
    #[serde(default)]
    pub generation: Option<GenerationState>,
    /// Most recent operation error, including ones that left the task
    /// itself untouched (rate limits, failed downloads).
    #[serde(default)]
    pub last_error: Option<ErrorRecord>,
}

impl PipelineRecord {
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: pipeline_id.into(),
            created_at: now,
            updated_at: now,
            reference_image: None,
            mode: None,
            description: None,
            mesh_views: BTreeMap::new(),
            texture_views: BTreeMap::new(),
            palette: None,
            view_failures: BTreeMap::new(),
            generation: None,
            last_error: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use photo3d_contracts::providers::ProviderKind;
    use photo3d_contracts::tasks::{GenerationTask, SubmittedTask, TaskStatus};
    use photo3d_contracts::views::ViewAngle;
    use photo3d_contracts::GenerationError;

    use super::{ErrorRecord, GenerationState, PipelineRecord, StoredImage};

    #[test]
    fn record_round_trips_through_json() -> anyhow::Result<()> {
        let mut record = PipelineRecord::new("pipe-1");
        record.mesh_views.insert(
            ViewAngle::Front,
            StoredImage {
                name: "views/mesh-front.png".to_string(),
                mime_type: "image/png".to_string(),
                url: "file:///tmp/pipe-1/views/mesh-front.png".to_string(),
                color_palette: Some(vec!["#FF0000".to_string()]),
            },
        );
        let submitted = SubmittedTask {
            task_id: "task-9".to_string(),
            polling_credential: Some("sub".to_string()),
            warnings: Vec::new(),
        };
        record.generation = Some(GenerationState::new(
            GenerationTask::from_submission(ProviderKind::Rodin, &submitted),
            None,
            Vec::new(),
        ));
        let text = serde_json::to_string(&record)?;
        assert!(text.contains("\"front\""));
        let parsed: PipelineRecord = serde_json::from_str(&text)?;
        assert_eq!(parsed, record);
        assert_eq!(
            parsed.generation.map(|state| state.status),
            Some(TaskStatus::Pending)
        );
        Ok(())
    }

    #[test]
    fn error_record_keeps_taxonomy_code() {
        let record = ErrorRecord::from_error(&GenerationError::ContentBlocked("SAFETY".to_string()));
        assert_eq!(record.code, "content_blocked");
        assert_eq!(record.message, "content blocked: SAFETY");
    }
}
