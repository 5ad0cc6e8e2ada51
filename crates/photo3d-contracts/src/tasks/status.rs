use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::ProviderKind;

/// Lifecycle of a provider task. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    /// Combine a previously observed status with a freshly polled one.
    ///
    /// Backward reports are ignored and a terminal status is sticky. Skipped
    /// stages (pending straight to completed) are accepted.
    pub fn advance(self, observed: TaskStatus) -> TaskStatus {
        if self.is_terminal() {
            return self;
        }
        if observed.rank() >= self.rank() {
            observed
        } else {
            self
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle a provider returns when it accepts a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedTask {
    pub task_id: String,
    pub polling_credential: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl SubmittedTask {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            polling_credential: None,
            warnings: Vec::new(),
        }
    }
}

/// Persisted identity of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub task_id: String,
    pub provider: ProviderKind,
    pub polling_credential: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GenerationTask {
    pub fn from_submission(provider: ProviderKind, submitted: &SubmittedTask) -> Self {
        Self {
            task_id: submitted.task_id.clone(),
            provider,
            polling_credential: submitted.polling_credential.clone(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusResult {
    pub status: TaskStatus,
    pub progress: Option<u8>,
    pub error: Option<String>,
}

impl TaskStatusResult {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            progress: None,
            error: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<f64>) -> Self {
        self.progress = progress.map(|value| value.clamp(0.0, 100.0).round() as u8);
        self
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            progress: None,
            error: Some(error.into()),
        }
    }
}
