//! Artifact listing with bounded retries.
//!
//! Some vendors report `completed` before their download listing shows the
//! final files. Only an empty listing or a missing required format is
//! retried; every error from the adapter propagates on the spot.

use std::thread;

use serde_json::json;
use tracing::{debug, warn};

use photo3d_contracts::events::{payload, EventWriter};
use photo3d_contracts::tasks::{DownloadResult, ModelFormat};
use photo3d_contracts::{GenerationError, GenerationResult};

use crate::config::DownloadRetryPolicy;
use crate::http::push_unique_warning;
use crate::providers::ProviderAdapter;

#[derive(Debug, Clone)]
pub struct DownloadResolver {
    policy: DownloadRetryPolicy,
    require_format: bool,
    events: Option<EventWriter>,
}

impl DownloadResolver {
    pub fn new(policy: DownloadRetryPolicy) -> Self {
        Self {
            policy,
            require_format: false,
            events: None,
        }
    }

    /// Fail instead of falling back when the required format never shows up.
    pub fn require_format(mut self, strict: bool) -> Self {
        self.require_format = strict;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Listing for a completed task. `max_retries` counts total listing
    /// requests, so the default policy asks at most five times.
    pub fn resolve_downloads(
        &self,
        adapter: &dyn ProviderAdapter,
        task_id: &str,
        required_format: Option<ModelFormat>,
    ) -> GenerationResult<DownloadResult> {
        let attempts = self.policy.max_retries.max(1);
        let mut last = DownloadResult::default();
        for attempt in 1..=attempts {
            let result = adapter.get_download_urls(task_id, required_format)?;
            let reason = if result.is_empty() {
                Some("no files listed yet".to_string())
            } else {
                required_format
                    .filter(|format| result.find(*format).is_none())
                    .map(|format| format!("{format} not listed yet"))
            };
            let Some(reason) = reason else {
                debug!(provider = %adapter.kind(), task_id, attempt, files = result.files.len(), "download listing resolved");
                return Ok(result);
            };
            last = result;
            if attempt == attempts {
                break;
            }
            debug!(provider = %adapter.kind(), task_id, attempt, %reason, "download listing incomplete; retrying");
            if let Some(events) = &self.events {
                events.record(
                    "download_retry",
                    payload(json!({
                        "provider": adapter.kind().as_str(),
                        "task_id": task_id,
                        "attempt": attempt,
                        "max_attempts": attempts,
                        "reason": reason,
                    })),
                );
            }
            thread::sleep(self.policy.retry_delay);
        }

        if last.is_empty() {
            return Err(GenerationError::provider_internal(
                adapter.kind().as_str(),
                format!("task {task_id} completed but listed no files after {attempts} attempts"),
            ));
        }
        let Some(format) = required_format else {
            return Ok(last);
        };
        if self.require_format {
            return Err(GenerationError::provider_internal(
                adapter.kind().as_str(),
                format!("task {task_id} never listed a {format} file after {attempts} attempts"),
            ));
        }
        let available = last
            .files
            .iter()
            .map(|file| file.format.map(|format| format.to_string()).unwrap_or_else(|| "unknown".to_string()))
            .collect::<Vec<String>>()
            .join(", ");
        warn!(provider = %adapter.kind(), task_id, %format, %available, "required format missing; returning available files");
        push_unique_warning(
            &mut last.warnings,
            format!("required format {format} not available; returning {available}"),
        );
        Ok(last)
    }
}
