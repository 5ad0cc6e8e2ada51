//! Caller-facing operations over one pipeline document.
//!
//! Every call loads the pipeline, acts, and saves it back before
//! returning. Provider tasks are never polled in the background; callers
//! re-invoke `check_generation_status` (or use `watch_generation`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use photo3d_contracts::events::{payload, EventWriter};
use photo3d_contracts::palette::AggregatedPalette;
use photo3d_contracts::prompts::{PromptContext, ViewPromptBuilder};
use photo3d_contracts::providers::{GenerationOptions, ProviderKind};
use photo3d_contracts::tasks::{GenerationTask, ModelFormat, TaskStatus, TaskStatusResult};
use photo3d_contracts::views::{GenerationMode, ViewAngle, ViewKind};
use photo3d_contracts::{GenerationError, GenerationResult};

use crate::config::EngineConfig;
use crate::http::{error_chain_text, push_unique_warning};
use crate::image_client::{GeminiImageClient, ImageGenerator};
use crate::providers::{detect_artifact_format, InputImage, ProviderAdapter};
use crate::records::{
    CreditLedger, DocumentStore, ErrorRecord, FileStorage, GenerationState, PipelineRecord,
    StoredImage,
};
use crate::registry::{ProviderRegistry, ProviderSummary};
use crate::resolver::DownloadResolver;
use crate::scheduler::{MultiViewPlan, MultiViewScheduler, ProgressEvent, ViewSet};
use crate::workspace::LocalWorkspace;

const EVENTS_FILE: &str = "events.jsonl";
const COLLABORATOR: &str = "workspace";

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Provider id; the configured default when absent.
    pub provider: Option<String>,
    pub options: GenerationOptions,
    /// Resubmit when the stored generation failed. Pending, processing and
    /// completed generations are always returned as stored.
    pub retry_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub pipeline_id: String,
    pub provider: ProviderKind,
    pub task_id: String,
    pub status: TaskStatus,
    pub warnings: Vec<String>,
    /// Set when an earlier submission was returned instead of a new one.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusOutcome {
    pub pipeline_id: String,
    pub provider: ProviderKind,
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: Option<u8>,
    pub download_url: Option<String>,
    pub model_format: Option<ModelFormat>,
    pub thumbnail_url: Option<String>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl StatusOutcome {
    fn from_state(pipeline_id: &str, state: &GenerationState) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            provider: state.task.provider,
            task_id: state.task.task_id.clone(),
            status: state.status,
            progress: state.progress,
            download_url: state.download_url.clone(),
            model_format: state.model_format,
            thumbnail_url: state.thumbnail_url.clone(),
            error: state.error.clone(),
            warnings: state.warnings.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ViewsRequest {
    pub mode: GenerationMode,
    pub description: Option<String>,
    pub plan: MultiViewPlan,
    /// Colours requested per mesh view; the prompt builder default when
    /// absent.
    pub expected_colors: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewsOutcome {
    pub pipeline_id: String,
    pub mesh_views: BTreeMap<ViewAngle, StoredImage>,
    pub texture_views: BTreeMap<ViewAngle, StoredImage>,
    pub palette: AggregatedPalette,
    /// Keyed `<kind>:<angle>`.
    pub failures: BTreeMap<String, ErrorRecord>,
    pub warnings: Vec<String>,
}

pub struct GenerationService {
    config: EngineConfig,
    registry: Arc<ProviderRegistry>,
    documents: Arc<dyn DocumentStore>,
    storage: Arc<dyn FileStorage>,
    ledger: Arc<dyn CreditLedger>,
    image_generator: Option<Arc<dyn ImageGenerator>>,
    event_root: Option<PathBuf>,
}

impl GenerationService {
    pub fn new(
        config: EngineConfig,
        registry: Arc<ProviderRegistry>,
        documents: Arc<dyn DocumentStore>,
        storage: Arc<dyn FileStorage>,
        ledger: Arc<dyn CreditLedger>,
    ) -> Self {
        Self {
            config,
            registry,
            documents,
            storage,
            ledger,
            image_generator: None,
            event_root: None,
        }
    }

    /// Service whose collaborators all live in one local workspace, with
    /// pipeline events written next to each pipeline document.
    pub fn local(config: EngineConfig, workspace: Arc<LocalWorkspace>) -> Self {
        let registry = Arc::new(ProviderRegistry::new(config.providers.clone()));
        let root = workspace.root().to_path_buf();
        Self::new(
            config,
            registry,
            workspace.clone(),
            workspace.clone(),
            workspace,
        )
        .with_event_root(root)
    }

    /// Replace the image service built from `config.image_service`.
    pub fn with_image_generator(mut self, generator: Arc<dyn ImageGenerator>) -> Self {
        self.image_generator = Some(generator);
        self
    }

    /// Append pipeline events to `<root>/<pipeline_id>/events.jsonl`.
    pub fn with_event_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.event_root = Some(root.into());
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn list_providers(&self) -> Vec<ProviderSummary> {
        self.registry.list()
    }

    pub fn pipeline(&self, pipeline_id: &str) -> GenerationResult<PipelineRecord> {
        self.documents
            .load(pipeline_id)
            .map_err(|err| collaborator_error("failed loading pipeline", err))?
            .ok_or_else(|| GenerationError::InvalidRequest(format!("unknown pipeline '{pipeline_id}'")))
    }

    /// New pipeline holding the uploaded reference photo.
    pub fn create_pipeline(
        &self,
        pipeline_id: Option<&str>,
        reference_image: &[u8],
    ) -> GenerationResult<PipelineRecord> {
        let format = image::guess_format(reference_image).map_err(|err| {
            GenerationError::InvalidRequest(format!("reference photo is not a supported image: {err}"))
        })?;
        let pipeline_id = pipeline_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let existing = self
            .documents
            .load(&pipeline_id)
            .map_err(|err| collaborator_error("failed loading pipeline", err))?;
        if existing.is_some() {
            return Err(GenerationError::InvalidRequest(format!(
                "pipeline '{pipeline_id}' already exists"
            )));
        }

        let extension = format.extensions_str().first().copied().unwrap_or("png");
        let mime_type = format.to_mime_type();
        let name = format!("reference.{extension}");
        let url = self
            .storage
            .upload(&pipeline_id, &name, reference_image, mime_type)
            .map_err(|err| collaborator_error("failed storing reference photo", err))?;

        let mut record = PipelineRecord::new(pipeline_id.as_str());
        record.reference_image = Some(StoredImage {
            name,
            mime_type: mime_type.to_string(),
            url,
            color_palette: None,
        });
        self.save(&record)?;
        info!(pipeline_id = %record.pipeline_id, mime_type, "pipeline created");
        Ok(record)
    }

    /// Submit the pipeline's images to a provider and return without
    /// waiting. A pipeline with a stored generation is never charged or
    /// submitted again unless `retry_failed` applies.
    pub fn start_generation(&self, pipeline_id: &str, request: &StartRequest) -> GenerationResult<StartOutcome> {
        let mut record = self.pipeline(pipeline_id)?;
        let events = self.events(pipeline_id);
        if let Some(state) = &record.generation {
            let resubmit = request.retry_failed && state.status == TaskStatus::Failed;
            if !resubmit {
                debug!(pipeline_id, task_id = %state.task.task_id, status = %state.status, "returning stored generation");
                return Ok(StartOutcome {
                    pipeline_id: pipeline_id.to_string(),
                    provider: state.task.provider,
                    task_id: state.task.task_id.clone(),
                    status: state.status,
                    warnings: state.warnings.clone(),
                    reused: true,
                });
            }
        }

        match self.submit(&record, request) {
            Ok((state, image_count)) => {
                events.record(
                    "generation_submitted",
                    payload(json!({
                        "provider": state.task.provider.as_str(),
                        "task_id": state.task.task_id,
                        "images": image_count,
                        "warnings": state.warnings,
                    })),
                );
                info!(pipeline_id, provider = %state.task.provider, task_id = %state.task.task_id, image_count, "generation submitted");
                let outcome = StartOutcome {
                    pipeline_id: pipeline_id.to_string(),
                    provider: state.task.provider,
                    task_id: state.task.task_id.clone(),
                    status: state.status,
                    warnings: state.warnings.clone(),
                    reused: false,
                };
                record.generation = Some(state);
                record.last_error = None;
                record.touch();
                self.save(&record)?;
                Ok(outcome)
            }
            Err(err) => Err(self.fail(&mut record, &events, "submit", err)),
        }
    }

    fn submit(&self, record: &PipelineRecord, request: &StartRequest) -> GenerationResult<(GenerationState, usize)> {
        let kind = match request.provider.as_deref() {
            Some(raw) => raw.parse::<ProviderKind>()?,
            None => self.config.default_provider,
        };
        let adapter = self.registry.get(kind)?;
        let mut images = self.input_images(record)?;
        let capabilities = adapter.capabilities();
        let mut warnings = Vec::new();

        self.ledger
            .deduct(
                &record.pipeline_id,
                self.config.credit_cost,
                &format!("3d generation via {kind}"),
            )
            .map_err(|err| collaborator_error("credit deduction failed", err))?;

        let submission = if images.len() > 1 && capabilities.supports_multi_view {
            if images.len() > capabilities.max_input_images {
                let message = format!(
                    "{kind} accepts at most {} images; submitting the first {}",
                    capabilities.max_input_images, capabilities.max_input_images
                );
                warn!(pipeline_id = %record.pipeline_id, "{message}");
                push_unique_warning(&mut warnings, message);
                images.truncate(capabilities.max_input_images);
            }
            adapter.generate_from_multiple_images(&images, &request.options)
        } else {
            if images.len() > 1 {
                let message = format!("{kind} takes a single image; submitting the front view only");
                warn!(pipeline_id = %record.pipeline_id, "{message}");
                push_unique_warning(&mut warnings, message);
                images.truncate(1);
            }
            match images.first() {
                Some(image) => adapter.generate_from_image(image, &request.options),
                None => Err(GenerationError::InvalidRequest("no input images".to_string())),
            }
        };
        let submitted = match submission {
            Ok(submitted) => submitted,
            Err(err) => {
                self.refund(record, kind, &err);
                return Err(err);
            }
        };

        for warning in &submitted.warnings {
            push_unique_warning(&mut warnings, warning.clone());
        }
        let task = GenerationTask::from_submission(kind, &submitted);
        Ok((GenerationState::new(task, request.options.format, warnings), images.len()))
    }

    /// Return the submission charge when the provider never accepted the
    /// task. A failed refund is logged and the submit error still wins.
    fn refund(&self, record: &PipelineRecord, kind: ProviderKind, err: &GenerationError) {
        let reason = format!("{kind} submission failed: {err}");
        match self
            .ledger
            .refund(&record.pipeline_id, self.config.credit_cost, &reason)
        {
            Ok(()) => info!(
                pipeline_id = %record.pipeline_id,
                amount = self.config.credit_cost,
                "refunded credits after rejected submission"
            ),
            Err(refund_err) => warn!(
                pipeline_id = %record.pipeline_id,
                "credit refund failed: {}",
                error_chain_text(&refund_err, 600)
            ),
        }
    }

    /// Generated mesh views in canonical angle order, else the reference
    /// photo as the front view.
    fn input_images(&self, record: &PipelineRecord) -> GenerationResult<Vec<InputImage>> {
        if !record.mesh_views.is_empty() {
            return record
                .mesh_views
                .iter()
                .map(|(angle, stored)| {
                    let bytes = self.read_file(&record.pipeline_id, &stored.name)?;
                    Ok(InputImage::new(bytes, stored.mime_type.clone()).with_view(*angle))
                })
                .collect();
        }
        let Some(reference) = &record.reference_image else {
            return Err(GenerationError::InvalidRequest(format!(
                "pipeline '{}' has no input images; upload a reference photo or generate views first",
                record.pipeline_id
            )));
        };
        let bytes = self.read_file(&record.pipeline_id, &reference.name)?;
        Ok(vec![
            InputImage::new(bytes, reference.mime_type.clone()).with_view(ViewAngle::Front)
        ])
    }

    /// Poll the stored task once. Terminal states are answered from the
    /// pipeline document without contacting the provider.
    pub fn check_generation_status(&self, pipeline_id: &str) -> GenerationResult<StatusOutcome> {
        let mut record = self.pipeline(pipeline_id)?;
        let Some(mut state) = record.generation.clone() else {
            return Err(GenerationError::InvalidRequest(format!(
                "pipeline '{pipeline_id}' has no generation; start one first"
            )));
        };
        if state.status.is_terminal() {
            return Ok(StatusOutcome::from_state(pipeline_id, &state));
        }

        let events = self.events(pipeline_id);
        let observed = match self.poll(&state) {
            Ok(observed) => observed,
            Err(err) => return Err(self.fail(&mut record, &events, "status", err)),
        };
        let merged = state.status.advance(observed.status);
        if merged != observed.status {
            debug!(pipeline_id, previous = %state.status, observed = %observed.status, "ignoring backward status report");
        }
        events.record(
            "status_checked",
            payload(json!({
                "provider": state.task.provider.as_str(),
                "task_id": state.task.task_id,
                "status": merged.as_str(),
                "progress": observed.progress,
            })),
        );

        match merged {
            TaskStatus::Completed => {
                let adapter = match self.registry.get(state.task.provider) {
                    Ok(adapter) => adapter,
                    Err(err) => return Err(self.fail(&mut record, &events, "download", err)),
                };
                if let Err(err) = self.collect_artifact(adapter.as_ref(), &mut state, &events) {
                    // Left non-terminal so the next check retries the download.
                    state.status = state.status.advance(TaskStatus::Processing);
                    state.updated_at = Utc::now();
                    record.generation = Some(state);
                    return Err(self.fail(&mut record, &events, "download", err));
                }
                state.status = TaskStatus::Completed;
                state.progress = Some(100);
                events.record(
                    "generation_completed",
                    payload(json!({
                        "provider": state.task.provider.as_str(),
                        "task_id": state.task.task_id,
                        "download_url": state.download_url,
                        "model_format": state.model_format.map(|format| format.to_string()),
                        "warnings": state.warnings,
                    })),
                );
                info!(pipeline_id, task_id = %state.task.task_id, "generation completed");
            }
            TaskStatus::Failed => {
                let message = observed
                    .error
                    .clone()
                    .unwrap_or_else(|| "provider reported the task as failed".to_string());
                warn!(pipeline_id, task_id = %state.task.task_id, error = %message, "generation failed");
                events.record(
                    "generation_failed",
                    payload(json!({
                        "provider": state.task.provider.as_str(),
                        "task_id": state.task.task_id,
                        "stage": "provider",
                        "error": message,
                    })),
                );
                state.status = TaskStatus::Failed;
                state.error = Some(message);
            }
            status => {
                state.status = status;
                state.progress = observed.progress.or(state.progress);
            }
        }

        state.updated_at = Utc::now();
        let outcome = StatusOutcome::from_state(pipeline_id, &state);
        record.generation = Some(state);
        record.last_error = None;
        record.touch();
        self.save(&record)?;
        Ok(outcome)
    }

    fn poll(&self, state: &GenerationState) -> GenerationResult<TaskStatusResult> {
        let adapter = self.registry.get(state.task.provider)?;
        adapter.check_status(&state.task.task_id, state.task.polling_credential.as_deref())
    }

    fn collect_artifact(
        &self,
        adapter: &dyn ProviderAdapter,
        state: &mut GenerationState,
        events: &EventWriter,
    ) -> GenerationResult<()> {
        let listing = DownloadResolver::new(self.config.download)
            .with_events(events.clone())
            .resolve_downloads(adapter, &state.task.task_id, state.required_format)?;
        let file = listing.primary(state.required_format).ok_or_else(|| {
            GenerationError::provider_internal(adapter.kind().as_str(), "download listing has no files")
        })?;
        let bytes = adapter.download_model(&file.url)?;
        let format = detect_artifact_format(&bytes, file.format);
        let (name, content_type) = match format {
            Some(format) => (format!("model.{}", format.extension()), format.content_type()),
            None => {
                let message = format!("could not determine the format of {}", file.name);
                warn!(task_id = %state.task.task_id, "{message}");
                push_unique_warning(&mut state.warnings, message);
                ("model.bin".to_string(), "application/octet-stream")
            }
        };
        let pipeline_id = events.pipeline_id().to_string();
        let url = self
            .storage
            .upload(&pipeline_id, &name, &bytes, content_type)
            .map_err(|err| collaborator_error("failed storing model", err))?;

        for warning in listing.warnings.iter() {
            push_unique_warning(&mut state.warnings, warning.clone());
        }
        state.download_url = Some(url);
        state.model_format = format;
        state.thumbnail_url = listing.thumbnail_url.clone();
        Ok(())
    }

    /// Repeated status checks until the task is terminal or `timeout`
    /// passes. Rate-limited checks wait one interval and try again.
    pub fn watch_generation(
        &self,
        pipeline_id: &str,
        interval: Duration,
        timeout: Duration,
        mut on_update: impl FnMut(&StatusOutcome),
    ) -> GenerationResult<StatusOutcome> {
        let started = Instant::now();
        loop {
            let out_of_time = started.elapsed() + interval >= timeout;
            let outcome = match self.check_generation_status(pipeline_id) {
                Ok(outcome) => outcome,
                Err(err @ GenerationError::RateLimited { .. }) if !out_of_time => {
                    warn!(pipeline_id, error = %err, "status check rate limited; waiting");
                    thread::sleep(interval);
                    continue;
                }
                Err(err) => return Err(err),
            };
            on_update(&outcome);
            if outcome.status.is_terminal() || out_of_time {
                return Ok(outcome);
            }
            thread::sleep(interval);
        }
    }

    /// Mesh views with colour extraction, palette aggregation, then texture
    /// views. Successful views are stored and recorded even when some
    /// angles fail; losing every mesh view is an error.
    pub fn generate_views(
        &self,
        pipeline_id: &str,
        request: &ViewsRequest,
        progress: Option<&Sender<ProgressEvent>>,
    ) -> GenerationResult<ViewsOutcome> {
        let mut record = self.pipeline(pipeline_id)?;
        let events = self.events(pipeline_id);
        let prepared = self.image_generator().and_then(|generator| {
            let reference = record.reference_image.clone().ok_or_else(|| {
                GenerationError::InvalidRequest(format!(
                    "pipeline '{pipeline_id}' has no reference photo"
                ))
            })?;
            let bytes = self.read_file(pipeline_id, &reference.name)?;
            Ok((generator, reference.mime_type, bytes))
        });
        let (generator, mime_type, reference_bytes) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return Err(self.fail(&mut record, &events, "views", err)),
        };

        let mut builder = ViewPromptBuilder::new(request.mode).with_context(PromptContext {
            description: request.description.clone(),
            ..PromptContext::default()
        });
        if let Some(count) = request.expected_colors {
            builder = builder.with_expected_colors(count);
        }
        events.record(
            "views_started",
            payload(json!({
                "mode": request.mode.as_str(),
                "mesh_angles": request.plan.mesh_angles.iter().map(ViewAngle::as_str).collect::<Vec<_>>(),
                "texture_angles": request.plan.texture_angles.iter().map(ViewAngle::as_str).collect::<Vec<_>>(),
            })),
        );

        let scheduler = MultiViewScheduler::new(generator, self.config.scheduler);
        let plan = request.plan.clone();
        let (sender, receiver) = mpsc::channel::<ProgressEvent>();
        let joined = thread::scope(|scope| {
            let worker = scope.spawn(move || {
                scheduler.generate_views_parallel(&reference_bytes, &mime_type, &plan, &builder, Some(&sender))
            });
            for event in receiver {
                record_view_progress(&events, &event);
                if let Some(observer) = progress {
                    let _ = observer.send(event);
                }
            }
            worker.join()
        });
        let output = match joined {
            Ok(output) => output,
            Err(_) => {
                let err = GenerationError::provider_internal("gemini", "view generation worker panicked");
                return Err(self.fail(&mut record, &events, "views", err));
            }
        };

        let mut warnings = Vec::new();
        let stored = self
            .store_views(pipeline_id, ViewKind::Mesh, &output.mesh, &mut warnings)
            .and_then(|mesh| {
                let texture = self.store_views(pipeline_id, ViewKind::Texture, &output.texture, &mut warnings)?;
                Ok((mesh, texture))
            });
        let (mesh_views, texture_views) = match stored {
            Ok(stored) => stored,
            Err(err) => return Err(self.fail(&mut record, &events, "views", err)),
        };
        let failures = failure_records(&output.mesh, ViewKind::Mesh)
            .into_iter()
            .chain(failure_records(&output.texture, ViewKind::Texture))
            .collect::<BTreeMap<String, ErrorRecord>>();

        record.mode = Some(request.mode);
        record.description = request.description.clone();
        record.mesh_views = mesh_views.clone();
        record.texture_views = texture_views.clone();
        record.palette = Some(output.palette.clone());
        record.view_failures = failures.clone();
        record.touch();

        if mesh_views.is_empty() && !request.plan.mesh_angles.is_empty() {
            let err = output
                .mesh
                .failures
                .values()
                .next()
                .cloned()
                .unwrap_or(GenerationError::NoImageReturned { partial_text: None });
            return Err(self.fail(&mut record, &events, "views", err));
        }
        record.last_error = None;
        self.save(&record)?;
        info!(
            pipeline_id,
            mesh = mesh_views.len(),
            texture = texture_views.len(),
            failed = failures.len(),
            "views generated"
        );

        Ok(ViewsOutcome {
            pipeline_id: pipeline_id.to_string(),
            mesh_views,
            texture_views,
            palette: output.palette,
            failures,
            warnings,
        })
    }

    fn store_views(
        &self,
        pipeline_id: &str,
        kind: ViewKind,
        set: &ViewSet,
        warnings: &mut Vec<String>,
    ) -> GenerationResult<BTreeMap<ViewAngle, StoredImage>> {
        let mut stored = BTreeMap::new();
        for (angle, view) in &set.views {
            let name = format!("views/{kind}-{angle}.{}", view.extension());
            let url = self
                .storage
                .upload(pipeline_id, &name, &view.image_bytes, &view.mime_type)
                .map_err(|err| collaborator_error("failed storing view image", err))?;
            for warning in &view.warnings {
                push_unique_warning(warnings, format!("{kind} {angle}: {warning}"));
            }
            stored.insert(
                *angle,
                StoredImage {
                    name,
                    mime_type: view.mime_type.clone(),
                    url,
                    color_palette: view.color_palette.clone(),
                },
            );
        }
        Ok(stored)
    }

    fn image_generator(&self) -> GenerationResult<Arc<dyn ImageGenerator>> {
        match &self.image_generator {
            Some(generator) => Ok(Arc::clone(generator)),
            None => Ok(Arc::new(GeminiImageClient::new(&self.config.image_service)?)),
        }
    }

    fn read_file(&self, pipeline_id: &str, name: &str) -> GenerationResult<Vec<u8>> {
        self.storage
            .read(pipeline_id, name)
            .map_err(|err| collaborator_error("failed reading stored image", err))
    }

    fn save(&self, record: &PipelineRecord) -> GenerationResult<()> {
        self.documents
            .save(record)
            .map_err(|err| collaborator_error("failed saving pipeline", err))
    }

    fn events(&self, pipeline_id: &str) -> EventWriter {
        match &self.event_root {
            Some(root) => EventWriter::new(root.join(pipeline_id).join(EVENTS_FILE), pipeline_id),
            None => EventWriter::detached(pipeline_id),
        }
    }

    /// Persist `error` as the pipeline's last error, then hand it back for
    /// the caller to surface.
    fn fail(
        &self,
        record: &mut PipelineRecord,
        events: &EventWriter,
        stage: &str,
        error: GenerationError,
    ) -> GenerationError {
        warn!(pipeline_id = %record.pipeline_id, stage, code = error.code(), error = %error, "pipeline operation failed");
        events.record(
            "generation_failed",
            payload(json!({
                "stage": stage,
                "code": error.code(),
                "error": error.to_string(),
                "retryable": error.is_retryable(),
            })),
        );
        record.last_error = Some(ErrorRecord::from_error(&error));
        record.touch();
        if let Err(save_err) = self.documents.save(record) {
            warn!(pipeline_id = %record.pipeline_id, error = %save_err, "failed persisting pipeline error");
        }
        error
    }
}

fn collaborator_error(context: &str, err: anyhow::Error) -> GenerationError {
    GenerationError::provider_internal(COLLABORATOR, format!("{context}: {}", error_chain_text(&err, 600)))
}

fn failure_records(set: &ViewSet, kind: ViewKind) -> Vec<(String, ErrorRecord)> {
    set.failures
        .iter()
        .map(|(angle, error)| (format!("{kind}:{angle}"), ErrorRecord::from_error(error)))
        .collect()
}

fn record_view_progress(events: &EventWriter, event: &ProgressEvent) {
    match event {
        ProgressEvent::Started { kind, angle, .. } => {
            debug!(pipeline_id = events.pipeline_id(), %kind, %angle, "view started");
        }
        ProgressEvent::Completed {
            kind,
            angle,
            completed,
            total,
        } => events.record(
            "view_completed",
            payload(json!({
                "kind": kind.as_str(),
                "angle": angle.as_str(),
                "completed": completed,
                "total": total,
            })),
        ),
        ProgressEvent::Failed {
            kind,
            angle,
            completed,
            total,
            error,
        } => events.record(
            "view_failed",
            payload(json!({
                "kind": kind.as_str(),
                "angle": angle.as_str(),
                "completed": completed,
                "total": total,
                "code": error.code(),
                "error": error.to_string(),
            })),
        ),
        ProgressEvent::PaletteReady { dominant } => events.record(
            "palette_aggregated",
            payload(json!({ "dominant": dominant })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tempfile::TempDir;

    use photo3d_contracts::providers::{GenerationOptions, ProviderCapabilities, ProviderKind};
    use photo3d_contracts::tasks::{
        DownloadFile, DownloadResult, ModelFormat, SubmittedTask, TaskStatus, TaskStatusResult,
    };
    use photo3d_contracts::views::{GeneratedView, ViewAngle};
    use photo3d_contracts::{GenerationError, GenerationResult};

    use super::{GenerationService, StartRequest, ViewsRequest};
    use crate::config::{EngineConfig, ProviderCredentials};
    use crate::image_client::{ImageGenerator, SingleViewRequest};
    use crate::providers::{InputImage, ProviderAdapter};
    use crate::records::{DocumentStore, PipelineRecord};
    use crate::registry::{static_capabilities, ProviderRegistry};
    use crate::scheduler::MultiViewPlan;
    use crate::workspace::LocalWorkspace;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const GLB: &[u8] = b"glTF\x02\0\0\0\x0c\0\0\0";

    /// Meshy stand-in that replays a queue of status reports.
    struct ScriptedAdapter {
        statuses: Mutex<VecDeque<GenerationResult<TaskStatusResult>>>,
        submissions: Mutex<Vec<usize>>,
        rejection: Mutex<Option<GenerationError>>,
        polls: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(statuses: Vec<GenerationResult<TaskStatusResult>>) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                submissions: Mutex::new(Vec::new()),
                rejection: Mutex::new(None),
                polls: AtomicUsize::new(0),
            }
        }

        fn reject_next_submission(&self, err: GenerationError) {
            *self.rejection.lock().unwrap() = Some(err);
        }

        fn submissions(&self) -> Vec<usize> {
            self.submissions.lock().unwrap().clone()
        }

        fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    impl ProviderAdapter for ScriptedAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Meshy
        }

        fn generate_from_image(&self, _: &InputImage, _: &GenerationOptions) -> GenerationResult<SubmittedTask> {
            self.submissions.lock().unwrap().push(1);
            if let Some(err) = self.rejection.lock().unwrap().take() {
                return Err(err);
            }
            Ok(SubmittedTask::new("task-1"))
        }

        fn generate_from_multiple_images(
            &self,
            images: &[InputImage],
            _: &GenerationOptions,
        ) -> GenerationResult<SubmittedTask> {
            self.submissions.lock().unwrap().push(images.len());
            Ok(SubmittedTask::new("multi:task-1"))
        }

        fn check_status(&self, _: &str, _: Option<&str>) -> GenerationResult<TaskStatusResult> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TaskStatusResult::new(TaskStatus::Processing)))
        }

        fn get_download_urls(&self, _: &str, _: Option<ModelFormat>) -> GenerationResult<DownloadResult> {
            Ok(DownloadResult {
                files: vec![DownloadFile::new("https://cdn.test/out/model.glb?sig=1", "model.glb", None)],
                thumbnail_url: Some("https://cdn.test/out/preview.png".to_string()),
                warnings: Vec::new(),
            })
        }

        fn download_model(&self, _: &str) -> GenerationResult<Vec<u8>> {
            Ok(GLB.to_vec())
        }

        fn capabilities(&self) -> ProviderCapabilities {
            static_capabilities(ProviderKind::Meshy)
        }
    }

    struct PaletteGenerator;

    impl ImageGenerator for PaletteGenerator {
        fn generate_single_view(&self, _: &SingleViewRequest<'_>) -> GenerationResult<GeneratedView> {
            Ok(GeneratedView {
                image_bytes: PNG.to_vec(),
                mime_type: "image/png".to_string(),
                color_palette: Some(vec!["#FF0000".to_string(), "#00FF00".to_string()]),
                warnings: Vec::new(),
            })
        }
    }

    struct BlockedGenerator;

    impl ImageGenerator for BlockedGenerator {
        fn generate_single_view(&self, _: &SingleViewRequest<'_>) -> GenerationResult<GeneratedView> {
            Err(GenerationError::ContentBlocked("SAFETY".to_string()))
        }
    }

    struct Harness {
        temp: TempDir,
        workspace: Arc<LocalWorkspace>,
        adapter: Arc<ScriptedAdapter>,
        service: GenerationService,
    }

    fn harness(
        statuses: Vec<GenerationResult<TaskStatusResult>>,
        generator: Arc<dyn ImageGenerator>,
    ) -> anyhow::Result<Harness> {
        let temp = tempfile::tempdir()?;
        let workspace = Arc::new(LocalWorkspace::open(temp.path())?);
        let mut config = EngineConfig::default();
        config.scheduler.min_inter_call_delay = Duration::ZERO;
        config.download.retry_delay = Duration::ZERO;
        let registry = Arc::new(ProviderRegistry::new(ProviderCredentials::default()));
        let adapter = Arc::new(ScriptedAdapter::new(statuses));
        registry.register(adapter.clone())?;
        let service = GenerationService::new(
            config,
            registry,
            workspace.clone(),
            workspace.clone(),
            workspace.clone(),
        )
        .with_event_root(temp.path())
        .with_image_generator(generator);
        Ok(Harness {
            temp,
            workspace,
            adapter,
            service,
        })
    }

    fn events_text(harness: &Harness, pipeline_id: &str) -> anyhow::Result<String> {
        Ok(fs::read_to_string(
            harness.temp.path().join(pipeline_id).join("events.jsonl"),
        )?)
    }

    #[test]
    fn start_charges_once_and_returns_the_stored_task_afterwards() -> anyhow::Result<()> {
        let h = harness(Vec::new(), Arc::new(PaletteGenerator))?;
        h.workspace.set_credit_balance(25)?;
        h.service.create_pipeline(Some("pipe-1"), PNG)?;

        let first = h.service.start_generation("pipe-1", &StartRequest::default())?;
        assert!(!first.reused);
        assert_eq!(first.provider, ProviderKind::Meshy);
        assert_eq!(first.task_id, "task-1");
        assert_eq!(first.status, TaskStatus::Pending);

        let second = h.service.start_generation("pipe-1", &StartRequest::default())?;
        assert!(second.reused);
        assert_eq!(second.task_id, "task-1");
        assert_eq!(h.adapter.submissions(), vec![1]);
        assert_eq!(h.workspace.credit_balance()?, Some(15));
        assert!(events_text(&h, "pipe-1")?.contains("\"generation_submitted\""));
        Ok(())
    }

    #[test]
    fn start_without_images_is_rejected_before_charging() -> anyhow::Result<()> {
        let h = harness(Vec::new(), Arc::new(PaletteGenerator))?;
        h.workspace.set_credit_balance(25)?;
        h.workspace.save(&PipelineRecord::new("bare"))?;

        let result = h.service.start_generation("bare", &StartRequest::default());
        assert!(matches!(result, Err(GenerationError::InvalidRequest(_))));
        assert_eq!(h.workspace.credit_balance()?, Some(25));
        let stored = h.service.pipeline("bare")?;
        assert_eq!(stored.last_error.map(|error| error.code), Some("invalid_request".to_string()));
        assert!(stored.generation.is_none());
        Ok(())
    }

    #[test]
    fn rejected_submission_is_refunded() -> anyhow::Result<()> {
        let h = harness(Vec::new(), Arc::new(PaletteGenerator))?;
        h.workspace.set_credit_balance(25)?;
        h.service.create_pipeline(Some("pipe-1"), PNG)?;
        h.adapter.reject_next_submission(GenerationError::InsufficientProviderCredit {
            provider: "meshy".to_string(),
            message: "balance exhausted".to_string(),
        });

        let result = h.service.start_generation("pipe-1", &StartRequest::default());
        assert!(matches!(result, Err(GenerationError::InsufficientProviderCredit { .. })));
        assert_eq!(h.adapter.submissions(), vec![1]);
        assert_eq!(h.workspace.credit_balance()?, Some(25));
        let log = fs::read_to_string(h.temp.path().join("pipe-1").join("credits.jsonl"))?;
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("\"refund\""));
        assert!(h.service.pipeline("pipe-1")?.generation.is_none());

        let retried = h.service.start_generation("pipe-1", &StartRequest::default())?;
        assert_eq!(retried.task_id, "task-1");
        assert_eq!(h.workspace.credit_balance()?, Some(15));
        Ok(())
    }

    #[test]
    fn unconfigured_provider_is_rejected_before_charging() -> anyhow::Result<()> {
        let h = harness(Vec::new(), Arc::new(PaletteGenerator))?;
        h.workspace.set_credit_balance(25)?;
        h.service.create_pipeline(Some("pipe-1"), PNG)?;
        let request = StartRequest {
            provider: Some("rodin".to_string()),
            ..StartRequest::default()
        };
        let result = h.service.start_generation("pipe-1", &request);
        assert!(matches!(result, Err(GenerationError::Configuration(_))));
        assert_eq!(h.workspace.credit_balance()?, Some(25));
        Ok(())
    }

    #[test]
    fn completed_task_is_downloaded_and_stored_once() -> anyhow::Result<()> {
        let h = harness(
            vec![
                Ok(TaskStatusResult::new(TaskStatus::Processing).with_progress(Some(40.0))),
                Ok(TaskStatusResult::new(TaskStatus::Completed)),
            ],
            Arc::new(PaletteGenerator),
        )?;
        h.service.create_pipeline(Some("pipe-1"), PNG)?;
        h.service.start_generation("pipe-1", &StartRequest::default())?;

        let running = h.service.check_generation_status("pipe-1")?;
        assert_eq!(running.status, TaskStatus::Processing);
        assert_eq!(running.progress, Some(40));
        assert_eq!(running.download_url, None);

        let done = h.service.check_generation_status("pipe-1")?;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.model_format, Some(ModelFormat::Glb));
        assert_eq!(done.thumbnail_url.as_deref(), Some("https://cdn.test/out/preview.png"));
        let url = done.download_url.clone().unwrap_or_default();
        assert!(url.ends_with("model.glb"), "unexpected url {url}");
        assert_eq!(fs::read(h.temp.path().join("pipe-1").join("model.glb"))?, GLB.to_vec());

        let again = h.service.check_generation_status("pipe-1")?;
        assert_eq!(again, done);
        assert_eq!(h.adapter.polls(), 2);
        assert!(events_text(&h, "pipe-1")?.contains("\"generation_completed\""));
        Ok(())
    }

    #[test]
    fn provider_failure_is_terminal_and_sticky() -> anyhow::Result<()> {
        let h = harness(
            vec![Ok(TaskStatusResult::failed("mesh reconstruction failed"))],
            Arc::new(PaletteGenerator),
        )?;
        h.service.create_pipeline(Some("pipe-1"), PNG)?;
        h.service.start_generation("pipe-1", &StartRequest::default())?;

        let failed = h.service.check_generation_status("pipe-1")?;
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("mesh reconstruction failed"));
        let again = h.service.check_generation_status("pipe-1")?;
        assert_eq!(again.status, TaskStatus::Failed);
        assert_eq!(h.adapter.polls(), 1);

        let restarted = h.service.start_generation(
            "pipe-1",
            &StartRequest {
                retry_failed: true,
                ..StartRequest::default()
            },
        )?;
        assert!(!restarted.reused);
        assert_eq!(restarted.status, TaskStatus::Pending);
        assert_eq!(h.adapter.submissions(), vec![1, 1]);
        Ok(())
    }

    #[test]
    fn poll_errors_are_recorded_without_ending_the_task() -> anyhow::Result<()> {
        let h = harness(
            vec![Err(GenerationError::RateLimited {
                provider: "meshy".to_string(),
                message: "slow down".to_string(),
            })],
            Arc::new(PaletteGenerator),
        )?;
        h.service.create_pipeline(Some("pipe-1"), PNG)?;
        h.service.start_generation("pipe-1", &StartRequest::default())?;

        let result = h.service.check_generation_status("pipe-1");
        assert!(matches!(result, Err(GenerationError::RateLimited { .. })));
        let stored = h.service.pipeline("pipe-1")?;
        assert_eq!(stored.last_error.map(|error| error.code), Some("rate_limited".to_string()));
        assert_eq!(stored.generation.map(|state| state.status), Some(TaskStatus::Pending));

        let next = h.service.check_generation_status("pipe-1")?;
        assert_eq!(next.status, TaskStatus::Processing);
        assert!(h.service.pipeline("pipe-1")?.last_error.is_none());
        Ok(())
    }

    #[test]
    fn generated_views_become_the_submission_input() -> anyhow::Result<()> {
        let h = harness(Vec::new(), Arc::new(PaletteGenerator))?;
        h.service.create_pipeline(Some("pipe-1"), PNG)?;
        let request = ViewsRequest {
            plan: MultiViewPlan {
                mesh_angles: ViewAngle::MESH_DEFAULT.to_vec(),
                texture_angles: vec![ViewAngle::Front],
            },
            ..ViewsRequest::default()
        };

        let views = h.service.generate_views("pipe-1", &request, None)?;
        assert_eq!(views.mesh_views.len(), 4);
        assert_eq!(views.texture_views.len(), 1);
        assert!(views.failures.is_empty());
        assert_eq!(views.palette.dominant, vec!["#FF0000".to_string(), "#00FF00".to_string()]);
        assert!(h.temp.path().join("pipe-1").join("views").join("mesh-back.png").exists());

        let stored = h.service.pipeline("pipe-1")?;
        assert_eq!(stored.mesh_views.len(), 4);
        assert!(stored.palette.is_some());
        let events = events_text(&h, "pipe-1")?;
        assert!(events.contains("\"view_completed\""));
        assert!(events.contains("\"palette_aggregated\""));

        h.service.start_generation("pipe-1", &StartRequest::default())?;
        assert_eq!(h.adapter.submissions(), vec![4]);
        Ok(())
    }

    #[test]
    fn losing_every_mesh_view_is_an_error() -> anyhow::Result<()> {
        let h = harness(Vec::new(), Arc::new(BlockedGenerator))?;
        h.service.create_pipeline(Some("pipe-1"), PNG)?;
        let result = h.service.generate_views("pipe-1", &ViewsRequest::default(), None);
        assert!(matches!(result, Err(GenerationError::ContentBlocked(_))));

        let stored = h.service.pipeline("pipe-1")?;
        assert!(stored.view_failures.contains_key("mesh:front"));
        assert_eq!(stored.last_error.map(|error| error.code), Some("content_blocked".to_string()));
        assert!(events_text(&h, "pipe-1")?.contains("\"view_failed\""));
        Ok(())
    }

    #[test]
    fn watch_stops_at_the_terminal_state() -> anyhow::Result<()> {
        let h = harness(
            vec![
                Ok(TaskStatusResult::new(TaskStatus::Pending)),
                Ok(TaskStatusResult::new(TaskStatus::Processing)),
                Ok(TaskStatusResult::new(TaskStatus::Completed)),
            ],
            Arc::new(PaletteGenerator),
        )?;
        h.service.create_pipeline(Some("pipe-1"), PNG)?;
        h.service.start_generation("pipe-1", &StartRequest::default())?;

        let mut seen = Vec::new();
        let outcome = h.service.watch_generation(
            "pipe-1",
            Duration::from_millis(1),
            Duration::from_secs(10),
            |update| seen.push(update.status),
        )?;
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(
            seen,
            vec![TaskStatus::Pending, TaskStatus::Processing, TaskStatus::Completed]
        );
        Ok(())
    }

    #[test]
    fn duplicate_pipeline_ids_and_non_images_are_rejected() -> anyhow::Result<()> {
        let h = harness(Vec::new(), Arc::new(PaletteGenerator))?;
        let created = h.service.create_pipeline(None, PNG)?;
        assert_eq!(created.reference_image.map(|image| image.mime_type), Some("image/png".to_string()));
        assert!(matches!(
            h.service.create_pipeline(Some(created.pipeline_id.as_str()), PNG),
            Err(GenerationError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.service.create_pipeline(Some("pipe-2"), b"not an image"),
            Err(GenerationError::InvalidRequest(_))
        ));
        Ok(())
    }
}
