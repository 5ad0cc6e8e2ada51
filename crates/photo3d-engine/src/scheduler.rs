//! Staggered fan-out of view generation calls.
//!
//! View `i` of a phase starts no earlier than `i * min_inter_call_delay`
//! after the phase began, but never waits for view `i - 1` to finish. Peak
//! request rate stays under the image service limit while wall-clock time
//! is roughly one call latency plus the stagger.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use photo3d_contracts::palette::{aggregate, AggregatedPalette};
use photo3d_contracts::prompts::ViewPromptBuilder;
use photo3d_contracts::views::{GeneratedView, ViewAngle, ViewKind, ViewRequest};
use photo3d_contracts::GenerationError;

use crate::config::SchedulerConfig;
use crate::image_client::{ImageGenerator, SingleViewRequest};

/// Views of one phase. A failed view occupies only its own slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewSet {
    pub views: BTreeMap<ViewAngle, GeneratedView>,
    pub failures: BTreeMap<ViewAngle, GenerationError>,
}

impl ViewSet {
    pub fn palettes(&self) -> BTreeMap<ViewAngle, Vec<String>> {
        self.views
            .iter()
            .filter_map(|(angle, view)| view.color_palette.clone().map(|colors| (*angle, colors)))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Progress notification sent while a phase is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        kind: ViewKind,
        angle: ViewAngle,
        index: usize,
        total: usize,
    },
    Completed {
        kind: ViewKind,
        angle: ViewAngle,
        completed: usize,
        total: usize,
    },
    Failed {
        kind: ViewKind,
        angle: ViewAngle,
        completed: usize,
        total: usize,
        error: GenerationError,
    },
    PaletteReady {
        dominant: Vec<String>,
    },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Started { kind, angle, index, total } => {
                write!(f, "{kind} {angle} started ({}/{total})", index + 1)
            }
            ProgressEvent::Completed { kind, angle, completed, total } => {
                write!(f, "{kind} {angle} done ({completed}/{total})")
            }
            ProgressEvent::Failed { kind, angle, completed, total, error } => {
                write!(f, "{kind} {angle} failed ({completed}/{total}): {error}")
            }
            ProgressEvent::PaletteReady { dominant } => {
                write!(f, "palette ready: {}", dominant.join(", "))
            }
        }
    }
}

/// Which views to produce in the two-phase run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiViewPlan {
    pub mesh_angles: Vec<ViewAngle>,
    pub texture_angles: Vec<ViewAngle>,
}

impl Default for MultiViewPlan {
    fn default() -> Self {
        Self {
            mesh_angles: ViewAngle::MESH_DEFAULT.to_vec(),
            texture_angles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiViewOutput {
    pub mesh: ViewSet,
    pub texture: ViewSet,
    pub palette: AggregatedPalette,
}

pub struct MultiViewScheduler {
    generator: Arc<dyn ImageGenerator>,
    min_inter_call_delay: Duration,
}

impl MultiViewScheduler {
    pub fn new(generator: Arc<dyn ImageGenerator>, config: SchedulerConfig) -> Self {
        Self {
            generator,
            min_inter_call_delay: config.min_inter_call_delay,
        }
    }

    pub fn min_inter_call_delay(&self) -> Duration {
        self.min_inter_call_delay
    }

    /// Mesh views for the given angles, colours extracted when the builder
    /// asks for them.
    pub fn generate_views(
        &self,
        reference_image: &[u8],
        mime_type: &str,
        angles: &[ViewAngle],
        builder: &ViewPromptBuilder,
    ) -> ViewSet {
        let requests = dedupe_angles(angles)
            .into_iter()
            .map(|angle| builder.request(angle, ViewKind::Mesh))
            .collect::<Vec<ViewRequest>>();
        self.run_phase(
            reference_image,
            mime_type,
            &requests,
            builder.expected_colors(),
            None,
        )
    }

    /// Mesh phase, palette aggregation, then texture phase coloured by the
    /// dominant palette. Each phase is staggered with the same delay.
    pub fn generate_views_parallel(
        &self,
        reference_image: &[u8],
        mime_type: &str,
        plan: &MultiViewPlan,
        builder: &ViewPromptBuilder,
        progress: Option<&Sender<ProgressEvent>>,
    ) -> MultiViewOutput {
        let mesh_requests = dedupe_angles(&plan.mesh_angles)
            .into_iter()
            .map(|angle| builder.request(angle, ViewKind::Mesh))
            .collect::<Vec<ViewRequest>>();
        let mesh = self.run_phase(
            reference_image,
            mime_type,
            &mesh_requests,
            builder.expected_colors(),
            progress,
        );

        let palette = aggregate(&mesh.palettes());
        info!(
            unified = palette.unified.len(),
            dominant = ?palette.dominant,
            "aggregated mesh view palette"
        );
        notify(
            progress,
            ProgressEvent::PaletteReady {
                dominant: palette.dominant.clone(),
            },
        );

        let texture = if plan.texture_angles.is_empty() {
            ViewSet::default()
        } else {
            let texture_builder = builder.clone().with_color_hints(&palette.dominant);
            let texture_requests = dedupe_angles(&plan.texture_angles)
                .into_iter()
                .map(|angle| texture_builder.request(angle, ViewKind::Texture))
                .collect::<Vec<ViewRequest>>();
            self.run_phase(reference_image, mime_type, &texture_requests, 0, progress)
        };

        MultiViewOutput {
            mesh,
            texture,
            palette,
        }
    }

    fn run_phase(
        &self,
        reference_image: &[u8],
        mime_type: &str,
        requests: &[ViewRequest],
        expected_colors: usize,
        progress: Option<&Sender<ProgressEvent>>,
    ) -> ViewSet {
        let total = requests.len();
        let phase_start = Instant::now();
        let (tx, rx) = mpsc::channel::<(ViewRequest, Result<GeneratedView, GenerationError>)>();
        let generator = &self.generator;
        let delay = self.min_inter_call_delay;

        thread::scope(|scope| {
            for (index, request) in requests.iter().enumerate() {
                let tx = tx.clone();
                let progress = progress.cloned();
                scope.spawn(move || {
                    let offset = delay.saturating_mul(index as u32);
                    let wait = offset.saturating_sub(phase_start.elapsed());
                    if !wait.is_zero() {
                        thread::sleep(wait);
                    }
                    notify(
                        progress.as_ref(),
                        ProgressEvent::Started {
                            kind: request.kind,
                            angle: request.angle,
                            index,
                            total,
                        },
                    );
                    debug!(angle = %request.angle, kind = %request.kind, index, "dispatching view call");
                    let result = generator.generate_single_view(&SingleViewRequest {
                        reference_image,
                        mime_type,
                        prompt: &request.prompt,
                        extract_colors: request.kind == ViewKind::Mesh && expected_colors > 0,
                        expected_color_count: expected_colors,
                    });
                    // the receiver lives until every sender is dropped
                    let _ = tx.send((request.clone(), result));
                });
            }
            drop(tx);

            let mut set = ViewSet::default();
            let mut completed = 0;
            for (request, result) in rx {
                completed += 1;
                match result {
                    Ok(view) => {
                        notify(
                            progress,
                            ProgressEvent::Completed {
                                kind: request.kind,
                                angle: request.angle,
                                completed,
                                total,
                            },
                        );
                        set.views.insert(request.angle, view);
                    }
                    Err(error) => {
                        warn!(angle = %request.angle, kind = %request.kind, %error, "view generation failed");
                        notify(
                            progress,
                            ProgressEvent::Failed {
                                kind: request.kind,
                                angle: request.angle,
                                completed,
                                total,
                                error: error.clone(),
                            },
                        );
                        set.failures.insert(request.angle, error);
                    }
                }
            }
            set
        })
    }
}

fn notify(progress: Option<&Sender<ProgressEvent>>, event: ProgressEvent) {
    if let Some(sender) = progress {
        // a consumer that stopped listening must not fail the phase
        let _ = sender.send(event);
    }
}

fn dedupe_angles(angles: &[ViewAngle]) -> Vec<ViewAngle> {
    let mut out: Vec<ViewAngle> = Vec::with_capacity(angles.len());
    for angle in angles {
        if !out.contains(angle) {
            out.push(*angle);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use photo3d_contracts::prompts::ViewPromptBuilder;
    use photo3d_contracts::views::{GeneratedView, GenerationMode, ViewAngle, ViewKind};
    use photo3d_contracts::{GenerationError, GenerationResult};

    use super::{MultiViewPlan, MultiViewScheduler, ProgressEvent};
    use crate::config::SchedulerConfig;
    use crate::image_client::{ImageGenerator, SingleViewRequest};

    struct ScriptedGenerator {
        prompts: Mutex<Vec<String>>,
    }

    impl ImageGenerator for ScriptedGenerator {
        fn generate_single_view(&self, request: &SingleViewRequest<'_>) -> GenerationResult<GeneratedView> {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(request.prompt.to_string());
            }
            if request.prompt.contains("directly behind") {
                return Err(GenerationError::NoImageReturned { partial_text: None });
            }
            Ok(GeneratedView {
                image_bytes: request.reference_image.to_vec(),
                mime_type: request.mime_type.to_string(),
                color_palette: request
                    .extract_colors
                    .then(|| vec!["#123456".to_string()]),
                warnings: Vec::new(),
            })
        }
    }

    fn scheduler(generator: Arc<ScriptedGenerator>) -> MultiViewScheduler {
        MultiViewScheduler::new(
            generator,
            SchedulerConfig {
                min_inter_call_delay: Duration::from_millis(5),
            },
        )
    }

    #[test]
    fn failing_view_only_fails_its_slot() {
        let generator = Arc::new(ScriptedGenerator {
            prompts: Mutex::new(Vec::new()),
        });
        let set = scheduler(generator).generate_views(
            b"ref",
            "image/png",
            &ViewAngle::MESH_DEFAULT,
            &ViewPromptBuilder::new(GenerationMode::Simplified),
        );
        assert_eq!(set.views.len(), 3);
        assert!(set.failures.contains_key(&ViewAngle::Back));
        assert!(!set.is_complete());
    }

    #[test]
    fn duplicate_angles_are_generated_once() {
        let generator = Arc::new(ScriptedGenerator {
            prompts: Mutex::new(Vec::new()),
        });
        let set = scheduler(Arc::clone(&generator)).generate_views(
            b"ref",
            "image/png",
            &[ViewAngle::Front, ViewAngle::Front, ViewAngle::Left],
            &ViewPromptBuilder::new(GenerationMode::Simplified),
        );
        assert_eq!(set.views.len(), 2);
        assert_eq!(generator.prompts.lock().map(|p| p.len()).unwrap_or(0), 2);
    }

    #[test]
    fn texture_phase_uses_mesh_palette_and_reports_progress() {
        let generator = Arc::new(ScriptedGenerator {
            prompts: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel();
        let plan = MultiViewPlan {
            mesh_angles: vec![ViewAngle::Front, ViewAngle::Back],
            texture_angles: vec![ViewAngle::Front],
        };
        let output = scheduler(Arc::clone(&generator)).generate_views_parallel(
            b"ref",
            "image/png",
            &plan,
            &ViewPromptBuilder::new(GenerationMode::Simplified),
            Some(&tx),
        );
        drop(tx);

        assert_eq!(output.palette.dominant, vec!["#123456".to_string()]);
        assert_eq!(output.texture.views.len(), 1);
        let texture_view = &output.texture.views[&ViewAngle::Front];
        assert!(texture_view.color_palette.is_none());

        let prompts = generator.prompts.lock().map(|p| p.clone()).unwrap_or_default();
        assert!(prompts
            .iter()
            .any(|prompt| prompt.contains("no other colours: #123456")));

        let events = rx.into_iter().collect::<Vec<ProgressEvent>>();
        let failed = events
            .iter()
            .filter(|event| matches!(event, ProgressEvent::Failed { .. }))
            .count();
        let completed_texture = events.iter().any(|event| {
            matches!(
                event,
                ProgressEvent::Completed {
                    kind: ViewKind::Texture,
                    total: 1,
                    ..
                }
            )
        });
        assert_eq!(failed, 1);
        assert!(completed_texture);
        assert!(events
            .iter()
            .any(|event| matches!(event, ProgressEvent::PaletteReady { .. })));
    }
}
