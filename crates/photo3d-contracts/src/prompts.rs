use crate::views::{GenerationMode, ViewAngle, ViewKind, ViewRequest};

pub const DEFAULT_EXPECTED_COLORS: usize = 6;

/// Optional context woven into every view prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptContext {
    pub description: Option<String>,
    pub detected_features: Vec<String>,
    pub color_hints: Vec<String>,
}

/// Builds the instruction sent with the reference photo for one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewPromptBuilder {
    mode: GenerationMode,
    context: PromptContext,
    expected_colors: usize,
}

impl ViewPromptBuilder {
    pub fn new(mode: GenerationMode) -> Self {
        Self {
            mode,
            context: PromptContext::default(),
            expected_colors: DEFAULT_EXPECTED_COLORS,
        }
    }

    pub fn with_context(mut self, context: PromptContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_color_hints(mut self, colors: &[String]) -> Self {
        self.context.color_hints = colors.to_vec();
        self
    }

    pub fn with_expected_colors(mut self, count: usize) -> Self {
        self.expected_colors = count;
        self
    }

    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    pub fn expected_colors(&self) -> usize {
        self.expected_colors
    }

    pub fn request(&self, angle: ViewAngle, kind: ViewKind) -> ViewRequest {
        ViewRequest {
            angle,
            kind,
            prompt: self.build(angle, kind),
        }
    }

    pub fn build(&self, angle: ViewAngle, kind: ViewKind) -> String {
        let mut lines = vec![format!(
            "Using the attached photo as the only reference, render the same subject as seen from a camera {}.",
            angle.camera_phrase()
        )];

        lines.push(
            "Keep proportions, silhouette, and every distinguishing feature identical to the reference; this view must line up with the other views of the same object."
                .to_string(),
        );

        match kind {
            ViewKind::Mesh => {
                lines.push(
                    "Show the full subject centred on a plain pure white background with soft, even studio lighting, no cast shadows, and an orthographic-looking camera.".to_string(),
                );
                lines.push(
                    "Do not add a base, pedestal, text, watermark, or any object that is not part of the subject.".to_string(),
                );
            }
            ViewKind::Texture => {
                lines.push(
                    "Render surface colour and material detail as evenly lit albedo with no specular highlights, reflections, or baked shadows.".to_string(),
                );
            }
        }

        match self.mode {
            GenerationMode::Simplified => lines.push(
                "Simplify the subject into a clean, chunky, 3D-printable figure: smooth surfaces, thick parts, no thin protrusions, and large regions of flat solid colour.".to_string(),
            ),
            GenerationMode::Detailed => lines.push(
                "Preserve fine surface detail, texture, and realistic materials from the photo.".to_string(),
            ),
        }

        if let Some(description) = self
            .context
            .description
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            lines.push(format!("The user describes the subject as: {description}."));
        }

        let features = self
            .context
            .detected_features
            .iter()
            .map(|feature| feature.trim())
            .filter(|feature| !feature.is_empty())
            .collect::<Vec<&str>>();
        if !features.is_empty() {
            lines.push(format!(
                "Make sure these features remain visible where this angle allows: {}.",
                features.join(", ")
            ));
        }

        if !self.context.color_hints.is_empty() {
            lines.push(format!(
                "Use exactly this colour palette and no other colours: {}.",
                self.context.color_hints.join(", ")
            ));
        }

        if kind == ViewKind::Mesh && self.expected_colors > 0 {
            lines.push(format!(
                "After the image, reply with one line in the form `COLORS: #RRGGBB, ...` listing the {} main colours of the subject as hex codes, most prominent first.",
                self.expected_colors
            ));
        }

        lines.join("\n")
    }
}
