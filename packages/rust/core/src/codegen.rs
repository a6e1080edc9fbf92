//! Script generation from a composed narrative.
//!
//! Two generators share one input: [`ManimCodeGenerator`] writes a Manim
//! scene for video rendering, [`ThreeJsCodeGenerator`] writes an interactive
//! browser page plus a reusable ES module.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

use knowtree_completion::extract::{fenced_block, strip_code_fence};
use knowtree_completion::{CompletionRequest, CompletionService, CompletionTask};
use knowtree_shared::{KnowTreeError, Result};

static SCENE_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^class\s+(\w+)\s*\(\s*\w*Scene\s*\)").expect("valid regex"));

static EXPORT_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*export\s+(?:default\s+)?class\s+(\w+)").expect("valid regex"));

/// What a generator gets to work from.
#[derive(Debug, Clone, Copy)]
pub struct CodegenInput<'a> {
    pub target_concept: &'a str,
    pub narrative: &'a str,
    pub concept_order: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedArtifact {
    pub file_name: String,
    pub language: String,
    pub code: String,
    /// Class to render, when one could be found in the code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// One or more files implementing the narrative.
    async fn generate(&self, input: CodegenInput<'_>) -> Result<Vec<GeneratedArtifact>>;
}

// ---------------------------------------------------------------------------
// Manim
// ---------------------------------------------------------------------------

const MANIM_SYSTEM_PROMPT: &str = "You are an expert Manim Community Edition animator. Generate \
complete, working Python code that implements the animation described in the prompt. Use \
`from manim import *`, define a Scene subclass, write LaTeX in raw strings, include every \
specified visual element, color and animation, and follow the scene sequence exactly. The \
code must run with `manim -pql file.py SceneName`. Return ONLY the Python code.";

pub struct ManimCodeGenerator {
    service: Arc<dyn CompletionService>,
}

impl ManimCodeGenerator {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl CodeGenerator for ManimCodeGenerator {
    fn name(&self) -> &'static str {
        "manim"
    }

    #[instrument(skip_all, fields(concept = %input.target_concept))]
    async fn generate(&self, input: CodegenInput<'_>) -> Result<Vec<GeneratedArtifact>> {
        let user = format!(
            "Generate Manim Community Edition code for this animation.\n\
Scenes in order: {}\n\n{}\n\nReturn complete Python code that can be run directly.",
            input.concept_order.join(" → "),
            input.narrative
        );
        let request = CompletionRequest::new(CompletionTask::Codegen, MANIM_SYSTEM_PROMPT, user)
            .subject(input.target_concept)
            .max_tokens(8000)
            .temperature(0.3);

        let raw = self.service.complete(&request).await?;
        let code = strip_code_fence(&raw, "python");
        if code.is_empty() {
            return Err(KnowTreeError::Codegen("empty code in reply".into()));
        }

        let entry_point = SCENE_CLASS_RE
            .captures(&code)
            .map(|caps| caps[1].to_string());
        debug!(lines = code.lines().count(), entry_point = ?entry_point, "script generated");

        Ok(vec![GeneratedArtifact {
            file_name: "animation.py".into(),
            language: "python".into(),
            code,
            entry_point,
        }])
    }
}

// ---------------------------------------------------------------------------
// Three.js
// ---------------------------------------------------------------------------

const THREEJS_SYSTEM_PROMPT: &str = "You are an expert Three.js developer who builds \
mathematical and scientific visualizations for the web. Use Three.js r150+ through ES module \
imports, OrbitControls for the camera, ambient plus directional lighting, requestAnimationFrame \
for smooth animation, a responsive canvas, BufferGeometry for parametric surfaces and \
CSS2DRenderer or sprite text for labels. Return ONLY the code.";

/// How the Manim vocabulary of the narrative maps onto Three.js.
const THREEJS_ADAPTATION: &str = "## Three.js requirements

Convert the animation above into an interactive Three.js visualization.

- Load Three.js from https://unpkg.com/three@0.150.0/build/three.module.js and OrbitControls \
from https://unpkg.com/three@0.150.0/examples/jsm/controls/OrbitControls.js
- FadeIn becomes an opacity tween, Transform a geometry lerp, Write a progressive line \
reveal, Create a scale-up, Indicate a pulse, camera moves become OrbitControls tweens
- Colors: BLUE 0x3b82f6, RED 0xef4444, GREEN 0x22c55e, YELLOW 0xeab308, PURPLE 0xa855f7, \
ORANGE 0xf97316, TEAL 0x14b8a6, GOLD 0xfbbf24, WHITE 0xffffff, GRAY 0x6b7280
- Play/pause and a timeline slider; rotate, zoom and pan with the mouse";

pub struct ThreeJsCodeGenerator {
    service: Arc<dyn CompletionService>,
}

impl ThreeJsCodeGenerator {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }

    fn adapted_prompt(input: &CodegenInput<'_>) -> String {
        format!(
            "Scenes in order: {}\n\n{}\n\n{THREEJS_ADAPTATION}",
            input.concept_order.join(" → "),
            input.narrative
        )
    }

    async fn page(&self, input: &CodegenInput<'_>, prompt: &str) -> Result<GeneratedArtifact> {
        let user = format!(
            "Generate a complete, self-contained HTML file for this visualization:\n\n{prompt}\n\n\
The page must include every CDN import, use a dark background, show the title \"{}\" as an \
overlay, have play/pause/restart controls and work when opened from file://.\n\
Return ONLY the HTML, starting with <!DOCTYPE html>.",
            input.target_concept
        );
        let request = CompletionRequest::new(CompletionTask::ThreeJsPage, THREEJS_SYSTEM_PROMPT, user)
            .subject(input.target_concept)
            .max_tokens(12000)
            .temperature(0.3);

        let code = strip_code_fence(&self.service.complete(&request).await?, "html");
        if code.is_empty() {
            return Err(KnowTreeError::Codegen("empty HTML in reply".into()));
        }
        Ok(GeneratedArtifact {
            file_name: "animation.html".into(),
            language: "html".into(),
            code,
            entry_point: None,
        })
    }

    async fn module(&self, input: &CodegenInput<'_>, prompt: &str) -> Result<GeneratedArtifact> {
        let class_name: String = input
            .target_concept
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| {
                let mut chars = w.chars();
                chars
                    .next()
                    .map(|first| first.to_ascii_uppercase().to_string() + chars.as_str())
                    .unwrap_or_default()
            })
            .collect();
        let user = format!(
            "Generate a standalone ES6 JavaScript module for this visualization:\n\n{prompt}\n\n\
Export a class named `{class_name}Visualization` whose constructor takes a container element \
and which has init(), animate() and dispose() methods. Import Three.js with ES module \
imports and do not include any HTML.\nReturn ONLY the JavaScript."
        );
        let request =
            CompletionRequest::new(CompletionTask::ThreeJsModule, THREEJS_SYSTEM_PROMPT, user)
                .subject(input.target_concept)
                .max_tokens(10000)
                .temperature(0.3);

        let raw = self.service.complete(&request).await?;
        let code = fenced_block(&raw, Some("javascript"))
            .or_else(|| fenced_block(&raw, Some("js")))
            .unwrap_or_else(|| strip_code_fence(&raw, "javascript"));
        if code.is_empty() {
            return Err(KnowTreeError::Codegen("empty module in reply".into()));
        }
        let entry_point = EXPORT_CLASS_RE
            .captures(&code)
            .map(|caps| caps[1].to_string());
        Ok(GeneratedArtifact {
            file_name: "animation.js".into(),
            language: "javascript".into(),
            code,
            entry_point,
        })
    }
}

#[async_trait]
impl CodeGenerator for ThreeJsCodeGenerator {
    fn name(&self) -> &'static str {
        "threejs"
    }

    #[instrument(skip_all, fields(concept = %input.target_concept))]
    async fn generate(&self, input: CodegenInput<'_>) -> Result<Vec<GeneratedArtifact>> {
        let prompt = Self::adapted_prompt(&input);
        let (page, module) = tokio::try_join!(self.page(&input, &prompt), self.module(&input, &prompt))?;
        debug!(
            html_bytes = page.code.len(),
            js_bytes = module.code.len(),
            "three.js visualization generated"
        );
        Ok(vec![page, module])
    }
}
