//! Narrative composition: one scene per concept, foundations first.

use std::fmt::Write as _;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use knowtree_completion::{CompletionRequest, CompletionService, CompletionTask};
use knowtree_shared::{KnowTreeError, KnowledgeNode, Result, normalize_concept};

use super::visual::{DEFAULT_SCENE_SECS, spec_duration};
use super::{Stage, StageProgress, StageReport, check_availability};
use crate::pipeline::ProgressReporter;
use crate::tree::KnowledgeTree;

const SYSTEM_PROMPT: &str = "You are an expert educational animator who writes detailed, \
LaTeX-rich scene descriptions for Manim Community Edition. Each segment connects to what was \
just explained, introduces the new concept, shows every equation in Manim-compatible LaTeX \
with double backslashes, and names the exact visual elements, colors, positions and \
animations. Write in an enthusiastic second-person teaching tone.";

/// The composed explanation for a whole tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Narrative {
    pub target_concept: String,
    /// Markdown document: header, timestamped scenes, closing notes.
    pub text: String,
    pub concept_order: Vec<String>,
    pub total_duration_secs: u32,
    pub scene_count: usize,
}

struct Scene {
    concept: String,
    duration: u32,
    body: String,
}

pub struct NarrativeComposer {
    service: Arc<dyn CompletionService>,
}

impl NarrativeComposer {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }

    /// Write one segment per distinct concept in teaching order and assemble
    /// them into the root's `narrative`. Segments are requested concurrently
    /// but always assembled in order; a failed segment is replaced by text
    /// rendered from the node's own annotations.
    #[instrument(skip_all, fields(nodes = tree.len()))]
    pub async fn compose(
        &self,
        tree: &mut KnowledgeTree,
        progress: &dyn ProgressReporter,
    ) -> Result<(Narrative, StageReport)> {
        let order = tree.concept_order();
        let concepts = tree.concepts(&order);
        let counter = StageProgress::new(Stage::Narrative, order.len(), progress);
        let counter = &counter;

        let calls = order.iter().enumerate().map(|(i, &id)| {
            let prompt = segment_prompt(&tree.node(id).data, i, &concepts);
            let concept = concepts[i].clone();
            async move {
                let result = self.segment(&concept, prompt).await;
                counter.tick();
                result
            }
        });
        let results = join_all(calls).await;

        check_availability(Stage::Narrative, &results)?;
        let report = StageReport::from_results(Stage::Narrative, &results);

        let mut scenes = Vec::with_capacity(order.len());
        for (&id, result) in order.iter().zip(results) {
            let data = &tree.node(id).data;
            let duration = data
                .visual_spec
                .as_ref()
                .and_then(spec_duration)
                .unwrap_or(DEFAULT_SCENE_SECS);
            let body = match result {
                Ok(text) => text,
                Err(e) => {
                    warn!(concept = %data.concept, error = %e, "narrative segment fell back to local text");
                    let fallback = fallback_segment(data);
                    let key = normalize_concept(&data.concept);
                    let affected: Vec<_> = tree
                        .ids()
                        .filter(|&other| normalize_concept(&tree.node(other).data.concept) == key)
                        .collect();
                    for other in affected {
                        tree.node_mut(other).data.diagnostics.push(Stage::Narrative.missing(&e));
                    }
                    fallback
                }
            };
            scenes.push(Scene {
                concept: tree.node(id).data.concept.clone(),
                duration,
                body,
            });
        }

        let root = tree.root();
        let target = tree.node(root).data.concept.clone();
        let total_duration_secs = scenes.iter().map(|s| s.duration).sum();
        let text = assemble(&target, &scenes, total_duration_secs);
        tree.node_mut(root).data.narrative = Some(text.clone());

        debug!(scenes = scenes.len(), total_duration_secs, "narrative assembled");
        Ok((
            Narrative {
                target_concept: target,
                text,
                concept_order: concepts,
                total_duration_secs,
                scene_count: scenes.len(),
            },
            report,
        ))
    }

    async fn segment(&self, concept: &str, prompt: String) -> Result<String> {
        let request = CompletionRequest::new(CompletionTask::Narrative, SYSTEM_PROMPT, prompt)
            .subject(concept)
            .max_tokens(1500)
            .temperature(0.7);
        let text = self.service.complete(&request).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(KnowTreeError::parse(format!("empty narrative segment for {concept:?}")));
        }
        Ok(text.to_string())
    }
}

fn segment_prompt(node: &KnowledgeNode, index: usize, concepts: &[String]) -> String {
    let previous = if index == 0 {
        "none (this is the first concept)".to_string()
    } else {
        concepts[..index].join(", ")
    };
    let spec = node.visual_spec.as_ref();
    let field = |key: &str| spec.and_then(|s| s.get(key)).cloned().unwrap_or(Value::Null);

    let mut out = format!(
        "Write a 200-300 word narrative segment for a Manim animation.\n\n\
Segment {} of {}\nConcept: {}\nPrevious concepts covered: {previous}\n",
        index + 1,
        concepts.len(),
        node.concept
    );
    if index + 1 == concepts.len() {
        out.push_str("This is the final segment: the target concept everything builds toward.\n");
    }
    let _ = write!(
        out,
        "\nMathematical content:\nEquations: {}\nDefinitions: {}\n\n\
Visual specification:\nElements: {}\nColors: {}\nAnimations: {}\nLayout: {}\nDuration: {} seconds\n\n\
Start by connecting to the previous concept, introduce {} naturally, display the key \
equations with exact LaTeX, and describe each animation step with colors, positions and timing. \
Answer with a single paragraph.",
        json!(node.equations.clone().unwrap_or_default()),
        json!(node.definitions.clone().unwrap_or_default()),
        field("elements"),
        field("colors"),
        field("animations"),
        field("layout"),
        spec.and_then(spec_duration).unwrap_or(DEFAULT_SCENE_SECS),
        node.concept,
    );
    out
}

/// Scene text built from the node's annotations alone.
fn fallback_segment(node: &KnowledgeNode) -> String {
    let mut out = format!("Introduce {}.", node.concept);
    if let Some(equations) = node.equations.as_deref().filter(|e| !e.is_empty()) {
        let _ = write!(out, " Display the key equations: {}.", equations.join("; "));
    }
    if let Some(definitions) = node.definitions.as_deref().filter(|d| !d.is_empty()) {
        let _ = write!(out, " Define {}.", definitions.join("; "));
    }
    let elements: Vec<String> = node
        .visual_spec
        .as_ref()
        .and_then(|spec| spec.get("elements"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if !elements.is_empty() {
        let _ = write!(out, " Show {}.", elements.join(", "));
    }
    out
}

fn clock(secs: u32) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn assemble(target: &str, scenes: &[Scene], total: u32) -> String {
    let progression: Vec<&str> = scenes.iter().map(|s| s.concept.as_str()).collect();
    let first = progression.first().copied().unwrap_or(target);

    let mut out = String::new();
    let _ = writeln!(out, "# Explaining: {target}\n");
    let _ = writeln!(out, "## Overview\n");
    let _ = writeln!(
        out,
        "This explanation builds {target} from first principles, starting from {first} and \
adding one concept at a time until every prerequisite is in place.\n"
    );
    let _ = writeln!(out, "**Concepts:** {}", scenes.len());
    let _ = writeln!(out, "**Progression:** {}", progression.join(" → "));
    let _ = writeln!(
        out,
        "**Estimated duration:** {} ({total} seconds)\n",
        clock(total)
    );
    let _ = writeln!(out, "## Scene sequence\n");

    let mut start = 0;
    for (i, scene) in scenes.iter().enumerate() {
        let end = start + scene.duration;
        let _ = writeln!(out, "### Scene {}: {}", i + 1, scene.concept);
        let _ = writeln!(out, "**Timestamp:** {} - {}\n", clock(start), clock(end));
        let _ = writeln!(out, "{}\n\n---\n", scene.body);
        start = end;
    }

    let _ = writeln!(out, "## Closing notes\n");
    let _ = writeln!(
        out,
        "The progression from {first} to {target} introduces every prerequisite before the \
concepts that rely on it. Keep colors and transitions consistent across the {total}-second \
sequence."
    );
    out
}
