//! Visual design: what each concept's scene shows and how it animates.
//!
//! Levels are designed deepest first so that every prompt can include the
//! elements and colors already chosen for the concept's prerequisites.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use knowtree_completion::extract::first_json_object;
use knowtree_completion::{CompletionRequest, CompletionService, CompletionTask};
use knowtree_shared::{KnowTreeError, Result, VisualSpec, normalize_concept};

use super::{Stage, StageProgress, StageReport, check_availability};
use crate::pipeline::ProgressReporter;
use crate::tree::{ConceptGroup, KnowledgeTree, MathNotes, NodeId};

const SYSTEM_PROMPT: &str = "You are an expert Manim animator who designs clear mathematical \
visualizations for Manim Community Edition. Keep colors consistent with the prerequisite \
scenes you are shown and connect visually to them. Return ONLY a JSON object with the keys: \
elements (list), colors (object of element to Manim color name), animations (list of Manim \
animation names), transitions (list), camera_movement (string), duration (seconds, 5-30), \
layout (string).";

pub const DEFAULT_SCENE_SECS: u32 = 15;
const MIN_SCENE_SECS: u32 = 5;
const MAX_SCENE_SECS: u32 = 30;

/// Parsed visual design for one concept.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualDesign {
    pub elements: Vec<Value>,
    pub colors: Map<String, Value>,
    pub animations: Vec<Value>,
    pub transitions: Vec<Value>,
    pub camera_movement: Option<String>,
    /// Scene length in seconds, clamped to 5..=30.
    pub duration: u32,
    pub layout: Option<String>,
}

impl VisualDesign {
    /// Parse the first JSON object in a reply.
    pub fn parse(raw: &str) -> Result<Self> {
        let object = first_json_object(raw)
            .ok_or_else(|| KnowTreeError::parse("no JSON object in visual reply"))?;

        let elements = array(&object, "elements");
        if elements.is_empty() {
            return Err(KnowTreeError::parse("visual reply has no elements"));
        }

        let duration = match object.get("duration") {
            Some(Value::Number(n)) => n
                .as_f64()
                .map(|secs| secs.round().clamp(f64::from(MIN_SCENE_SECS), f64::from(MAX_SCENE_SECS)) as u32),
            Some(Value::String(s)) => s
                .trim()
                .trim_end_matches('s')
                .trim()
                .parse::<u32>()
                .ok()
                .map(|secs| secs.clamp(MIN_SCENE_SECS, MAX_SCENE_SECS)),
            _ => None,
        }
        .unwrap_or(DEFAULT_SCENE_SECS);

        Ok(Self {
            elements,
            colors: match object.get("colors") {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            },
            animations: array(&object, "animations"),
            transitions: array(&object, "transitions"),
            camera_movement: text(&object, "camera_movement"),
            duration,
            layout: text(&object, "layout"),
        })
    }

    /// The node's `visual_spec`: this design merged with the notes left by
    /// the mathematical stage.
    pub fn to_spec(&self, notes: &MathNotes) -> VisualSpec {
        let mut spec = Map::new();
        spec.insert("elements".into(), Value::Array(self.elements.clone()));
        spec.insert("colors".into(), Value::Object(self.colors.clone()));
        spec.insert("animations".into(), Value::Array(self.animations.clone()));
        spec.insert("transitions".into(), Value::Array(self.transitions.clone()));
        if let Some(camera) = &self.camera_movement {
            spec.insert("camera_movement".into(), json!(camera));
        }
        spec.insert("duration".into(), json!(self.duration));
        if let Some(layout) = &self.layout {
            spec.insert("layout".into(), json!(layout));
        }
        if let Some(interpretation) = &notes.interpretation {
            spec.insert("interpretation".into(), json!(interpretation));
        }
        if !notes.examples.is_empty() {
            spec.insert("examples".into(), json!(notes.examples));
        }
        if let Some(values) = &notes.typical_values {
            spec.insert("typical_values".into(), values.clone());
        }
        spec
    }

    /// One-line summary used as context in later prompts.
    fn summary(&self) -> String {
        let elements: Vec<String> = self.elements.iter().map(display_value).collect();
        format!(
            "elements [{}], colors {}",
            elements.join(", "),
            Value::Object(self.colors.clone())
        )
    }
}

/// Scene length recorded in a node's `visual_spec`, if any.
pub fn spec_duration(spec: &VisualSpec) -> Option<u32> {
    spec.get("duration")
        .and_then(Value::as_u64)
        .and_then(|secs| u32::try_from(secs).ok())
}

fn array(object: &Map<String, Value>, key: &str) -> Vec<Value> {
    match object.get(key) {
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![json!(s.trim())],
        _ => Vec::new(),
    }
}

fn text(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct VisualDesigner {
    service: Arc<dyn CompletionService>,
}

impl VisualDesigner {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }

    /// Design every distinct concept, deepest level first, then write the
    /// resulting `visual_spec` onto each node. A concept whose reply cannot
    /// be used gets `{"elements": []}` and a diagnostic.
    #[instrument(skip_all, fields(nodes = tree.len()))]
    pub async fn design(
        &self,
        tree: &mut KnowledgeTree,
        progress: &dyn ProgressReporter,
    ) -> Result<StageReport> {
        let all: Vec<NodeId> = tree.ids().collect();
        let counter = StageProgress::new(Stage::Visual, tree.group_by_concept(&all).len(), progress);
        let counter = &counter;

        let mut designs: HashMap<String, Result<VisualDesign>> = HashMap::new();
        for level in tree.levels_bottom_up() {
            let groups = tree.group_by_concept(&level);
            let pending: Vec<&ConceptGroup> = groups
                .iter()
                .filter(|g| !designs.contains_key(&g.key))
                .collect();
            if pending.is_empty() {
                continue;
            }

            let calls = pending.iter().map(|group| {
                let id = group.representative();
                let concept = tree.node(id).data.concept.clone();
                let prompt = design_prompt(tree, id, &designs);
                async move {
                    let result = self.request(&concept, prompt).await;
                    counter.tick();
                    result
                }
            });
            let results = join_all(calls).await;

            if results.iter().any(|r| matches!(r, Err(e) if e.is_cancelled())) {
                return Err(KnowTreeError::Cancelled);
            }
            for (group, result) in pending.into_iter().zip(results) {
                designs.insert(group.key.clone(), result);
            }
        }

        check_availability(Stage::Visual, designs.values())?;
        let report = StageReport::from_results(Stage::Visual, designs.values());

        for id in all {
            let key = normalize_concept(&tree.node(id).data.concept);
            let node = tree.node_mut(id);
            match designs.get(&key) {
                Some(Ok(design)) => node.data.visual_spec = Some(design.to_spec(&node.notes)),
                Some(Err(e)) => {
                    warn!(concept = %node.data.concept, error = %e, "no visual design");
                    let mut empty = Map::new();
                    empty.insert("elements".into(), Value::Array(Vec::new()));
                    node.data.visual_spec = Some(empty);
                    node.data.diagnostics.push(Stage::Visual.missing(e));
                }
                None => {}
            }
        }
        Ok(report)
    }

    async fn request(&self, concept: &str, prompt: String) -> Result<VisualDesign> {
        let request = CompletionRequest::new(CompletionTask::Visual, SYSTEM_PROMPT, prompt)
            .subject(concept)
            .max_tokens(2500)
            .temperature(0.6);
        let raw = self.service.complete(&request).await?;
        let design = VisualDesign::parse(&raw)?;
        debug!(%concept, elements = design.elements.len(), duration = design.duration, "visual design");
        Ok(design)
    }
}

fn design_prompt(
    tree: &KnowledgeTree,
    id: NodeId,
    designs: &HashMap<String, Result<VisualDesign>>,
) -> String {
    let node = tree.node(id);
    let data = &node.data;

    let mut out = format!(
        "Concept: {}\nDepth: {} (0 is the target concept)\nFoundation: {}\n",
        data.concept, data.depth, data.is_foundation
    );
    match data.equations.as_deref() {
        Some(equations) if !equations.is_empty() => {
            let _ = writeln!(out, "Equations to visualize: {}", json!(equations));
        }
        _ => out.push_str("Equations to visualize: none\n"),
    }

    if node.children.is_empty() {
        out.push_str("Prerequisite scenes: none\n");
    } else {
        out.push_str("Prerequisite scenes already designed:\n");
        for &child in &node.children {
            let concept = &tree.node(child).data.concept;
            match designs.get(&normalize_concept(concept)) {
                Some(Ok(design)) => {
                    let _ = writeln!(out, "- {concept}: {}", design.summary());
                }
                _ => {
                    let _ = writeln!(out, "- {concept}: no design");
                }
            }
        }
    }

    out.push_str(
        "\nDesign a Manim animation segment for this concept that builds on the prerequisite \
scenes. Return JSON:\n{\"elements\": [], \"colors\": {}, \"animations\": [], \"transitions\": [], \
\"camera_movement\": \"\", \"duration\": 15, \"layout\": \"\"}",
    );
    out
}
