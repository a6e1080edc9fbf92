//! Mathematical enrichment: equations, symbol definitions, and worked notes.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use knowtree_completion::extract::first_json_object;
use knowtree_completion::{CompletionRequest, CompletionService, CompletionTask};
use knowtree_shared::{KnowTreeError, Result};

use super::{Stage, StageProgress, StageReport, check_availability};
use crate::pipeline::ProgressReporter;
use crate::tree::{KnowledgeTree, MathNotes, NodeId};

const SYSTEM_PROMPT: &str = "You are an expert mathematician and physicist who presents \
concepts with precise LaTeX notation suitable for Manim's MathTex. Use double backslashes \
for LaTeX commands. Return ONLY a JSON object with the keys: equations (2-5 LaTeX strings), \
definitions (object mapping each symbol to its meaning), interpretation (string), \
examples (1-2 worked examples as strings), typical_values (object of typical magnitudes).";

/// Parsed reply for one concept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MathDetail {
    pub equations: Vec<String>,
    /// `"symbol: meaning"` entries.
    pub definitions: Vec<String>,
    pub notes: MathNotes,
}

pub struct MathEnricher {
    service: Arc<dyn CompletionService>,
}

impl MathEnricher {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }

    /// Annotate every node with equations and definitions, one call per
    /// distinct concept. A concept whose reply cannot be used gets empty
    /// lists and a diagnostic on each of its nodes.
    #[instrument(skip_all, fields(nodes = tree.len()))]
    pub async fn enrich(
        &self,
        tree: &mut KnowledgeTree,
        progress: &dyn ProgressReporter,
    ) -> Result<StageReport> {
        let ids: Vec<NodeId> = tree.ids().collect();
        let groups = tree.group_by_concept(&ids);
        let counter = StageProgress::new(Stage::Math, groups.len(), progress);
        let counter = &counter;

        let calls = groups.iter().map(|group| {
            let node = &tree.node(group.representative()).data;
            let concept = node.concept.clone();
            let depth = node.depth;
            let foundational = group.ids.iter().all(|&id| tree.node(id).data.is_foundation);
            async move {
                let result = self.detail(&concept, depth, foundational).await;
                counter.tick();
                result
            }
        });
        let results = join_all(calls).await;

        check_availability(Stage::Math, &results)?;
        let report = StageReport::from_results(Stage::Math, &results);

        for (group, result) in groups.iter().zip(results) {
            match result {
                Ok(detail) => {
                    for &id in &group.ids {
                        let node = tree.node_mut(id);
                        node.data.equations = Some(detail.equations.clone());
                        node.data.definitions = Some(detail.definitions.clone());
                        node.notes = detail.notes.clone();
                    }
                }
                Err(e) => {
                    warn!(concept = %group.key, error = %e, "no mathematical detail");
                    for &id in &group.ids {
                        let data = &mut tree.node_mut(id).data;
                        data.equations = Some(Vec::new());
                        data.definitions = Some(Vec::new());
                        data.diagnostics.push(Stage::Math.missing(&e));
                    }
                }
            }
        }
        Ok(report)
    }

    async fn detail(&self, concept: &str, depth: u32, foundational: bool) -> Result<MathDetail> {
        let level = if foundational {
            "high school level"
        } else {
            "undergraduate level"
        };
        let user = format!(
            "Concept: {concept}\n\
Complexity level: {level}\n\
Depth in knowledge tree: {depth} (0 is the target concept, higher is more foundational)\n\n\
Provide the mathematical content for this concept as JSON:\n\
{{\"equations\": [\"...\"], \"definitions\": {{\"symbol\": \"meaning\"}}, \
\"interpretation\": \"...\", \"examples\": [\"...\"], \"typical_values\": {{\"quantity\": \"value\"}}}}"
        );
        let request = CompletionRequest::new(CompletionTask::Math, SYSTEM_PROMPT, user)
            .subject(concept)
            .max_tokens(2000)
            .temperature(0.4);

        let raw = self.service.complete(&request).await?;
        let detail = parse_math(&raw)?;
        debug!(
            %concept,
            equations = detail.equations.len(),
            definitions = detail.definitions.len(),
            "math detail"
        );
        Ok(detail)
    }
}

/// Extract a [`MathDetail`] from a reply that contains a JSON object.
pub fn parse_math(raw: &str) -> Result<MathDetail> {
    let object = first_json_object(raw)
        .ok_or_else(|| KnowTreeError::parse("no JSON object in mathematical reply"))?;

    let notes = MathNotes {
        interpretation: object
            .get("interpretation")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        examples: string_list(object.get("examples")),
        typical_values: object
            .get("typical_values")
            .filter(|v| !is_blank(v))
            .cloned(),
    };

    Ok(MathDetail {
        equations: string_list(object.get("equations")),
        definitions: definitions(&object),
        notes,
    })
}

fn definitions(object: &Map<String, Value>) -> Vec<String> {
    match object.get("definitions") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(symbol, meaning)| match meaning {
                Value::String(text) => format!("{symbol}: {}", text.trim()),
                other => format!("{symbol}: {other}"),
            })
            .collect(),
        other => string_list(other),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
