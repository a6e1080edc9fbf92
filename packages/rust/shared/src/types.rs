//! Core domain types for KnowTree runs.

use std::collections::HashSet;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KnowTreeError, Result};

/// Current schema version for the run manifest and tree document.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Free-form visual specification attached to a node.
pub type VisualSpec = serde_json::Map<String, serde_json::Value>;

/// Canonical form of a concept name used for cache keys and cycle checks:
/// trimmed, lowercased, internal whitespace collapsed.
pub fn normalize_concept(concept: &str) -> String {
    concept
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// What kind of structural note or degradation a node carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// The concept already appeared on the ancestor path; not expanded.
    CycleTruncated,
    /// Classification failed after retry; treated as foundation.
    ClassificationFailed,
    /// Prerequisite discovery failed after retry; treated as foundation.
    DiscoveryFailed,
    /// An enrichment stage produced nothing for this node.
    EnrichmentMissing { stage: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(flatten)]
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// KnowledgeNode
// ---------------------------------------------------------------------------

/// One concept in the knowledge tree, with its prerequisites nested below it.
///
/// Enrichment fields stay `None` until the matching stage runs; a stage that
/// finds nothing applicable writes an empty list instead, so the two states
/// survive a JSON round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub concept: String,
    pub depth: u32,
    pub is_foundation: bool,
    #[serde(default)]
    pub prerequisites: Vec<KnowledgeNode>,
    #[serde(default)]
    pub equations: Option<Vec<String>>,
    #[serde(default)]
    pub definitions: Option<Vec<String>>,
    #[serde(default)]
    pub visual_spec: Option<VisualSpec>,
    #[serde(default)]
    pub narrative: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl KnowledgeNode {
    /// A node that has not been classified or expanded yet.
    pub fn new(concept: impl Into<String>, depth: u32) -> Self {
        Self {
            concept: concept.into(),
            depth,
            is_foundation: false,
            prerequisites: Vec::new(),
            equations: None,
            definitions: None,
            visual_spec: None,
            narrative: None,
            diagnostics: Vec::new(),
        }
    }

    /// A terminal node.
    pub fn foundation(concept: impl Into<String>, depth: u32) -> Self {
        Self {
            is_foundation: true,
            ..Self::new(concept, depth)
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        self.diagnostics.push(diagnostic);
        self
    }

    /// A leaf standing in for a concept that is already one of its ancestors.
    pub fn is_cycle_truncated(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::CycleTruncated)
    }

    /// Total number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self
            .prerequisites
            .iter()
            .map(KnowledgeNode::node_count)
            .sum::<usize>()
    }

    /// Deepest depth value found in this subtree.
    pub fn max_depth(&self) -> u32 {
        self.prerequisites
            .iter()
            .map(KnowledgeNode::max_depth)
            .max()
            .unwrap_or(self.depth)
    }

    /// Pre-order iterator over every node in the subtree.
    pub fn iter(&self) -> impl Iterator<Item = &KnowledgeNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.prerequisites.iter().rev());
            Some(node)
        })
    }

    /// Render an indented text view of the tree.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, indent: usize) {
        let marker = if self.is_foundation { " [foundation]" } else { "" };
        let _ = writeln!(
            out,
            "{}- {} (depth {}){}",
            "  ".repeat(indent),
            self.concept,
            self.depth,
            marker
        );
        for child in &self.prerequisites {
            child.render_into(out, indent + 1);
        }
    }

    /// Check the structural invariants of a tree rooted at `self`:
    /// root depth 0, child depth = parent + 1, no node deeper than
    /// `max_depth`, nodes at `max_depth` are foundations, foundations have
    /// no prerequisites, and no concept repeats on a root-to-leaf path
    /// except as a cycle-truncated leaf.
    pub fn check_invariants(&self, max_depth: u32) -> Result<()> {
        if self.depth != 0 {
            return Err(KnowTreeError::validation(format!(
                "root {:?} has depth {}",
                self.concept, self.depth
            )));
        }
        let mut path = HashSet::new();
        self.check_node(max_depth, &mut path)
    }

    fn check_node(&self, max_depth: u32, path: &mut HashSet<String>) -> Result<()> {
        if self.depth > max_depth {
            return Err(KnowTreeError::validation(format!(
                "{:?} at depth {} exceeds max depth {max_depth}",
                self.concept, self.depth
            )));
        }
        if self.depth == max_depth && !self.is_foundation {
            return Err(KnowTreeError::validation(format!(
                "{:?} sits at max depth but is not a foundation",
                self.concept
            )));
        }
        if self.is_foundation && !self.prerequisites.is_empty() {
            return Err(KnowTreeError::validation(format!(
                "foundation {:?} has prerequisites",
                self.concept
            )));
        }

        if self.is_cycle_truncated() {
            return Ok(());
        }
        let key = normalize_concept(&self.concept);
        if !path.insert(key.clone()) {
            return Err(KnowTreeError::validation(format!(
                "{:?} repeats on its own ancestor path",
                self.concept
            )));
        }
        for child in &self.prerequisites {
            if child.depth != self.depth + 1 {
                return Err(KnowTreeError::validation(format!(
                    "{:?} has depth {} under parent at depth {}",
                    child.concept, child.depth, self.depth
                )));
            }
            child.check_node(max_depth, path)?;
        }
        path.remove(&key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunManifest
// ---------------------------------------------------------------------------

/// The `manifest.json` structure stored at the root of each run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    pub id: RunId,
    /// The raw user request.
    pub request: String,
    /// Root concept the tree was built for.
    pub target_concept: String,
    /// Completion model used.
    pub model: String,
    /// Tool version that produced this run.
    pub tool_version: String,
    pub created_at: DateTime<Utc>,
    pub max_depth: u32,
    pub node_count: usize,
    /// Concepts in teaching order, foundations first.
    pub concept_order: Vec<String>,
    /// File checksums and sizes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<serde_json::Value>,
    /// Call counts, cache hits, degraded nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> KnowledgeNode {
        let mut root = KnowledgeNode::new("Differential Equations", 0);
        let mut calculus = KnowledgeNode::new("Calculus", 1);
        calculus
            .prerequisites
            .push(KnowledgeNode::foundation("Basic Algebra", 2));
        root.prerequisites.push(calculus);
        root
    }

    #[test]
    fn normalize_collapses_case_and_whitespace() {
        assert_eq!(normalize_concept("  Linear   Algebra "), "linear algebra");
        assert_eq!(normalize_concept("VELOCITY"), "velocity");
    }

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn empty_and_absent_survive_roundtrip() {
        let mut node = KnowledgeNode::foundation("velocity", 0);
        node.equations = Some(vec![]);
        node.definitions = None;

        let json = serde_json::to_string(&node).expect("serialize");
        assert!(json.contains("\"equations\":[]"));
        assert!(json.contains("\"definitions\":null"));

        let parsed: KnowledgeNode = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, node);
    }

    #[test]
    fn diagnostics_serialize_with_kind_tag() {
        let node = KnowledgeNode::foundation("calculus", 2).with_diagnostic(Diagnostic::new(
            DiagnosticKind::EnrichmentMissing {
                stage: "math".into(),
            },
            "no response",
        ));
        let json = serde_json::to_value(&node).expect("serialize");
        assert_eq!(json["diagnostics"][0]["kind"], "enrichment_missing");
        assert_eq!(json["diagnostics"][0]["stage"], "math");

        let parsed: KnowledgeNode = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, node);
    }

    #[test]
    fn counts_and_render() {
        let tree = sample_tree();
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.max_depth(), 2);
        let concepts: Vec<_> = tree.iter().map(|n| n.concept.as_str()).collect();
        assert_eq!(concepts, ["Differential Equations", "Calculus", "Basic Algebra"]);

        let text = tree.render();
        assert!(text.contains("    - Basic Algebra (depth 2) [foundation]"));
    }

    #[test]
    fn invariants_hold_for_valid_tree() {
        sample_tree().check_invariants(2).expect("valid");
    }

    #[test]
    fn invariants_catch_path_repeat_and_depth() {
        let mut root = KnowledgeNode::new("Calculus", 0);
        root.prerequisites
            .push(KnowledgeNode::foundation("calculus", 1));
        assert!(root.check_invariants(3).is_err());

        // Non-foundation at the bound.
        assert!(sample_tree().check_invariants(1).is_err());
    }

    #[test]
    fn cycle_truncated_leaf_may_repeat_ancestor() {
        let mut root = KnowledgeNode::new("Chicken", 0);
        let mut egg = KnowledgeNode::new("Egg", 1);
        egg.prerequisites.push(
            KnowledgeNode::foundation("Chicken", 2)
                .with_diagnostic(Diagnostic::new(DiagnosticKind::CycleTruncated, "loop")),
        );
        root.prerequisites.push(egg);
        root.check_invariants(3).expect("truncated leaf is allowed");
    }

    #[test]
    fn sibling_duplicates_are_allowed() {
        let mut root = KnowledgeNode::new("Physics", 0);
        root.prerequisites.push(KnowledgeNode::foundation("Algebra", 1));
        root.prerequisites.push(KnowledgeNode::foundation("Algebra", 1));
        root.check_invariants(2).expect("siblings may repeat");
    }

    #[test]
    fn tree_fixture_validates() {
        let fixture = std::fs::read_to_string("../../../fixtures/json/tree.fixture.json")
            .expect("read fixture");
        let parsed: KnowledgeNode = serde_json::from_str(&fixture).expect("deserialize fixture");
        assert_eq!(parsed.concept, "Differential Equations");
        assert_eq!(parsed.node_count(), 4);
        parsed.check_invariants(3).expect("fixture invariants");
        assert!(parsed.narrative.is_some());
    }

    #[test]
    fn tiny_floats_in_visual_spec_survive_roundtrip() {
        let mut node = KnowledgeNode::foundation("planck length", 0);
        let mut spec = VisualSpec::new();
        spec.insert(
            "typical_values".into(),
            serde_json::json!([5.71705465e-61, 3.61739523e-37, 3.90269373e-29]),
        );
        node.visual_spec = Some(spec);

        let json = serde_json::to_string(&node).expect("serialize");
        let parsed: KnowledgeNode = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, node);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use serde_json::Value;

        fn finite_f64() -> impl Strategy<Value = f64> {
            any::<f64>().prop_filter("finite", |f| f.is_finite())
        }

        fn spec_value() -> impl Strategy<Value = Value> {
            prop_oneof![
                finite_f64().prop_map(|f| serde_json::json!(f)),
                any::<i64>().prop_map(Value::from),
                ".{0,12}".prop_map(Value::from),
                proptest::collection::vec(finite_f64(), 0..4).prop_map(|v| serde_json::json!(v)),
            ]
        }

        fn visual_spec() -> impl Strategy<Value = VisualSpec> {
            proptest::collection::btree_map("[a-z_]{1,10}", spec_value(), 0..5)
                .prop_map(|entries| entries.into_iter().collect())
        }

        fn diagnostic() -> impl Strategy<Value = Diagnostic> {
            let kind = prop_oneof![
                Just(DiagnosticKind::CycleTruncated),
                Just(DiagnosticKind::ClassificationFailed),
                Just(DiagnosticKind::DiscoveryFailed),
                "[a-z]{1,8}".prop_map(|stage| DiagnosticKind::EnrichmentMissing { stage }),
            ];
            (kind, ".{0,16}").prop_map(|(kind, message)| Diagnostic::new(kind, message))
        }

        /// Lists are `None`, `Some(vec![])` or populated.
        fn string_list() -> impl Strategy<Value = Option<Vec<String>>> {
            prop_oneof![
                Just(None),
                Just(Some(Vec::new())),
                proptest::collection::vec(".{0,12}", 1..3).prop_map(Some),
            ]
        }

        fn leaf() -> impl Strategy<Value = KnowledgeNode> {
            (
                ".{1,16}",
                0u32..6,
                any::<bool>(),
                string_list(),
                string_list(),
                proptest::option::of(visual_spec()),
                proptest::option::of(".{0,24}"),
                proptest::collection::vec(diagnostic(), 0..3),
            )
                .prop_map(
                    |(concept, depth, is_foundation, equations, definitions, visual_spec, narrative, diagnostics)| {
                        KnowledgeNode {
                            concept,
                            depth,
                            is_foundation,
                            prerequisites: Vec::new(),
                            equations,
                            definitions,
                            visual_spec,
                            narrative,
                            diagnostics,
                        }
                    },
                )
        }

        fn any_tree() -> impl Strategy<Value = KnowledgeNode> {
            leaf().prop_recursive(3, 16, 3, |inner| {
                (leaf(), proptest::collection::vec(inner, 0..3)).prop_map(
                    |(mut node, prerequisites)| {
                        node.prerequisites = prerequisites;
                        node
                    },
                )
            })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            #[test]
            fn any_tree_survives_json_roundtrip(tree in any_tree()) {
                let json = serde_json::to_string(&tree).unwrap();
                let parsed: KnowledgeNode = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(parsed, tree);
            }

            #[test]
            fn any_tree_survives_pretty_roundtrip(tree in any_tree()) {
                let json = serde_json::to_string_pretty(&tree).unwrap();
                let parsed: KnowledgeNode = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(parsed, tree);
            }
        }
    }
}
