//! Arena representation of a knowledge tree.
//!
//! The explorer produces a nested [`KnowledgeNode`]; enrichment works on a
//! flat table instead, where nodes are addressed by [`NodeId`] and each
//! stage can annotate nodes in place without walking borrowed subtrees.

use std::collections::{HashMap, HashSet};

use knowtree_shared::{KnowledgeNode, normalize_concept};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Side data gathered by the mathematical stage for the visual stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MathNotes {
    pub interpretation: Option<String>,
    pub examples: Vec<String>,
    pub typical_values: Option<serde_json::Value>,
}

impl MathNotes {
    pub fn is_empty(&self) -> bool {
        self.interpretation.is_none() && self.examples.is_empty() && self.typical_values.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ArenaNode {
    pub children: Vec<NodeId>,
    /// Node fields; `prerequisites` is always empty inside the arena.
    pub data: KnowledgeNode,
    pub notes: MathNotes,
}

/// All instances of one normalized concept within a node set.
#[derive(Debug, Clone)]
pub struct ConceptGroup {
    pub key: String,
    pub ids: Vec<NodeId>,
}

impl ConceptGroup {
    pub fn representative(&self) -> NodeId {
        self.ids[0]
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeTree {
    nodes: Vec<ArenaNode>,
}

impl KnowledgeTree {
    /// Flatten a nested tree. The root becomes node 0 and every child gets a
    /// higher id than its parent.
    pub fn from_root(root: KnowledgeNode) -> Self {
        let mut nodes = Vec::with_capacity(root.node_count());
        push_node(&mut nodes, root);
        Self { nodes }
    }

    /// Rebuild the nested tree.
    pub fn into_root(mut self) -> KnowledgeNode {
        build_node(&mut self.nodes, NodeId(0))
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &ArenaNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ArenaNode {
        &mut self.nodes[id.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Every node after all of its descendants, children left to right.
    pub fn post_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root(), false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            for &child in self.node(id).children.iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// Node ids grouped by depth, deepest level first.
    pub fn levels_bottom_up(&self) -> Vec<Vec<NodeId>> {
        let mut levels: Vec<Vec<NodeId>> = Vec::new();
        for id in self.ids() {
            let depth = self.node(id).data.depth as usize;
            if levels.len() <= depth {
                levels.resize_with(depth + 1, Vec::new);
            }
            levels[depth].push(id);
        }
        levels.retain(|level| !level.is_empty());
        levels.reverse();
        levels
    }

    /// Group `ids` by normalized concept, preserving first-seen order.
    pub fn group_by_concept(&self, ids: &[NodeId]) -> Vec<ConceptGroup> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<ConceptGroup> = Vec::new();
        for &id in ids {
            let key = normalize_concept(&self.node(id).data.concept);
            match index.get(&key) {
                Some(&at) => groups[at].ids.push(id),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push(ConceptGroup { key, ids: vec![id] });
                }
            }
        }
        groups
    }

    /// Teaching order: one representative node per distinct concept, every
    /// concept after all concepts it depends on anywhere in the tree.
    ///
    /// Dependencies are merged across repeated instances of a concept. The
    /// representative is the first expanded instance in pre-order (or the
    /// first instance if none was expanded). Edges that close a cycle are
    /// ignored.
    pub fn concept_order(&self) -> Vec<NodeId> {
        let mut representative: HashMap<String, NodeId> = HashMap::new();
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();

        for id in self.pre_order() {
            let node = self.node(id);
            let key = normalize_concept(&node.data.concept);
            let current = *representative.entry(key.clone()).or_insert(id);
            if self.node(current).children.is_empty() && !node.children.is_empty() {
                representative.insert(key.clone(), id);
            }
            let targets = edges.entry(key).or_default();
            for &child in &node.children {
                let child_key = normalize_concept(&self.node(child).data.concept);
                if !targets.contains(&child_key) {
                    targets.push(child_key);
                }
            }
        }

        let mut walk = OrderWalk {
            edges: &edges,
            seen: HashSet::new(),
            order: Vec::with_capacity(representative.len()),
        };
        walk.visit(&normalize_concept(&self.node(self.root()).data.concept));

        walk.order
            .into_iter()
            .filter_map(|key| representative.get(&key).copied())
            .collect()
    }

    /// Concept names for a list of ids.
    pub fn concepts(&self, ids: &[NodeId]) -> Vec<String> {
        ids.iter()
            .map(|&id| self.node(id).data.concept.clone())
            .collect()
    }

    fn pre_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.node(id).children.iter().rev());
        }
        order
    }
}

/// Depth-first post-order over the concept graph. A concept is marked on
/// entry, so an edge back to a concept still being visited is skipped.
struct OrderWalk<'a> {
    edges: &'a HashMap<String, Vec<String>>,
    seen: HashSet<String>,
    order: Vec<String>,
}

impl OrderWalk<'_> {
    fn visit(&mut self, key: &str) {
        if !self.seen.insert(key.to_string()) {
            return;
        }
        if let Some(targets) = self.edges.get(key) {
            for target in targets {
                self.visit(target);
            }
        }
        self.order.push(key.to_string());
    }
}

fn push_node(nodes: &mut Vec<ArenaNode>, mut data: KnowledgeNode) -> NodeId {
    let id = NodeId(nodes.len());
    let children = std::mem::take(&mut data.prerequisites);
    nodes.push(ArenaNode {
        children: Vec::with_capacity(children.len()),
        data,
        notes: MathNotes::default(),
    });
    for child in children {
        let child_id = push_node(nodes, child);
        nodes[id.0].children.push(child_id);
    }
    id
}

fn build_node(nodes: &mut [ArenaNode], id: NodeId) -> KnowledgeNode {
    let children = std::mem::take(&mut nodes[id.0].children);
    let mut data = std::mem::take(&mut nodes[id.0].data);
    data.prerequisites = children
        .into_iter()
        .map(|child| build_node(nodes, child))
        .collect();
    data
}
