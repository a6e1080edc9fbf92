//! Recursive, cache-aware, depth-bounded prerequisite exploration.
//!
//! Starting from a root concept, each node is either a foundation (terminal)
//! or expanded into its prerequisites, which are explored concurrently. The
//! ancestor path travels with each branch so a concept can never reappear
//! below itself; a prerequisite that would close a cycle becomes a
//! foundation leaf carrying a `CycleTruncated` diagnostic.
//!
//! A failed classification or discovery is retried; if it still fails the
//! node degrades to a foundation with a diagnostic, except at the root where
//! the error is returned. Cancellation is never degraded.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use knowtree_completion::CompletionService;
use knowtree_shared::{
    Diagnostic, DiagnosticKind, ExploreConfig, KnowTreeError, KnowledgeNode, Result,
    normalize_concept,
};

use crate::cache::{CacheKind, CacheStats, CachedResult, ConceptCache};
use crate::classifier::FoundationClassifier;
use crate::discoverer::PrerequisiteDiscoverer;
use crate::pipeline::ProgressReporter;

/// Counters describing one exploration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExploreStats {
    pub nodes: usize,
    pub foundations: usize,
    pub max_depth_reached: u32,
    pub cycles_truncated: usize,
    /// Nodes that became foundations because a call failed twice.
    pub degraded: usize,
    pub retries: usize,
    pub cache: CacheStats,
}

#[derive(Debug, Clone)]
pub struct ExploreOutcome {
    pub tree: KnowledgeNode,
    pub stats: ExploreStats,
}

pub struct TreeExplorer {
    classifier: FoundationClassifier,
    discoverer: PrerequisiteDiscoverer,
    cache: Arc<ConceptCache>,
    config: ExploreConfig,
    cancel: CancellationToken,
    retries: AtomicUsize,
}

impl TreeExplorer {
    /// `service` should already enforce the fan-out limit and call timeout
    /// (see [`GuardedCompletion`](crate::guard::GuardedCompletion)).
    pub fn new(
        service: Arc<dyn CompletionService>,
        cache: Arc<ConceptCache>,
        config: ExploreConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            classifier: FoundationClassifier::new(service.clone()),
            discoverer: PrerequisiteDiscoverer::new(service).with_max(config.max_prerequisites),
            cache,
            config,
            cancel,
            retries: AtomicUsize::new(0),
        }
    }

    /// Build the knowledge tree rooted at `root`.
    #[instrument(skip_all, fields(root = %root, max_depth = self.config.max_depth))]
    pub async fn explore(
        &self,
        root: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<ExploreOutcome> {
        let root = root.trim();
        if root.is_empty() {
            return Err(KnowTreeError::validation("root concept is empty"));
        }

        info!("exploring prerequisites");
        let tree = self
            .explore_node(root.to_string(), 0, Arc::new(Vec::new()), progress)
            .await?;

        let stats = self.collect_stats(&tree);
        info!(
            nodes = stats.nodes,
            foundations = stats.foundations,
            depth = stats.max_depth_reached,
            cache_hits = stats.cache.hits,
            cache_misses = stats.cache.misses,
            degraded = stats.degraded,
            "exploration complete"
        );
        Ok(ExploreOutcome { tree, stats })
    }

    fn explore_node<'a>(
        &'a self,
        concept: String,
        depth: u32,
        ancestors: Arc<Vec<String>>,
        progress: &'a dyn ProgressReporter,
    ) -> BoxFuture<'a, Result<KnowledgeNode>> {
        async move {
            if self.cancel.is_cancelled() {
                return Err(KnowTreeError::Cancelled);
            }

            if depth >= self.config.max_depth {
                debug!(%concept, depth, "depth bound reached");
                progress.node_explored(&concept, depth, true);
                return Ok(KnowledgeNode::foundation(concept, depth));
            }

            let is_foundation = match self.lookup_foundation(&concept).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    return self.degrade(concept, depth, e, DiagnosticKind::ClassificationFailed, progress);
                }
            };
            if is_foundation {
                progress.node_explored(&concept, depth, true);
                return Ok(KnowledgeNode::foundation(concept, depth));
            }

            let prerequisites = match self.lookup_prerequisites(&concept).await {
                Ok(list) => list,
                Err(e) => {
                    return self.degrade(concept, depth, e, DiagnosticKind::DiscoveryFailed, progress);
                }
            };
            progress.node_explored(&concept, depth, false);

            let mut path = Vec::with_capacity(ancestors.len() + 1);
            path.extend(ancestors.iter().cloned());
            path.push(normalize_concept(&concept));
            let path = Arc::new(path);

            let branches = prerequisites.into_iter().map(|child| -> BoxFuture<'a, Result<KnowledgeNode>> {
                if path.contains(&normalize_concept(&child)) {
                    debug!(parent = %concept, %child, "cycle truncated");
                    let leaf = KnowledgeNode::foundation(child, depth + 1).with_diagnostic(
                        Diagnostic::new(
                            DiagnosticKind::CycleTruncated,
                            format!("already an ancestor of {concept}"),
                        ),
                    );
                    futures_util::future::ready(Ok(leaf)).boxed()
                } else {
                    self.explore_node(child, depth + 1, path.clone(), progress)
                }
            });

            let children = join_all(branches)
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()?;

            let mut node = KnowledgeNode::new(concept, depth);
            node.prerequisites = children;
            Ok(node)
        }
        .boxed()
    }

    /// Turn a failed lookup into a foundation leaf, or propagate it at the
    /// root and on cancellation.
    fn degrade(
        &self,
        concept: String,
        depth: u32,
        error: KnowTreeError,
        kind: DiagnosticKind,
        progress: &dyn ProgressReporter,
    ) -> Result<KnowledgeNode> {
        if depth == 0 || error.is_cancelled() {
            return Err(error);
        }
        warn!(%concept, depth, error = %error, "treating as foundation after failure");
        progress.node_explored(&concept, depth, true);
        Ok(KnowledgeNode::foundation(concept, depth)
            .with_diagnostic(Diagnostic::new(kind, error.to_string())))
    }

    async fn lookup_foundation(&self, concept: &str) -> Result<bool> {
        self.cache
            .get_or_try_insert_with(CacheKind::Foundation, concept, || async {
                self.with_retry("classify", concept, || self.classifier.classify(concept))
                    .await
                    .map(CachedResult::Foundation)
            })
            .await?
            .into_foundation()
    }

    async fn lookup_prerequisites(&self, concept: &str) -> Result<Vec<String>> {
        self.cache
            .get_or_try_insert_with(CacheKind::Prerequisites, concept, || async {
                self.with_retry("discover", concept, || self.discoverer.discover(concept))
                    .await
                    .map(CachedResult::Prerequisites)
            })
            .await?
            .into_prerequisites()
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, concept: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if attempt < self.config.retries => {
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(op, %concept, attempt, error = %e, "retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn collect_stats(&self, tree: &KnowledgeNode) -> ExploreStats {
        let mut stats = ExploreStats {
            retries: self.retries.load(Ordering::Relaxed),
            cache: self.cache.stats(),
            ..ExploreStats::default()
        };
        for node in tree.iter() {
            stats.nodes += 1;
            stats.max_depth_reached = stats.max_depth_reached.max(node.depth);
            if node.is_foundation {
                stats.foundations += 1;
            }
            for diagnostic in &node.diagnostics {
                match diagnostic.kind {
                    DiagnosticKind::CycleTruncated => stats.cycles_truncated += 1,
                    DiagnosticKind::ClassificationFailed | DiagnosticKind::DiscoveryFailed => {
                        stats.degraded += 1
                    }
                    DiagnosticKind::EnrichmentMissing { .. } => {}
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::guard::GuardedCompletion;
    use crate::pipeline::SilentProgress;
    use crate::testing::ScriptedCompletion;
    use knowtree_completion::CompletionTask;

    fn explorer_with(service: Arc<ScriptedCompletion>, max_depth: u32) -> TreeExplorer {
        let config = ExploreConfig {
            max_depth,
            ..ExploreConfig::default()
        };
        TreeExplorer::new(
            service,
            Arc::new(ConceptCache::new()),
            config,
            CancellationToken::new(),
        )
    }

    fn concepts(node: &KnowledgeNode) -> Vec<&str> {
        node.iter().map(|n| n.concept.as_str()).collect()
    }

    #[tokio::test]
    async fn foundational_root_is_single_node() {
        let service = Arc::new(ScriptedCompletion::new().foundations(["velocity"]));
        let explorer = explorer_with(service.clone(), 1);
        let outcome = explorer.explore("velocity", &SilentProgress).await.unwrap();

        assert_eq!(outcome.tree.concept, "velocity");
        assert_eq!(outcome.tree.depth, 0);
        assert!(outcome.tree.is_foundation);
        assert!(outcome.tree.prerequisites.is_empty());
        assert_eq!(service.calls_for(CompletionTask::Discover), 0);
    }

    #[tokio::test]
    async fn chain_is_explored_to_foundation() {
        let service = Arc::new(
            ScriptedCompletion::new()
                .prerequisites("Differential Equations", &["Calculus"])
                .prerequisites("Calculus", &["Basic Algebra"]),
        );
        let explorer = explorer_with(service, 4);
        let outcome = explorer
            .explore("Differential Equations", &SilentProgress)
            .await
            .unwrap();

        assert_eq!(
            concepts(&outcome.tree),
            ["Differential Equations", "Calculus", "Basic Algebra"]
        );
        let algebra = &outcome.tree.prerequisites[0].prerequisites[0];
        assert_eq!(algebra.depth, 2);
        assert!(algebra.is_foundation);
        outcome.tree.check_invariants(4).unwrap();
        assert_eq!(outcome.stats.nodes, 3);
    }

    #[tokio::test]
    async fn depth_bound_forces_foundations() {
        let service = Arc::new(
            ScriptedCompletion::new()
                .prerequisites("A", &["B"])
                .prerequisites("B", &["C"])
                .prerequisites("C", &["D"]),
        );
        let explorer = explorer_with(service.clone(), 2);
        let outcome = explorer.explore("A", &SilentProgress).await.unwrap();

        assert_eq!(concepts(&outcome.tree), ["A", "B", "C"]);
        let c = &outcome.tree.prerequisites[0].prerequisites[0];
        assert_eq!(c.depth, 2);
        assert!(c.is_foundation);
        // C is never classified: the bound is checked first.
        assert_eq!(service.calls_about(CompletionTask::Classify, "C"), 0);
        outcome.tree.check_invariants(2).unwrap();
    }

    #[tokio::test]
    async fn cycles_are_truncated_with_diagnostic() {
        let service = Arc::new(
            ScriptedCompletion::new()
                .prerequisites("Chicken", &["Egg"])
                .prerequisites("Egg", &["Chicken", "Shell"]),
        );
        let explorer = explorer_with(service, 5);
        let outcome = explorer.explore("Chicken", &SilentProgress).await.unwrap();

        let egg = &outcome.tree.prerequisites[0];
        let looped = &egg.prerequisites[0];
        assert_eq!(looped.concept, "Chicken");
        assert!(looped.is_foundation);
        assert_eq!(looped.diagnostics[0].kind, DiagnosticKind::CycleTruncated);
        assert_eq!(egg.prerequisites[1].concept, "Shell");
        assert_eq!(outcome.stats.cycles_truncated, 1);
        outcome.tree.check_invariants(5).unwrap();
    }

    #[tokio::test]
    async fn transient_discovery_failure_is_retried_to_identical_tree() {
        let build = || {
            ScriptedCompletion::new()
                .prerequisites("Calculus", &["Limits", "Functions"])
                .prerequisites("Limits", &["Sequences"])
        };

        let clean = explorer_with(Arc::new(build()), 4)
            .explore("Calculus", &SilentProgress)
            .await
            .unwrap();

        let flaky_service = Arc::new(build().fail_times(CompletionTask::Discover, "Calculus", 1));
        let flaky = explorer_with(flaky_service.clone(), 4)
            .explore("Calculus", &SilentProgress)
            .await
            .unwrap();

        assert_eq!(clean.tree, flaky.tree);
        assert_eq!(flaky.stats.retries, 1);
        assert_eq!(flaky_service.calls_about(CompletionTask::Discover, "Calculus"), 2);
    }

    #[tokio::test]
    async fn root_failure_is_fatal() {
        let service = Arc::new(ScriptedCompletion::new().fail_task(CompletionTask::Classify));
        let err = explorer_with(service.clone(), 3)
            .explore("Entropy", &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.is_transport());
        // One attempt plus one retry.
        assert_eq!(service.calls_for(CompletionTask::Classify), 2);
    }

    #[tokio::test]
    async fn non_root_failure_degrades() {
        let service = Arc::new(
            ScriptedCompletion::new()
                .prerequisites("Thermodynamics", &["Entropy", "Energy"])
                .prerequisites("Entropy", &["Probability"])
                .respond(CompletionTask::Discover, "Entropy", "no idea"),
        );
        let outcome = explorer_with(service, 3)
            .explore("Thermodynamics", &SilentProgress)
            .await
            .unwrap();

        let entropy = &outcome.tree.prerequisites[0];
        assert!(entropy.is_foundation);
        assert_eq!(entropy.diagnostics[0].kind, DiagnosticKind::DiscoveryFailed);
        assert_eq!(outcome.stats.degraded, 1);
        assert_eq!(outcome.tree.prerequisites[1].concept, "Energy");
    }

    #[tokio::test]
    async fn repeated_concept_uses_cache() {
        let service = Arc::new(
            ScriptedCompletion::new()
                .prerequisites("Physics", &["Mechanics", "Optics"])
                .prerequisites("Mechanics", &["Calculus"])
                .prerequisites("Optics", &["Calculus"])
                .prerequisites("Calculus", &["Algebra"]),
        );
        let outcome = explorer_with(service.clone(), 4)
            .explore("Physics", &SilentProgress)
            .await
            .unwrap();

        // Duplicated as separate subtrees, but discovered only once.
        assert_eq!(outcome.tree.prerequisites[0].prerequisites[0].concept, "Calculus");
        assert_eq!(outcome.tree.prerequisites[1].prerequisites[0].concept, "Calculus");
        assert_eq!(service.calls_about(CompletionTask::Discover, "Calculus"), 1);
        assert_eq!(service.calls_about(CompletionTask::Classify, "Calculus"), 1);
        assert!(outcome.stats.cache.hits >= 2);
    }

    #[tokio::test]
    async fn cancellation_aborts_run() {
        let service = Arc::new(
            ScriptedCompletion::new()
                .prerequisites("Topology", &["Sets"])
                .delay(Duration::from_millis(200)),
        );
        let cancel = CancellationToken::new();
        let guarded = Arc::new(GuardedCompletion::new(
            service,
            2,
            Duration::from_secs(5),
            cancel.clone(),
        ));
        let explorer = TreeExplorer::new(
            guarded,
            Arc::new(ConceptCache::new()),
            ExploreConfig::default(),
            cancel.clone(),
        );

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = explorer.explore("Topology", &SilentProgress).await.unwrap_err();
        canceller.await.unwrap();
        assert!(err.is_cancelled());
    }

    mod properties {
        use super::*;
        use crate::tree::KnowledgeTree;
        use proptest::prelude::*;
        use std::collections::{HashMap, HashSet};

        const CONCEPTS: usize = 7;

        fn name(i: usize) -> String {
            format!("Concept {i}")
        }

        fn scripted(graph: &[Vec<usize>]) -> ScriptedCompletion {
            graph
                .iter()
                .enumerate()
                .filter(|(_, targets)| !targets.is_empty())
                .fold(ScriptedCompletion::new(), |service, (i, targets)| {
                    let names: Vec<String> = targets.iter().map(|&t| name(t)).collect();
                    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                    service.prerequisites(&name(i), &refs)
                })
        }

        fn explore(graph: &[Vec<usize>], max_depth: u32) -> ExploreOutcome {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let explorer = explorer_with(Arc::new(scripted(graph)), max_depth);
            runtime
                .block_on(explorer.explore(&name(0), &SilentProgress))
                .unwrap()
        }

        /// Random prerequisite lists without self references; cycles allowed.
        fn any_graph() -> impl Strategy<Value = Vec<Vec<usize>>> {
            proptest::collection::vec(
                proptest::collection::btree_set(0..CONCEPTS, 0..4)
                    .prop_map(|set| set.into_iter().collect::<Vec<_>>()),
                CONCEPTS,
            )
            .prop_map(|graph| {
                graph
                    .into_iter()
                    .enumerate()
                    .map(|(i, targets)| targets.into_iter().filter(|&t| t != i).collect())
                    .collect()
            })
        }

        /// Edges only point to higher indices, so the graph has no cycles.
        fn acyclic_graph() -> impl Strategy<Value = Vec<Vec<usize>>> {
            any_graph().prop_map(|graph| {
                graph
                    .into_iter()
                    .enumerate()
                    .map(|(i, targets)| targets.into_iter().filter(|&t| t > i).collect())
                    .collect()
            })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn explored_trees_satisfy_invariants(graph in any_graph(), max_depth in 1u32..5) {
                let outcome = explore(&graph, max_depth);
                prop_assert!(outcome.tree.check_invariants(max_depth).is_ok());
                prop_assert!(outcome.tree.max_depth() <= max_depth);
                prop_assert_eq!(outcome.stats.nodes, outcome.tree.node_count());
            }

            #[test]
            fn concept_order_lists_prerequisites_first(graph in acyclic_graph(), max_depth in 1u32..5) {
                let outcome = explore(&graph, max_depth);
                let tree = KnowledgeTree::from_root(outcome.tree);
                let order = tree.concepts(&tree.concept_order());

                let distinct: HashSet<String> =
                    tree.ids().map(|id| tree.node(id).data.concept.clone()).collect();
                prop_assert_eq!(order.len(), distinct.len());
                let root = name(0);
                prop_assert_eq!(order.last(), Some(&root));

                let position: HashMap<&String, usize> =
                    order.iter().enumerate().map(|(i, c)| (c, i)).collect();
                for id in tree.ids() {
                    let node = tree.node(id);
                    for &child in &node.children {
                        let child_concept = &tree.node(child).data.concept;
                        prop_assert!(position[child_concept] < position[&node.data.concept]);
                    }
                }
            }
        }
    }
}
