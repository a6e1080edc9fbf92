//! End-to-end `explain` pipeline: request → analysis → exploration →
//! enrichment → script generation → run directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use knowtree_completion::CompletionService;
use knowtree_shared::{ExploreConfig, KnowTreeError, KnowledgeNode, Result, RunId};
use knowtree_storage::Storage;

use crate::analyzer::{ConceptAnalysis, ConceptAnalyzer};
use crate::assembler::{AssembleConfig, RunOutput, assemble_run};
use crate::cache::ConceptCache;
use crate::codegen::{
    CodeGenerator, CodegenInput, GeneratedArtifact, ManimCodeGenerator, ThreeJsCodeGenerator,
};
use crate::enrichment::{EnrichmentChain, EnrichmentReport, Narrative};
use crate::explorer::{ExploreOutcome, ExploreStats, TreeExplorer};
use crate::guard::GuardedCompletion;
use crate::tree::KnowledgeTree;

/// Configuration for [`run_pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Free-form user request.
    pub request: String,
    pub explore: ExploreConfig,
    /// Ask the model for the core concept instead of using the request as is.
    pub analyze: bool,
    /// Generate a Manim script from the narrative.
    pub codegen: bool,
    /// Generate an interactive Three.js page and module from the narrative.
    pub threejs: bool,
    /// Parent directory for the run directory; nothing is written when `None`.
    pub output_root: Option<PathBuf>,
    /// Tool version string.
    pub tool_version: String,
}

/// Counters for one run, stored in the manifest and the run history.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Outbound completion calls.
    pub calls: usize,
    pub failed_calls: usize,
    pub explore: ExploreStats,
    pub enrichment: EnrichmentReport,
    /// One entry per generator that failed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub codegen_errors: Vec<String>,
}

/// Result of [`run_pipeline`].
#[derive(Debug)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub request: String,
    pub target_concept: String,
    pub analysis: ConceptAnalysis,
    /// The enriched tree.
    pub tree: KnowledgeNode,
    /// `None` when the narrative stage was unavailable.
    pub narrative: Option<Narrative>,
    /// Concepts in teaching order, foundations first.
    pub concept_order: Vec<String>,
    /// Generated files, in generator order.
    pub artifacts: Vec<GeneratedArtifact>,
    pub stats: PipelineStats,
    /// Run directory, when one was written.
    pub output_path: Option<PathBuf>,
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once per node as the tree is built.
    fn node_explored(&self, concept: &str, depth: u32, is_foundation: bool);
    /// Called as enrichment calls finish.
    fn stage_progress(&self, stage: &str, current: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, result: &PipelineResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn node_explored(&self, _concept: &str, _depth: u32, _is_foundation: bool) {}
    fn stage_progress(&self, _stage: &str, _current: usize, _total: usize) {}
    fn done(&self, _result: &PipelineResult) {}
}

/// Run the full pipeline.
///
/// 1. Analysis: pick the root concept (optional)
/// 2. Explore the prerequisite tree
/// 3. Enrich: math, visuals, narrative
/// 4. Generate the animation script (optional)
/// 5. Write the run directory (optional)
///
/// Only a failure at the root of the tree, or cancellation, fails the run.
/// When `store` is given it backs the concept cache and records the run.
#[instrument(skip_all, fields(request = %config.request))]
pub async fn run_pipeline(
    config: &PipelineConfig,
    service: Arc<dyn CompletionService>,
    store: Option<Arc<Storage>>,
    progress: &dyn ProgressReporter,
    cancel: CancellationToken,
) -> Result<PipelineResult> {
    let start = Instant::now();
    let run_id = RunId::new();
    let model = service.model().to_string();
    info!(%run_id, %model, "starting explain pipeline");

    let guarded = Arc::new(GuardedCompletion::new(
        service,
        config.explore.fan_out,
        config.explore.call_timeout,
        cancel.clone(),
    ));
    let shared: Arc<dyn CompletionService> = guarded.clone();

    // --- Phase 1: Analysis ---
    let analysis = if config.analyze {
        progress.phase("Analyzing request");
        match ConceptAnalyzer::new(shared.clone())
            .analyze(&config.request)
            .await
        {
            Ok(analysis) => analysis,
            Err(KnowTreeError::Cancelled) => return Err(KnowTreeError::Cancelled),
            Err(e) => {
                warn!(error = %e, "analysis failed, using request as the concept");
                ConceptAnalysis::verbatim(&config.request)
            }
        }
    } else {
        ConceptAnalysis::verbatim(&config.request)
    };
    let target = analysis.core_concept.clone();

    if let Some(store) = &store {
        if let Err(e) = store
            .insert_run(&run_id.to_string(), &config.request, &target, &model)
            .await
        {
            warn!(error = %e, "could not record run start");
        }
    }

    let cache = Arc::new(match &store {
        Some(store) => ConceptCache::with_storage(store.clone(), model.clone()),
        None => ConceptCache::new(),
    });

    let outcome = RunContext {
        config,
        run_id: &run_id,
        model: &model,
        target: &target,
        service: shared,
        guarded: &guarded,
        cache,
        progress,
        cancel,
    }
    .execute()
    .await;

    if let Some(store) = &store {
        let (stats_json, output_path) = match &outcome {
            Ok(run) => (
                serde_json::to_string(&run.stats).unwrap_or_default(),
                run.output_path.as_ref().map(|p| p.display().to_string()),
            ),
            Err(e) => (
                serde_json::json!({ "error": e.to_string() }).to_string(),
                None,
            ),
        };
        if let Err(e) = store
            .finish_run(&run_id.to_string(), &stats_json, output_path.as_deref())
            .await
        {
            warn!(error = %e, "could not record run result");
        }
    }

    let run = outcome?;
    let result = PipelineResult {
        run_id,
        request: config.request.clone(),
        target_concept: target,
        analysis,
        tree: run.tree,
        narrative: run.narrative,
        concept_order: run.concept_order,
        artifacts: run.artifacts,
        stats: run.stats,
        output_path: run.output_path,
        elapsed: start.elapsed(),
    };

    progress.done(&result);

    info!(
        run_id = %result.run_id,
        nodes = result.stats.explore.nodes,
        calls = result.stats.calls,
        elapsed_ms = result.elapsed.as_millis(),
        "explain pipeline complete"
    );

    Ok(result)
}

/// Build the prerequisite tree for `concept` without enriching it.
#[instrument(skip_all, fields(concept = %concept))]
pub async fn explore_only(
    concept: &str,
    explore: &ExploreConfig,
    service: Arc<dyn CompletionService>,
    store: Option<Arc<Storage>>,
    progress: &dyn ProgressReporter,
    cancel: CancellationToken,
) -> Result<ExploreOutcome> {
    let model = service.model().to_string();
    let guarded: Arc<dyn CompletionService> = Arc::new(GuardedCompletion::new(
        service,
        explore.fan_out,
        explore.call_timeout,
        cancel.clone(),
    ));
    let cache = Arc::new(match store {
        Some(store) => ConceptCache::with_storage(store, model),
        None => ConceptCache::new(),
    });

    progress.phase("Exploring prerequisites");
    TreeExplorer::new(guarded, cache, explore.clone(), cancel)
        .explore(concept, progress)
        .await
}

// ---------------------------------------------------------------------------
// Run phases
// ---------------------------------------------------------------------------

struct RunContext<'a> {
    config: &'a PipelineConfig,
    run_id: &'a RunId,
    model: &'a str,
    target: &'a str,
    service: Arc<dyn CompletionService>,
    guarded: &'a GuardedCompletion,
    cache: Arc<ConceptCache>,
    progress: &'a dyn ProgressReporter,
    cancel: CancellationToken,
}

struct RunParts {
    tree: KnowledgeNode,
    narrative: Option<Narrative>,
    concept_order: Vec<String>,
    artifacts: Vec<GeneratedArtifact>,
    stats: PipelineStats,
    output_path: Option<PathBuf>,
}

impl RunContext<'_> {
    async fn execute(&self) -> Result<RunParts> {
        // --- Phase 2: Explore ---
        self.progress.phase("Exploring prerequisites");
        let explored = TreeExplorer::new(
            self.service.clone(),
            self.cache.clone(),
            self.config.explore.clone(),
            self.cancel.clone(),
        )
        .explore(self.target, self.progress)
        .await?;

        // --- Phase 3: Enrich ---
        let enriched = EnrichmentChain::new(self.service.clone(), self.cancel.clone())
            .run(KnowledgeTree::from_root(explored.tree), self.progress)
            .await?;

        let concept_order = match &enriched.narrative {
            Some(narrative) => narrative.concept_order.clone(),
            None => enriched.tree.concepts(&enriched.tree.concept_order()),
        };
        let tree = enriched.tree.into_root();

        // --- Phase 4: Codegen ---
        let (artifacts, codegen_errors) = self
            .generate(enriched.narrative.as_ref(), &concept_order)
            .await?;

        let stats = PipelineStats {
            calls: self.guarded.calls(),
            failed_calls: self.guarded.failures(),
            explore: explored.stats,
            enrichment: enriched.report,
            codegen_errors,
        };

        // --- Phase 5: Persist ---
        let output_path = match &self.config.output_root {
            Some(output_root) => {
                self.progress.phase("Writing run directory");
                let stats_json = serde_json::to_value(&stats).ok();
                let assembled = assemble_run(
                    &AssembleConfig {
                        run_id: self.run_id.clone(),
                        request: self.config.request.clone(),
                        model: self.model.to_string(),
                        tool_version: self.config.tool_version.clone(),
                        max_depth: self.config.explore.max_depth,
                        output_root: output_root.clone(),
                    },
                    RunOutput {
                        tree: &tree,
                        concept_order: &concept_order,
                        narrative: enriched.narrative.as_ref().map(|n| n.text.as_str()),
                        artifacts: &artifacts,
                        stats: stats_json.as_ref(),
                    },
                )?;
                Some(assembled.run_path)
            }
            None => None,
        };

        Ok(RunParts {
            tree,
            narrative: enriched.narrative,
            concept_order,
            artifacts,
            stats,
            output_path,
        })
    }

    /// Runs every enabled generator. A failed generator contributes its
    /// error message instead of files.
    async fn generate(
        &self,
        narrative: Option<&Narrative>,
        concept_order: &[String],
    ) -> Result<(Vec<GeneratedArtifact>, Vec<String>)> {
        let mut generators: Vec<Box<dyn CodeGenerator>> = Vec::new();
        if self.config.codegen {
            generators.push(Box::new(ManimCodeGenerator::new(self.service.clone())));
        }
        if self.config.threejs {
            generators.push(Box::new(ThreeJsCodeGenerator::new(self.service.clone())));
        }
        if generators.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let Some(narrative) = narrative else {
            info!("no narrative composed, skipping code generation");
            return Ok((Vec::new(), Vec::new()));
        };

        let input = CodegenInput {
            target_concept: self.target,
            narrative: &narrative.text,
            concept_order,
        };
        let mut artifacts = Vec::new();
        let mut errors = Vec::new();
        for generator in &generators {
            self.progress
                .phase(&format!("Generating {} code", generator.name()));
            match generator.generate(input).await {
                Ok(files) => artifacts.extend(files),
                Err(KnowTreeError::Cancelled) => return Err(KnowTreeError::Cancelled),
                Err(e) => {
                    warn!(generator = generator.name(), error = %e, "code generation failed");
                    errors.push(format!("{}: {e}", generator.name()));
                }
            }
        }
        Ok((artifacts, errors))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
