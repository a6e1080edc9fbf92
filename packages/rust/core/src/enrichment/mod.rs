//! Three-stage enrichment of an explored knowledge tree.
//!
//! Stages run in a fixed order, each reading what the previous one wrote:
//!
//! 1. [`MathEnricher`]: equations and definitions per concept
//! 2. [`VisualDesigner`]: visual specs, deepest level first
//! 3. [`NarrativeComposer`]: teaching-order narrative for the whole tree
//!
//! A stage whose every call failed to reach the completion service is
//! reported unavailable and leaves the tree untouched; the chain moves on.
//! Cancellation stops the chain.

pub mod math;
pub mod narrative;
pub mod visual;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use knowtree_completion::CompletionService;
use knowtree_shared::{Diagnostic, DiagnosticKind, KnowTreeError, Result};

use crate::pipeline::ProgressReporter;
use crate::tree::KnowledgeTree;

pub use math::{MathDetail, MathEnricher};
pub use narrative::{Narrative, NarrativeComposer};
pub use visual::{VisualDesign, VisualDesigner};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Math,
    Visual,
    Narrative,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Math => "math",
            Self::Visual => "visual",
            Self::Narrative => "narrative",
        }
    }

    /// Diagnostic attached to a node this stage could not annotate.
    pub(crate) fn missing(&self, error: &KnowTreeError) -> Diagnostic {
        Diagnostic::new(
            DiagnosticKind::EnrichmentMissing {
                stage: self.as_str().to_string(),
            },
            error.to_string(),
        )
    }
}

/// Outcome of one stage. `attempted` counts outbound calls, not nodes.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable: Option<String>,
}

impl StageReport {
    pub(crate) fn from_results<'a, T: 'a>(
        stage: Stage,
        results: impl IntoIterator<Item = &'a Result<T>>,
    ) -> Self {
        let mut report = Self {
            stage,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            unavailable: None,
        };
        for result in results {
            report.attempted += 1;
            if result.is_ok() {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    fn unavailable(stage: Stage, message: String) -> Self {
        Self {
            stage,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            unavailable: Some(message),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentReport {
    pub stages: Vec<StageReport>,
}

impl EnrichmentReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn is_available(&self, stage: Stage) -> bool {
        self.stage(stage).is_some_and(|r| r.unavailable.is_none())
    }

    /// Keep a finished stage's report, or record it as unavailable.
    /// Any other error is handed back to the caller.
    fn record(&mut self, stage: Stage, outcome: Result<StageReport>) -> Result<()> {
        match outcome {
            Ok(report) => {
                info!(
                    stage = stage.as_str(),
                    succeeded = report.succeeded,
                    failed = report.failed,
                    "stage complete"
                );
                self.stages.push(report);
                Ok(())
            }
            Err(KnowTreeError::StageUnavailable { message, .. }) => {
                warn!(stage = stage.as_str(), %message, "stage unavailable, continuing");
                self.stages.push(StageReport::unavailable(stage, message));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Decide whether a stage's results may be applied.
///
/// Fails with `Cancelled` if any call was cancelled and with
/// `StageUnavailable` when every call failed with a transport error.
pub(crate) fn check_availability<'a, T: 'a>(
    stage: Stage,
    results: impl IntoIterator<Item = &'a Result<T>>,
) -> Result<()> {
    let mut attempted = 0;
    let mut transport_failures = 0;
    let mut last_error = None;
    for result in results {
        attempted += 1;
        match result {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => return Err(KnowTreeError::Cancelled),
            Err(e) if e.is_transport() => {
                transport_failures += 1;
                last_error = Some(e.to_string());
            }
            Err(_) => {}
        }
    }

    if attempted > 0 && transport_failures == attempted {
        return Err(KnowTreeError::stage_unavailable(
            stage.as_str(),
            format!(
                "all {attempted} calls failed ({})",
                last_error.unwrap_or_default()
            ),
        ));
    }
    Ok(())
}

/// Progress counter shared by the concurrent calls of one stage.
pub(crate) struct StageProgress<'a> {
    stage: Stage,
    total: usize,
    done: AtomicUsize,
    reporter: &'a dyn ProgressReporter,
}

impl<'a> StageProgress<'a> {
    pub(crate) fn new(stage: Stage, total: usize, reporter: &'a dyn ProgressReporter) -> Self {
        reporter.stage_progress(stage.as_str(), 0, total);
        Self {
            stage,
            total,
            done: AtomicUsize::new(0),
            reporter,
        }
    }

    pub(crate) fn tick(&self) {
        let current = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        self.reporter
            .stage_progress(self.stage.as_str(), current, self.total);
    }
}

// ---------------------------------------------------------------------------
// EnrichmentChain
// ---------------------------------------------------------------------------

pub struct EnrichmentOutcome {
    pub tree: KnowledgeTree,
    /// `None` when the narrative stage was unavailable.
    pub narrative: Option<Narrative>,
    pub report: EnrichmentReport,
}

pub struct EnrichmentChain {
    math: MathEnricher,
    visual: VisualDesigner,
    narrative: NarrativeComposer,
    cancel: CancellationToken,
}

impl EnrichmentChain {
    pub fn new(service: Arc<dyn CompletionService>, cancel: CancellationToken) -> Self {
        Self {
            math: MathEnricher::new(service.clone()),
            visual: VisualDesigner::new(service.clone()),
            narrative: NarrativeComposer::new(service),
            cancel,
        }
    }

    /// Run all three stages over `tree`.
    #[instrument(skip_all, fields(nodes = tree.len()))]
    pub async fn run(
        &self,
        mut tree: KnowledgeTree,
        progress: &dyn ProgressReporter,
    ) -> Result<EnrichmentOutcome> {
        let mut report = EnrichmentReport::default();

        self.checkpoint()?;
        progress.phase("Adding mathematical detail");
        report.record(Stage::Math, self.math.enrich(&mut tree, progress).await)?;

        self.checkpoint()?;
        progress.phase("Designing visuals");
        report.record(Stage::Visual, self.visual.design(&mut tree, progress).await)?;

        self.checkpoint()?;
        progress.phase("Composing narrative");
        let narrative = match self.narrative.compose(&mut tree, progress).await {
            Ok((narrative, stage_report)) => {
                report.record(Stage::Narrative, Ok(stage_report))?;
                Some(narrative)
            }
            Err(e) => {
                report.record(Stage::Narrative, Err(e))?;
                None
            }
        };

        Ok(EnrichmentOutcome {
            tree,
            narrative,
            report,
        })
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(KnowTreeError::Cancelled);
        }
        Ok(())
    }
}
