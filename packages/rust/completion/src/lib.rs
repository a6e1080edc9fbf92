//! Completion service boundary.
//!
//! Everything KnowTree asks of a generative model goes through the
//! [`CompletionService`] trait: a single "prompt in, text out" call. The
//! crate ships one HTTP implementation ([`OpenRouterClient`]) and the
//! tolerant extraction helpers used to pull structured data out of prose.

mod client;
pub mod extract;

use async_trait::async_trait;
use knowtree_shared::Result;

pub use client::OpenRouterClient;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Which pipeline step a completion call belongs to. Used for logging,
/// persistent cache keys, and by test doubles to route scripted answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionTask {
    Analyze,
    Classify,
    Discover,
    Math,
    Visual,
    Narrative,
    Codegen,
    /// Self-contained Three.js HTML page.
    ThreeJsPage,
    /// Reusable Three.js ES module.
    ThreeJsModule,
}

impl CompletionTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Classify => "classify",
            Self::Discover => "discover",
            Self::Math => "math",
            Self::Visual => "visual",
            Self::Narrative => "narrative",
            Self::Codegen => "codegen",
            Self::ThreeJsPage => "threejs_page",
            Self::ThreeJsModule => "threejs_module",
        }
    }
}

impl std::fmt::Display for CompletionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single prompt sent to the completion service.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub task: CompletionTask,
    /// The concept or request this call is about, for logs and cache keys.
    pub subject: Option<String>,
    /// System instruction.
    pub system: String,
    /// User message.
    pub user: String,
    /// Token cap for this call; `None` uses the service default.
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(task: CompletionTask, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            task,
            subject: None,
            system: system.into(),
            user: user.into(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

// ---------------------------------------------------------------------------
// Service trait
// ---------------------------------------------------------------------------

/// A generative text service.
///
/// Implementations map every transport-level problem (connection failure,
/// timeout, non-success status, malformed envelope) to
/// [`KnowTreeError::Transport`](knowtree_shared::KnowTreeError::Transport).
/// Interpreting the returned text is the caller's job.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Model identifier, used to scope persistent cache entries.
    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}
