//! Prerequisite discoverer: the concepts one must know before a given concept.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use knowtree_completion::extract::first_string_array;
use knowtree_completion::{CompletionRequest, CompletionService, CompletionTask};
use knowtree_shared::{KnowTreeError, MAX_PREREQUISITES, Result, normalize_concept};

const SYSTEM_PROMPT: &str = "You are an expert educator who builds learning paths. \
You answer with a JSON array of strings and nothing else.";

pub struct PrerequisiteDiscoverer {
    service: Arc<dyn CompletionService>,
    max: usize,
}

impl PrerequisiteDiscoverer {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self {
            service,
            max: MAX_PREREQUISITES,
        }
    }

    /// Keep at most `max` prerequisites per concept (at least one).
    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max.max(1);
        self
    }

    /// Ordered, de-duplicated prerequisites, most fundamental first.
    ///
    /// Fails with [`KnowTreeError::PrerequisiteParse`] when the reply holds no
    /// array of strings or nothing usable remains after cleanup.
    #[instrument(skip_all, fields(concept = %concept))]
    pub async fn discover(&self, concept: &str) -> Result<Vec<String>> {
        let request =
            CompletionRequest::new(CompletionTask::Discover, SYSTEM_PROMPT, prompt(concept, self.max))
                .subject(concept)
                .max_tokens(500)
                .temperature(0.2);

        let raw = self.service.complete(&request).await?;
        let parse_error = || KnowTreeError::PrerequisiteParse {
            concept: concept.to_string(),
            raw: raw.clone(),
        };

        let listed = first_string_array(&raw).ok_or_else(parse_error)?;
        let prerequisites = clean_prerequisites(concept, listed, self.max);
        if prerequisites.is_empty() {
            return Err(parse_error());
        }

        debug!(count = prerequisites.len(), ?prerequisites, "prerequisites discovered");
        Ok(prerequisites)
    }
}

/// Trim entries, drop blanks and self-references, de-duplicate by normalized
/// name (first spelling wins), then truncate to `max`.
pub(crate) fn clean_prerequisites(concept: &str, listed: Vec<String>, max: usize) -> Vec<String> {
    let own_key = normalize_concept(concept);
    let mut seen = HashSet::new();

    listed
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .filter(|p| {
            let key = normalize_concept(p);
            key != own_key && seen.insert(key)
        })
        .take(max)
        .collect()
}

fn prompt(concept: &str, max: usize) -> String {
    format!(
        "To understand \"{concept}\", what concepts must someone know first?\n\n\
List between 1 and {max} prerequisite concepts, the most important first. \
Each should be a concept name, not a sentence. \
Do not include \"{concept}\" itself.\n\n\
Answer with ONLY a JSON array, for example:\n\
[\"Concept 1\", \"Concept 2\", \"Concept 3\"]"
    )
}
