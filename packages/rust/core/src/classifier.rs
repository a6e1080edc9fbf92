//! Foundation classifier: is a concept already known to a high-school graduate?

use std::sync::Arc;

use tracing::{debug, instrument};

use knowtree_completion::extract::parse_yes_no;
use knowtree_completion::{CompletionRequest, CompletionService, CompletionTask};
use knowtree_shared::{KnowTreeError, Result};

const SYSTEM_PROMPT: &str = "You are an expert educator who decides whether a concept needs \
further explanation. Reply with exactly one word: yes or no.";

pub struct FoundationClassifier {
    service: Arc<dyn CompletionService>,
}

impl FoundationClassifier {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }

    /// `true` when the concept needs no further breakdown.
    ///
    /// The reply must be a bare yes/no; anything else is
    /// [`KnowTreeError::ClassificationAmbiguous`].
    #[instrument(skip_all, fields(concept = %concept))]
    pub async fn classify(&self, concept: &str) -> Result<bool> {
        let request = CompletionRequest::new(CompletionTask::Classify, SYSTEM_PROMPT, prompt(concept))
            .subject(concept)
            .max_tokens(10)
            .temperature(0.0);

        let response = self.service.complete(&request).await?;
        let verdict =
            parse_yes_no(&response).ok_or_else(|| KnowTreeError::ClassificationAmbiguous {
                concept: concept.to_string(),
                response: response.clone(),
            })?;

        debug!(foundation = verdict, "classified");
        Ok(verdict)
    }
}

fn prompt(concept: &str) -> String {
    format!(
        "Is \"{concept}\" a foundational concept that a typical high school graduate \
already understands well enough that it needs no further breakdown?\n\n\
Foundational examples: velocity, distance, time, basic arithmetic, fractions, \
simple algebra, coordinate axes.\n\
Not foundational: quantum mechanics, eigenvalues, Fourier transforms, \
differential equations.\n\n\
Answer with ONLY yes or no."
    )
}
