//! Turns a free-form request into the concept the tree is built for.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use knowtree_completion::extract::first_json_object;
use knowtree_completion::{CompletionRequest, CompletionService, CompletionTask};
use knowtree_shared::{KnowTreeError, Result};

const SYSTEM_PROMPT: &str = "You analyze educational requests. Identify the main concept the \
user wants to understand (be specific), its scientific or mathematical domain, the appropriate \
level (beginner, intermediate or advanced) and the learning goal. Return ONLY a JSON object \
with the keys core_concept, domain, level, goal.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptAnalysis {
    pub core_concept: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
}

impl ConceptAnalysis {
    /// Analysis used when the request is taken verbatim as the concept.
    pub fn verbatim(request: &str) -> Self {
        Self {
            core_concept: request.trim().to_string(),
            domain: None,
            level: None,
            goal: None,
        }
    }
}

pub struct ConceptAnalyzer {
    service: Arc<dyn CompletionService>,
}

impl ConceptAnalyzer {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }

    #[instrument(skip_all, fields(request = %request))]
    pub async fn analyze(&self, request: &str) -> Result<ConceptAnalysis> {
        let user = format!(
            "User asked: \"{request}\"\n\n\
Return JSON, for example:\n\
{{\"core_concept\": \"quantum entanglement\", \"domain\": \"physics\", \
\"level\": \"intermediate\", \"goal\": \"understand how entangled particles stay correlated\"}}"
        );
        let completion = CompletionRequest::new(CompletionTask::Analyze, SYSTEM_PROMPT, user)
            .subject(request)
            .max_tokens(500)
            .temperature(0.3);

        let raw = self.service.complete(&completion).await?;
        let object = first_json_object(&raw)
            .ok_or_else(|| KnowTreeError::parse("no JSON object in analysis reply"))?;
        let mut analysis: ConceptAnalysis = serde_json::from_value(object.into())
            .map_err(|e| KnowTreeError::parse(format!("analysis reply: {e}")))?;

        analysis.core_concept = analysis.core_concept.trim().to_string();
        if analysis.core_concept.is_empty() {
            return Err(KnowTreeError::parse("analysis reply has an empty core_concept"));
        }
        debug!(concept = %analysis.core_concept, domain = ?analysis.domain, "request analyzed");
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCompletion;

    const REQUEST: &str = "Explain how cosmic inflation works";

    #[tokio::test]
    async fn extracts_core_concept() {
        let service = Arc::new(ScriptedCompletion::new().respond(
            CompletionTask::Analyze,
            REQUEST,
            r#"```json
{"core_concept": " Cosmic Inflation ", "domain": "cosmology", "level": "advanced", "goal": "see why the universe is flat"}
```"#,
        ));
        let analysis = ConceptAnalyzer::new(service).analyze(REQUEST).await.unwrap();
        assert_eq!(analysis.core_concept, "Cosmic Inflation");
        assert_eq!(analysis.domain.as_deref(), Some("cosmology"));
        assert_eq!(analysis.level.as_deref(), Some("advanced"));
    }

    #[tokio::test]
    async fn optional_fields_may_be_missing() {
        let service = Arc::new(ScriptedCompletion::new().respond(
            CompletionTask::Analyze,
            REQUEST,
            r#"{"core_concept": "Cosmic Inflation"}"#,
        ));
        let analysis = ConceptAnalyzer::new(service).analyze(REQUEST).await.unwrap();
        assert!(analysis.goal.is_none());
    }

    #[tokio::test]
    async fn missing_concept_is_a_parse_error() {
        let service = Arc::new(ScriptedCompletion::new().respond(
            CompletionTask::Analyze,
            REQUEST,
            r#"{"domain": "cosmology"}"#,
        ));
        let err = ConceptAnalyzer::new(service).analyze(REQUEST).await.unwrap_err();
        assert!(matches!(err, KnowTreeError::Parse { .. }));
    }

    #[test]
    fn verbatim_trims_request() {
        assert_eq!(ConceptAnalysis::verbatim("  entropy \n").core_concept, "entropy");
    }
}
