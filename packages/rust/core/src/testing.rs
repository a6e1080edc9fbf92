//! Scripted completion service for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use knowtree_completion::{CompletionRequest, CompletionService, CompletionTask};
use knowtree_shared::{KnowTreeError, Result, normalize_concept};

type Key = (CompletionTask, String);

/// Answers every task with plausible canned output.
///
/// A concept is classified as a foundation unless prerequisites were
/// registered for it with [`ScriptedCompletion::prerequisites`].
pub(crate) struct ScriptedCompletion {
    prerequisites: HashMap<String, Vec<String>>,
    foundations: HashSet<String>,
    responses: HashMap<Key, String>,
    transient_failures: Mutex<HashMap<Key, usize>>,
    failing_tasks: HashSet<CompletionTask>,
    delay: Option<Duration>,
    log: Mutex<Vec<(Key, String)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self {
            prerequisites: HashMap::new(),
            foundations: HashSet::new(),
            responses: HashMap::new(),
            transient_failures: Mutex::new(HashMap::new()),
            failing_tasks: HashSet::new(),
            delay: None,
            log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn prerequisites(mut self, concept: &str, prereqs: &[&str]) -> Self {
        self.prerequisites.insert(
            normalize_concept(concept),
            prereqs.iter().map(|p| (*p).to_string()).collect(),
        );
        self
    }

    /// Force a yes verdict even if prerequisites are registered.
    pub fn foundations<const N: usize>(mut self, concepts: [&str; N]) -> Self {
        self.foundations
            .extend(concepts.iter().map(|c| normalize_concept(c)));
        self
    }

    /// Raw response text for one task/subject pair.
    pub fn respond(mut self, task: CompletionTask, subject: &str, text: &str) -> Self {
        self.responses
            .insert((task, normalize_concept(subject)), text.to_string());
        self
    }

    /// Fail the first `times` calls for this task/subject with a transport error.
    pub fn fail_times(self, task: CompletionTask, subject: &str, times: usize) -> Self {
        self.transient_failures
            .lock()
            .unwrap()
            .insert((task, normalize_concept(subject)), times);
        self
    }

    /// Every call for `task` fails with a transport error.
    pub fn fail_task(mut self, task: CompletionTask) -> Self {
        self.failing_tasks.insert(task);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn total_calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn calls_for(&self, task: CompletionTask) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|((t, _), _)| *t == task)
            .count()
    }

    pub fn calls_about(&self, task: CompletionTask, subject: &str) -> usize {
        let key = (task, normalize_concept(subject));
        self.log.lock().unwrap().iter().filter(|(k, _)| *k == key).count()
    }

    /// Normalized subjects of the calls for `task`, in call order.
    pub fn subjects_for(&self, task: CompletionTask) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|((t, _), _)| *t == task)
            .map(|((_, subject), _)| subject.clone())
            .collect()
    }

    /// User prompt of the most recent call for this task/subject pair.
    pub fn last_prompt(&self, task: CompletionTask, subject: &str) -> Option<String> {
        let key = (task, normalize_concept(subject));
        self.log
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, prompt)| prompt.clone())
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn answer(&self, task: CompletionTask, subject: &str, key: &str) -> String {
        match task {
            CompletionTask::Classify => {
                let foundation =
                    self.foundations.contains(key) || !self.prerequisites.contains_key(key);
                let verdict = if foundation { "yes" } else { "no" };
                verdict.to_string()
            }
            CompletionTask::Discover => {
                let list = self.prerequisites.get(key).cloned().unwrap_or_default();
                serde_json::to_string(&list).unwrap()
            }
            CompletionTask::Analyze => serde_json::json!({
                "core_concept": subject,
                "domain": "mathematics",
                "level": "undergraduate",
                "goal": format!("understand {subject}"),
            })
            .to_string(),
            CompletionTask::Math => serde_json::json!({
                "equations": [format!("{subject} = f(x)")],
                "definitions": {"x": "input quantity"},
                "interpretation": format!("how {subject} behaves"),
                "examples": ["x = 2"],
            })
            .to_string(),
            CompletionTask::Visual => serde_json::json!({
                "elements": [format!("{subject} diagram")],
                "colors": {"primary": "#58C4DD"},
                "animations": ["Write"],
                "duration": 10,
                "layout": "centered",
            })
            .to_string(),
            CompletionTask::Narrative => format!("Segment about {subject}."),
            CompletionTask::ThreeJsPage => format!(
                "```html\n<!DOCTYPE html>\n<html><head><title>{subject}</title></head>\n<body><script type=\"module\">import * as THREE from 'three';</script></body></html>\n```"
            ),
            CompletionTask::ThreeJsModule => {
                "```javascript\nimport * as THREE from 'three';\n\nexport class ConceptVisualization {\n  constructor(container) {}\n}\n```"
                    .to_string()
            }
            CompletionTask::Codegen => {
                "Here:\n```python\nfrom manim import *\n\nclass Explainer(Scene):\n    pass\n```"
                    .to_string()
            }
        }
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    fn model(&self) -> &str {
        "scripted/test"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let subject = request.subject.clone().unwrap_or_default();
        let key = normalize_concept(&subject);
        self.log
            .lock()
            .unwrap()
            .push(((request.task, key.clone()), request.user.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_tasks.contains(&request.task) {
            return Err(KnowTreeError::Transport("service unavailable".into()));
        }
        {
            let mut failures = self.transient_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&(request.task, key.clone())) {
                if *left > 0 {
                    *left -= 1;
                    return Err(KnowTreeError::Transport("connection reset".into()));
                }
            }
        }

        if let Some(text) = self.responses.get(&(request.task, key.clone())) {
            return Ok(text.clone());
        }
        Ok(self.answer(request.task, &subject, &key))
    }
}
