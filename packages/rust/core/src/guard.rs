//! Bounded, cancellable access to a completion service.
//!
//! Every outbound call in a run goes through one [`GuardedCompletion`]:
//! it holds a semaphore permit for the duration of the call (the fan-out
//! limit), applies the per-call timeout, and gives up as soon as the run's
//! [`CancellationToken`] fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use knowtree_completion::{CompletionRequest, CompletionService};
use knowtree_shared::{KnowTreeError, Result};

pub struct GuardedCompletion {
    inner: Arc<dyn CompletionService>,
    permits: Semaphore,
    timeout: Duration,
    cancel: CancellationToken,
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl GuardedCompletion {
    pub fn new(
        inner: Arc<dyn CompletionService>,
        fan_out: usize,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            permits: Semaphore::new(fan_out.max(1)),
            timeout,
            cancel,
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Outbound calls started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Calls that ended in an error other than cancellation.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CompletionService for GuardedCompletion {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(KnowTreeError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| KnowTreeError::Cancelled)?,
        };

        self.calls.fetch_add(1, Ordering::Relaxed);
        debug!(task = %request.task, "outbound call");

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(KnowTreeError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.inner.complete(request)) => {
                result.unwrap_or_else(|_| Err(KnowTreeError::timeout(self.timeout)))
            }
        };

        if matches!(&outcome, Err(e) if !e.is_cancelled()) {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }
}
