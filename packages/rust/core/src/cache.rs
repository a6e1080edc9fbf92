//! Run-scoped concept cache with an optional persistent second level.
//!
//! Keys are `(kind, normalized concept)`. Each key owns a single-flight cell,
//! so concurrent lookups of the same concept share one outbound call. A failed
//! computation leaves the cell empty and the next caller tries again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use knowtree_shared::{KnowTreeError, Result, normalize_concept};
use knowtree_storage::Storage;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Foundation,
    Prerequisites,
}

impl CacheKind {
    /// Storage key for the persistent cache.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foundation => "foundation",
            Self::Prerequisites => "prerequisites",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CachedResult {
    Foundation(bool),
    Prerequisites(Vec<String>),
}

impl CachedResult {
    pub fn kind(&self) -> CacheKind {
        match self {
            Self::Foundation(_) => CacheKind::Foundation,
            Self::Prerequisites(_) => CacheKind::Prerequisites,
        }
    }

    pub fn into_foundation(self) -> Result<bool> {
        match self {
            Self::Foundation(v) => Ok(v),
            other => Err(kind_mismatch(CacheKind::Foundation, &other)),
        }
    }

    pub fn into_prerequisites(self) -> Result<Vec<String>> {
        match self {
            Self::Prerequisites(v) => Ok(v),
            other => Err(kind_mismatch(CacheKind::Prerequisites, &other)),
        }
    }
}

fn kind_mismatch(expected: CacheKind, got: &CachedResult) -> KnowTreeError {
    KnowTreeError::validation(format!(
        "cache entry is {}, expected {}",
        got.kind().as_str(),
        expected.as_str()
    ))
}

/// Hit/miss counters. A hit is any lookup answered without an outbound call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    /// Hits served by the persistent store.
    pub persistent_hits: usize,
}

struct PersistentLayer {
    storage: Arc<Storage>,
    model_id: String,
}

// ---------------------------------------------------------------------------
// ConceptCache
// ---------------------------------------------------------------------------

type Cell = Arc<OnceCell<CachedResult>>;

#[derive(Default)]
pub struct ConceptCache {
    cells: Mutex<HashMap<(CacheKind, String), Cell>>,
    persistent: Option<PersistentLayer>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    persistent_hits: AtomicUsize,
}

impl ConceptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back the cache with a persistent store scoped to `model_id`.
    pub fn with_storage(storage: Arc<Storage>, model_id: impl Into<String>) -> Self {
        Self {
            persistent: Some(PersistentLayer {
                storage,
                model_id: model_id.into(),
            }),
            ..Self::default()
        }
    }

    fn cell(&self, kind: CacheKind, concept: &str) -> Cell {
        let key = (kind, normalize_concept(concept));
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.entry(key).or_default().clone()
    }

    /// In-memory lookup only.
    pub fn get(&self, kind: CacheKind, concept: &str) -> Option<CachedResult> {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells
            .get(&(kind, normalize_concept(concept)))
            .and_then(|cell| cell.get().cloned())
    }

    /// Store a result unless one is already present. Returns whether it was stored.
    pub fn put(&self, kind: CacheKind, concept: &str, result: CachedResult) -> bool {
        self.cell(kind, concept).set(result).is_ok()
    }

    /// Return the cached result, or compute it with `compute` exactly once.
    ///
    /// Concurrent callers for the same key wait on the first caller's
    /// computation. Errors are returned to the caller that ran `compute` and
    /// are not cached.
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        kind: CacheKind,
        concept: &str,
        compute: F,
    ) -> Result<CachedResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResult>>,
    {
        let cell = self.cell(kind, concept);
        if let Some(hit) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.clone());
        }

        let initialized_here = AtomicBool::new(false);
        let result = cell
            .get_or_try_init(|| async {
                initialized_here.store(true, Ordering::Relaxed);
                if let Some(stored) = self.load_persistent(kind, concept).await {
                    self.persistent_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(stored);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                let computed = compute().await?;
                self.store_persistent(kind, concept, &computed).await;
                Ok::<_, KnowTreeError>(computed)
            })
            .await?
            .clone();

        if !initialized_here.load(Ordering::Relaxed) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result)
    }

    pub fn stats(&self) -> CacheStats {
        let persistent_hits = self.persistent_hits.load(Ordering::Relaxed);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed) + persistent_hits,
            misses: self.misses.load(Ordering::Relaxed),
            persistent_hits,
        }
    }

    async fn load_persistent(&self, kind: CacheKind, concept: &str) -> Option<CachedResult> {
        let layer = self.persistent.as_ref()?;
        let key = normalize_concept(concept);
        match layer
            .storage
            .get_concept(kind.as_str(), &key, &layer.model_id)
            .await
        {
            Ok(Some(json)) => match serde_json::from_str::<CachedResult>(&json) {
                Ok(result) if result.kind() == kind => {
                    debug!(concept = %key, kind = kind.as_str(), "persistent cache hit");
                    Some(result)
                }
                _ => {
                    warn!(concept = %key, "ignoring malformed persistent cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "persistent cache read failed");
                None
            }
        }
    }

    async fn store_persistent(&self, kind: CacheKind, concept: &str, result: &CachedResult) {
        let Some(layer) = self.persistent.as_ref() else {
            return;
        };
        let key = normalize_concept(concept);
        let json = match serde_json::to_string(result) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "could not serialize cache entry");
                return;
            }
        };
        if let Err(e) = layer
            .storage
            .put_concept(kind.as_str(), &key, &layer.model_id, &json)
            .await
        {
            warn!(error = %e, "persistent cache write failed");
        }
    }
}
