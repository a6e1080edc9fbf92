//! libSQL storage layer (local file mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the persistent
//! concept cache (classifier verdicts and prerequisite lists that outlive a
//! single run) and the run history.
//!
//! **Access rules:**
//! - `knowtree explain` / `knowtree tree`: read-write via [`Storage::open`]
//! - inspection commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::Utc;
use knowtree_shared::{KnowTreeError, Result};
use libsql::{Connection, Database, params};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// One row of the `runs` table.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub request: String,
    pub target_concept: String,
    pub model_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub output_path: Option<String>,
    pub stats_json: Option<String>,
}

fn storage_err(e: libsql::Error) -> KnowTreeError {
    KnowTreeError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KnowTreeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(KnowTreeError::Storage(format!(
                "cache database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    KnowTreeError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(KnowTreeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Concept cache operations
    // -----------------------------------------------------------------------

    /// Get a cached classifier/discoverer result for a normalized concept.
    pub async fn get_concept(
        &self,
        kind: &str,
        concept_key: &str,
        model_id: &str,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT result_json FROM concept_cache
                 WHERE kind = ?1 AND concept_key = ?2 AND model_id = ?3",
                params![kind, concept_key, model_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Store a classifier/discoverer result (upserts).
    pub async fn put_concept(
        &self,
        kind: &str,
        concept_key: &str,
        model_id: &str,
        result_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO concept_cache (kind, concept_key, model_id, result_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(kind, concept_key, model_id) DO UPDATE SET
                   result_json = excluded.result_json,
                   created_at = excluded.created_at",
                params![kind, concept_key, model_id, result_json, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Number of cached entries per kind, as `(kind, count)` sorted by kind.
    pub async fn concept_counts(&self) -> Result<Vec<(String, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT kind, COUNT(*) FROM concept_cache GROUP BY kind ORDER BY kind",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push((
                row.get::<String>(0).map_err(storage_err)?,
                row.get::<i64>(1).map_err(storage_err)? as u64,
            ));
        }
        Ok(results)
    }

    /// Drop cached entries, optionally only those produced by `model_id`.
    /// Returns the number of rows removed.
    pub async fn clear_concepts(&self, model_id: Option<&str>) -> Result<u64> {
        self.check_writable()?;
        let removed = match model_id {
            Some(model) => self
                .conn
                .execute("DELETE FROM concept_cache WHERE model_id = ?1", params![model])
                .await,
            None => self.conn.execute("DELETE FROM concept_cache", params![]).await,
        }
        .map_err(storage_err)?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Record the start of a run.
    pub async fn insert_run(
        &self,
        id: &str,
        request: &str,
        target_concept: &str,
        model_id: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, request, target_concept, model_id, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, request, target_concept, model_id, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Mark a run finished with its stats and output location.
    pub async fn finish_run(
        &self,
        id: &str,
        stats_json: &str,
        output_path: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, stats_json = ?2, output_path = ?3 WHERE id = ?4",
                params![now.as_str(), stats_json, output_path, id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, request, target_concept, model_id, started_at, finished_at,
                        output_path, stats_json
                 FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1",
                params![i64::from(limit)],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(RunRecord {
                id: row.get(0).map_err(storage_err)?,
                request: row.get(1).map_err(storage_err)?,
                target_concept: row.get(2).map_err(storage_err)?,
                model_id: row.get(3).map_err(storage_err)?,
                started_at: row.get(4).map_err(storage_err)?,
                finished_at: row.get(5).map_err(storage_err)?,
                output_path: row.get(6).map_err(storage_err)?,
                stats_json: row.get(7).map_err(storage_err)?,
            });
        }
        Ok(results)
    }
}
