//! Run directory assembler.
//!
//! Takes the finished tree, narrative and generated script of one run and
//! writes them to disk next to a manifest carrying their checksums.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use knowtree_shared::{
    CURRENT_SCHEMA_VERSION, KnowTreeError, KnowledgeNode, Result, RunId, RunManifest,
};

use crate::codegen::GeneratedArtifact;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const TREE_FILE: &str = "tree.json";
pub const NARRATIVE_FILE: &str = "narrative.md";

const MAX_SLUG_LEN: usize = 48;

/// Output from a successful run assembly.
#[derive(Debug, Clone)]
pub struct AssembleResult {
    /// Path to the run directory.
    pub run_path: PathBuf,
    /// The manifest that was written.
    pub manifest: RunManifest,
}

/// Identity of the run being written.
#[derive(Debug, Clone)]
pub struct AssembleConfig {
    pub run_id: RunId,
    pub request: String,
    pub model: String,
    pub tool_version: String,
    pub max_depth: u32,
    /// Parent directory for run directories.
    pub output_root: PathBuf,
}

/// What a run produced.
#[derive(Debug, Clone, Copy)]
pub struct RunOutput<'a> {
    pub tree: &'a KnowledgeNode,
    pub concept_order: &'a [String],
    pub narrative: Option<&'a str>,
    pub artifacts: &'a [GeneratedArtifact],
    pub stats: Option<&'a serde_json::Value>,
}

/// Metadata for a single file in the run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub filename: String,
    pub sha256: String,
    pub size_bytes: usize,
}

/// Write a complete run directory.
///
/// ```text
/// <output_root>/<concept-slug>-<run_id>/
/// ├── manifest.json
/// ├── tree.json
/// ├── narrative.md     (when a narrative was composed)
/// └── animation.*      (one file per generated artifact)
/// ```
///
/// Every file is written to a temp name and renamed into place; the manifest
/// goes last, so a directory with a manifest is complete.
#[instrument(skip_all, fields(run_id = %config.run_id, concept = %output.tree.concept))]
pub fn assemble_run(config: &AssembleConfig, output: RunOutput<'_>) -> Result<AssembleResult> {
    let run_dir = config.output_root.join(format!(
        "{}-{}",
        slugify(&output.tree.concept),
        config.run_id
    ));
    info!(path = %run_dir.display(), "assembling run directory");
    std::fs::create_dir_all(&run_dir).map_err(|e| KnowTreeError::io(&run_dir, e))?;

    let mut files = Vec::new();
    files.push(write_atomic(&run_dir, TREE_FILE, &to_json(output.tree)?)?);
    if let Some(narrative) = output.narrative {
        files.push(write_atomic(&run_dir, NARRATIVE_FILE, narrative)?);
    }
    for artifact in output.artifacts {
        files.push(write_atomic(&run_dir, &artifact.file_name, &artifact.code)?);
    }

    let manifest = RunManifest {
        schema_version: CURRENT_SCHEMA_VERSION,
        id: config.run_id.clone(),
        request: config.request.clone(),
        target_concept: output.tree.concept.clone(),
        model: config.model.clone(),
        tool_version: config.tool_version.clone(),
        created_at: Utc::now(),
        max_depth: config.max_depth,
        node_count: output.tree.node_count(),
        concept_order: output.concept_order.to_vec(),
        artifacts: Some(serde_json::to_value(&files).map_err(|e| {
            KnowTreeError::validation(format!("artifact metadata serialization failed: {e}"))
        })?),
        stats: output.stats.cloned(),
    };
    write_atomic(&run_dir, MANIFEST_FILE, &to_json(&manifest)?)?;

    info!(files = files.len() + 1, path = %run_dir.display(), "run assembly complete");
    Ok(AssembleResult {
        run_path: run_dir,
        manifest,
    })
}

/// Read `manifest.json` from a run directory.
pub fn load_manifest(run_path: &Path) -> Result<RunManifest> {
    let path = run_path.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).map_err(|e| KnowTreeError::io(&path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| KnowTreeError::validation(format!("invalid {MANIFEST_FILE}: {e}")))
}

/// Read the persisted tree. Accepts a run directory or a tree file path.
pub fn load_tree(path: &Path) -> Result<KnowledgeNode> {
    let file = if path.is_dir() {
        path.join(TREE_FILE)
    } else {
        path.to_path_buf()
    };
    let content = std::fs::read_to_string(&file).map_err(|e| KnowTreeError::io(&file, e))?;
    serde_json::from_str(&content)
        .map_err(|e| KnowTreeError::validation(format!("invalid tree document {}: {e}", file.display())))
}

/// Verify that a run directory is complete and consistent: supported schema,
/// a tree satisfying its structural invariants, and files matching the
/// checksums in the manifest.
pub fn validate_run(run_path: &Path) -> Result<RunManifest> {
    let manifest = load_manifest(run_path)?;
    if manifest.schema_version != CURRENT_SCHEMA_VERSION {
        return Err(KnowTreeError::validation(format!(
            "unsupported schema_version: {} (expected {})",
            manifest.schema_version, CURRENT_SCHEMA_VERSION
        )));
    }

    let tree = load_tree(&run_path.join(TREE_FILE))?;
    tree.check_invariants(manifest.max_depth)?;
    if tree.node_count() != manifest.node_count {
        return Err(KnowTreeError::validation(format!(
            "tree has {} nodes, manifest says {}",
            tree.node_count(),
            manifest.node_count
        )));
    }

    let files: Vec<ArtifactMeta> = match &manifest.artifacts {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| KnowTreeError::validation(format!("invalid artifact list: {e}")))?,
        None => Vec::new(),
    };
    for meta in &files {
        let path = run_path.join(&meta.filename);
        let content = std::fs::read(&path).map_err(|e| KnowTreeError::io(&path, e))?;
        if sha256_hex(&content) != meta.sha256 {
            return Err(KnowTreeError::validation(format!(
                "checksum mismatch for {}",
                meta.filename
            )));
        }
    }
    debug!(path = %run_path.display(), files = files.len(), "run directory valid");
    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Directory-safe form of a concept name.
pub fn slugify(concept: &str) -> String {
    let mut slug = String::with_capacity(concept.len());
    for c in concept.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug: String = slug.chars().take(MAX_SLUG_LEN).collect();
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "run".to_string()
    } else {
        slug.to_string()
    }
}

fn to_json<T: Serialize>(data: &T) -> Result<String> {
    serde_json::to_string_pretty(data)
        .map_err(|e| KnowTreeError::validation(format!("JSON serialization failed: {e}")))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Write `content` to `dir/filename` via a temp file and rename.
fn write_atomic(dir: &Path, filename: &str, content: &str) -> Result<ArtifactMeta> {
    let target = dir.join(filename);
    let temp = dir.join(format!(".{filename}.tmp"));

    std::fs::write(&temp, content).map_err(|e| KnowTreeError::io(&temp, e))?;
    std::fs::rename(&temp, &target).map_err(|e| KnowTreeError::io(&target, e))?;

    debug!(file = %filename, size = content.len(), "wrote file");
    Ok(ArtifactMeta {
        filename: filename.to_string(),
        sha256: sha256_hex(content.as_bytes()),
        size_bytes: content.len(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use knowtree_shared::{Diagnostic, DiagnosticKind};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kt-assembler-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn make_config(output_root: &Path) -> AssembleConfig {
        AssembleConfig {
            run_id: RunId::new(),
            request: "Explain differential equations".into(),
            model: "test/model".into(),
            tool_version: "0.1.0-test".into(),
            max_depth: 3,
            output_root: output_root.into(),
        }
    }

    fn make_tree() -> KnowledgeNode {
        let mut root = KnowledgeNode::new("Differential Equations", 0);
        root.equations = Some(vec!["\\frac{dy}{dx} = ky".into()]);
        root.narrative = Some("# Explaining: Differential Equations".into());
        let mut calculus = KnowledgeNode::new("Calculus", 1);
        calculus.equations = Some(vec![]);
        calculus.prerequisites.push(
            KnowledgeNode::foundation("Basic Algebra", 2).with_diagnostic(Diagnostic::new(
                DiagnosticKind::EnrichmentMissing {
                    stage: "visual".into(),
                },
                "timed out",
            )),
        );
        root.prerequisites.push(calculus);
        root
    }

    fn make_artifacts() -> Vec<GeneratedArtifact> {
        vec![
            GeneratedArtifact {
                file_name: "animation.py".into(),
                language: "python".into(),
                code: "from manim import *\n".into(),
                entry_point: None,
            },
            GeneratedArtifact {
                file_name: "animation.html".into(),
                language: "html".into(),
                code: "<!DOCTYPE html>\n".into(),
                entry_point: None,
            },
        ]
    }

    fn order() -> Vec<String> {
        vec![
            "Basic Algebra".into(),
            "Calculus".into(),
            "Differential Equations".into(),
        ]
    }

    #[test]
    fn assemble_writes_all_files() {
        let tmp = temp_dir();
        let config = make_config(&tmp);
        let tree = make_tree();
        let order = order();
        let artifacts = make_artifacts();
        let stats = serde_json::json!({"calls": 9});

        let result = assemble_run(
            &config,
            RunOutput {
                tree: &tree,
                concept_order: &order,
                narrative: tree.narrative.as_deref(),
                artifacts: &artifacts,
                stats: Some(&stats),
            },
        )
        .unwrap();

        let dir = &result.run_path;
        assert!(
            dir.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("differential-equations-")
        );
        for file in [
            MANIFEST_FILE,
            TREE_FILE,
            NARRATIVE_FILE,
            "animation.py",
            "animation.html",
        ] {
            assert!(dir.join(file).exists(), "missing {file}");
        }
        // No temp files left behind.
        let leftovers = std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        assert_eq!(result.manifest.node_count, 3);
        assert_eq!(result.manifest.concept_order, order);
        assert_eq!(result.manifest.stats, Some(stats));

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn persisted_tree_roundtrips() {
        let tmp = temp_dir();
        let tree = make_tree();
        let result = assemble_run(
            &make_config(&tmp),
            RunOutput {
                tree: &tree,
                concept_order: &order(),
                narrative: None,
                artifacts: &[],
                stats: None,
            },
        )
        .unwrap();

        let loaded = load_tree(&result.run_path).unwrap();
        assert_eq!(loaded, tree);
        // Empty-versus-absent survives the trip.
        assert_eq!(loaded.prerequisites[0].equations, Some(vec![]));
        assert_eq!(loaded.prerequisites[0].prerequisites[0].equations, None);
        assert!(!result.run_path.join(NARRATIVE_FILE).exists());

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn validate_accepts_fresh_run() {
        let tmp = temp_dir();
        let tree = make_tree();
        let artifacts = make_artifacts();
        let result = assemble_run(
            &make_config(&tmp),
            RunOutput {
                tree: &tree,
                concept_order: &order(),
                narrative: Some("text"),
                artifacts: &artifacts,
                stats: None,
            },
        )
        .unwrap();

        let manifest = validate_run(&result.run_path).unwrap();
        assert_eq!(manifest.target_concept, "Differential Equations");

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn validate_detects_tampering() {
        let tmp = temp_dir();
        let tree = make_tree();
        let result = assemble_run(
            &make_config(&tmp),
            RunOutput {
                tree: &tree,
                concept_order: &order(),
                narrative: Some("original"),
                artifacts: &[],
                stats: None,
            },
        )
        .unwrap();

        std::fs::write(result.run_path.join(NARRATIVE_FILE), "edited").unwrap();
        let err = validate_run(&result.run_path).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn validate_missing_manifest() {
        let tmp = temp_dir();
        assert!(validate_run(&tmp).is_err());
        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn slugify_examples() {
        assert_eq!(slugify("Differential Equations"), "differential-equations");
        assert_eq!(slugify("  Newton's 2nd Law!! "), "newton-s-2nd-law");
        assert_eq!(slugify("∂/∂t"), "t");
        assert_eq!(slugify("???"), "run");
        assert!(slugify(&"x".repeat(100)).len() <= MAX_SLUG_LEN);
    }
}
