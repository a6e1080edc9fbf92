//! Shared types, error model, and configuration for KnowTree.
//!
//! This crate is the foundation depended on by all other KnowTree crates.
//! It provides:
//! - [`KnowTreeError`] — the unified error type
//! - Domain types ([`KnowledgeNode`], [`Diagnostic`], [`RunManifest`], [`RunId`])
//! - Configuration ([`AppConfig`], [`ExploreConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheConfig, CompletionConfig, DefaultsConfig, ExploreConfig, MAX_PREREQUISITES,
    config_dir, config_file_path, expand_tilde, init_config, load_config, load_config_from,
    validate_api_key,
};
pub use error::{KnowTreeError, Result};
pub use types::{
    CURRENT_SCHEMA_VERSION, Diagnostic, DiagnosticKind, KnowledgeNode, RunId, RunManifest,
    VisualSpec, normalize_concept,
};
