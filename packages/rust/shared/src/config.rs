//! Application configuration for KnowTree.
//!
//! User config lives at `~/.knowtree/knowtree.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KnowTreeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "knowtree.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".knowtree";

/// Default persistent concept cache file name.
const CACHE_FILE_NAME: &str = "cache.db";

/// Upper bound on prerequisites kept per concept.
pub const MAX_PREREQUISITES: usize = 5;

// ---------------------------------------------------------------------------
// Config structs (matching knowtree.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Completion service settings.
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Persistent concept cache.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Where run directories are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Maximum depth of the knowledge tree (root is depth 0).
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Maximum number of completion calls in flight.
    #[serde(default = "default_fan_out")]
    pub fan_out: u32,

    /// Generate an animation script after the narrative.
    #[serde(default = "default_true")]
    pub codegen: bool,

    /// Extract the core concept from the request before exploring.
    #[serde(default = "default_true")]
    pub analyze: bool,

    /// Also generate an interactive Three.js page and module.
    #[serde(default)]
    pub threejs: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            max_depth: default_max_depth(),
            fan_out: default_fan_out(),
            codegen: true,
            analyze: true,
            threejs: false,
        }
    }
}

fn default_output_dir() -> String {
    "~/knowtree-runs".into()
}
fn default_max_depth() -> u32 {
    4
}
fn default_fan_out() -> u32 {
    4
}
fn default_true() -> bool {
    true
}

/// `[completion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of an OpenAI-compatible chat completions API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Token cap for a single completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4.5".into()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_tokens() -> u32 {
    2000
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Keep classifier/discoverer results across runs.
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// Database path; defaults to `~/.knowtree/cache.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            path: None,
        }
    }
}

impl CacheConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(p) => Ok(expand_tilde(p)),
            None => Ok(config_dir()?.join(CACHE_FILE_NAME)),
        }
    }
}

// ---------------------------------------------------------------------------
// Explore config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime exploration settings, merged from the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct ExploreConfig {
    /// Deepest allowed node depth; nodes at this depth are foundations.
    pub max_depth: u32,
    /// Maximum outbound completion calls in flight.
    pub fan_out: usize,
    /// Per-call timeout.
    pub call_timeout: Duration,
    /// Extra attempts after a failed classifier/discoverer call.
    pub retries: u32,
    /// Prerequisites kept per concept.
    pub max_prerequisites: usize,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ExploreConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_depth: config.defaults.max_depth,
            fan_out: config.defaults.fan_out.max(1) as usize,
            call_timeout: Duration::from_secs(config.completion.timeout_secs.max(1)),
            retries: 1,
            max_prerequisites: MAX_PREREQUISITES,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.knowtree/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| KnowTreeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.knowtree/knowtree.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| KnowTreeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| KnowTreeError::config(format!("failed to parse {}: {e}", path.display())))?;

    if config.defaults.max_depth == 0 {
        return Err(KnowTreeError::config("defaults.max_depth must be at least 1"));
    }
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| KnowTreeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| KnowTreeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| KnowTreeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the API key from the env var named in the config.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.completion.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(KnowTreeError::config(format!(
            "completion API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("max_depth = 4"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.max_depth, 4);
        assert_eq!(parsed.completion.api_key_env, "OPENROUTER_API_KEY");
        assert!(parsed.cache.persistent);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
max_depth = 2

[completion]
model = "openai/gpt-4o-mini"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.max_depth, 2);
        assert_eq!(config.defaults.fan_out, 4);
        assert!(config.defaults.codegen);
        assert!(!config.defaults.threejs);
        assert_eq!(config.completion.model, "openai/gpt-4o-mini");
        assert_eq!(config.completion.timeout_secs, 120);
    }

    #[test]
    fn zero_depth_is_rejected() {
        let path = std::env::temp_dir().join(format!("kt_cfg_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, "[defaults]\nmax_depth = 0\n").expect("write");
        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("max_depth"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn explore_config_from_app_config() {
        let mut app = AppConfig::default();
        app.defaults.fan_out = 0;
        let explore = ExploreConfig::from(&app);
        assert_eq!(explore.max_depth, 4);
        assert_eq!(explore.fan_out, 1);
        assert_eq!(explore.retries, 1);
        assert_eq!(explore.call_timeout, Duration::from_secs(120));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.completion.api_key_env = "KT_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }

    #[test]
    fn explicit_cache_path_wins() {
        let cache = CacheConfig {
            persistent: true,
            path: Some("/tmp/kt-cache.db".into()),
        };
        assert_eq!(cache.resolve_path().unwrap(), PathBuf::from("/tmp/kt-cache.db"));
    }
}
