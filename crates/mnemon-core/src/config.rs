//! Configuration with per-project overrides and the on-disk layout.
//!
//! Config priority: project-relative (`.mnemon/config.toml`) > user
//! (`~/.config/mnemon/config.toml`) > built-in defaults. Every path is
//! additionally overridable through `MNEMON_*` environment variables so tests
//! and sandboxed installs never touch the real home directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dedup::fnv1a64;

// ============================================================================
// Embedding Configuration
// ============================================================================

/// Embedding provider kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama-compatible HTTP server
    #[default]
    Ollama,
    /// Remote OpenAI-compatible HTTP API
    OpenAi,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Preferred provider; the service falls back to the other when the
    /// preferred one fails its availability probe
    pub provider: ProviderKind,

    /// Local model name (e.g. "nomic-embed-text")
    pub model: String,

    /// Ollama server URL (only used when provider = ollama)
    pub ollama_url: String,

    /// Remote model name (e.g. "text-embedding-3-small")
    pub remote_model: String,

    /// Remote API base URL
    pub remote_url: String,

    /// Remote API key. If not set, read from MNEMON_API_KEY env var
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,

    /// Published provider rate: requests per window
    pub rate_limit_requests: usize,

    /// Published provider rate: window length in seconds
    pub rate_limit_window_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            model: "nomic-embed-text".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            remote_model: "text-embedding-3-small".to_string(),
            remote_url: "https://api.openai.com".to_string(),
            api_key: None,
            request_timeout_secs: 60,
            rate_limit_requests: 50,
            rate_limit_window_secs: 10,
        }
    }
}

impl EmbeddingConfig {
    /// Resolve the remote API key from config or environment
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("MNEMON_API_KEY").ok())
    }
}

// ============================================================================
// Decay Configuration
// ============================================================================

/// Decay and memory lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// How often the background decay task runs, in seconds (default: 1 hour)
    pub interval_secs: u64,

    /// Maximum memories touched per decay run
    pub batch_size: usize,

    /// Salience floor; memories never decay below this
    pub floor: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            batch_size: 500,
            floor: 0.05,
        }
    }
}

// ============================================================================
// Search Configuration
// ============================================================================

/// Search defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Default number of results
    pub default_limit: usize,

    /// Include superseded memories by default
    pub include_superseded: bool,

    /// Semantic similarity weight in ranking
    pub semantic_weight: f64,

    /// Full-text (BM25) weight in ranking
    pub keyword_weight: f64,

    /// Salience weight in ranking
    pub salience_weight: f64,

    /// Recency weight in ranking
    pub recency_weight: f64,

    /// Access-count weight in ranking
    pub access_weight: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            include_superseded: false,
            semantic_weight: 0.4,
            keyword_weight: 0.2,
            salience_weight: 0.2,
            recency_weight: 0.15,
            access_weight: 0.05,
        }
    }
}

// ============================================================================
// Indexing Configuration
// ============================================================================

/// Code indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Maximum file size to index in bytes (default: 1 MiB)
    pub max_file_size: u64,

    /// File watcher debounce in milliseconds
    pub watcher_debounce_ms: u64,

    /// Gitignore-change debounce in milliseconds
    pub gitignore_debounce_ms: u64,

    /// Extra ignore file name loaded alongside .gitignore
    pub ignore_file: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024,
            watcher_debounce_ms: 500,
            gitignore_debounce_ms: 1000,
            ignore_file: ".mnemonignore".to_string(),
        }
    }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Mnemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Embedding provider settings
    pub embedding: EmbeddingConfig,

    /// Decay and memory lifecycle settings
    pub decay: DecayConfig,

    /// Search defaults
    pub search: SearchConfig,

    /// Indexing settings
    pub index: IndexConfig,
}

impl Config {
    /// Load config for a project, with fallback to the user config
    pub fn load_for_project(project_path: &Path) -> Self {
        let project_config = Self::project_config_path(project_path);
        if let Some(config) = Self::load_file(&project_config) {
            return config;
        }

        if let Some(user_config) = Self::user_config_path() {
            if let Some(config) = Self::load_file(&user_config) {
                return config;
            }
        }

        Self::default()
    }

    fn load_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unparseable config file");
                None
            }
        }
    }

    /// Project-relative config path
    pub fn project_config_path(project_path: &Path) -> PathBuf {
        project_path.join(".mnemon").join("config.toml")
    }

    /// User-level config path
    pub fn user_config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("MNEMON_CONFIG_DIR") {
            return Some(PathBuf::from(dir).join("config.toml"));
        }
        directories::ProjectDirs::from("dev", "mnemon", "mnemon")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Whether stored vectors were produced at a different dimensionality
    /// than the active provider emits. Stale vectors are not migrated; the
    /// vector search skips them at query time.
    pub fn needs_reembedding(&self, stored_dimensions: usize, active_dimensions: usize) -> bool {
        stored_dimensions != active_dimensions
    }
}

// ============================================================================
// Data Directory Layout
// ============================================================================

/// The per-user data directory (`$XDG_DATA_HOME/mnemon` by default,
/// `MNEMON_DATA_DIR` override)
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MNEMON_DATA_DIR") {
        return PathBuf::from(dir);
    }
    directories::ProjectDirs::from("dev", "mnemon", "mnemon")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".mnemon-data"))
}

/// Path of the shared store
pub fn database_path() -> PathBuf {
    data_dir().join("memories.db")
}

/// Directory holding watcher lock files
pub fn watchers_dir() -> PathBuf {
    data_dir().join("watchers")
}

/// Stable hash of a project path, used to key lock files
pub fn project_hash(project_path: &Path) -> String {
    format!("{:016x}", fnv1a64(project_path.to_string_lossy().as_bytes()))
}

/// Lock file path for a project
pub fn watcher_lock_path(project_path: &Path) -> PathBuf {
    watchers_dir().join(format!("{}.lock", project_hash(project_path)))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.embedding.provider, ProviderKind::Ollama);
        assert_eq!(config.decay.interval_secs, 3600);
        assert_eq!(config.decay.floor, 0.05);
        assert_eq!(config.search.default_limit, 10);
        assert!(!config.search.include_superseded);
        assert_eq!(config.index.max_file_size, 1024 * 1024);
        assert_eq!(config.index.watcher_debounce_ms, 500);
    }

    #[test]
    fn project_config_overrides_defaults() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".mnemon");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.toml"),
            r#"
[embedding]
provider = "openai"
remote_model = "text-embedding-3-large"

[search]
default_limit = 25
"#,
        )
        .unwrap();

        let config = Config::load_for_project(temp.path());
        assert_eq!(config.embedding.provider, ProviderKind::OpenAi);
        assert_eq!(config.embedding.remote_model, "text-embedding-3-large");
        assert_eq!(config.search.default_limit, 25);
        // Untouched sections keep their defaults
        assert_eq!(config.decay.batch_size, 500);
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_for_project(temp.path());
        assert_eq!(config.search.default_limit, 10);
    }

    #[test]
    fn toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.embedding.model, config.embedding.model);
        assert_eq!(parsed.search.semantic_weight, config.search.semantic_weight);
    }

    #[test]
    fn project_hash_is_stable() {
        let a = project_hash(Path::new("/home/dev/project"));
        let b = project_hash(Path::new("/home/dev/project"));
        let c = project_hash(Path::new("/home/dev/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn needs_reembedding_compares_dimensions() {
        let config = Config::default();
        assert!(config.needs_reembedding(768, 1536));
        assert!(!config.needs_reembedding(1536, 1536));
    }
}
