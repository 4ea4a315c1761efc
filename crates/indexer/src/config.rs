use crate::error::{IndexerError, Result};
use crate::limits::{self, DEFAULT_AUGMENT_CONCURRENCY};
use context_llm::LlmConfig;
use context_vector_store::{
    context_dir_for_project_root, repo_hash_path_for_project_root, shadow_dir_for_project_root,
    vector_store_path, EmbeddingConfig, EmbeddingProvider, DEFAULT_MAX_RECORDS,
};
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Files above this size are never candidates.
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 8 * 1024 * 1024;

const ENV_EMBEDDING_PROVIDER: &str = "CONTEXT_EMBEDDING_PROVIDER";
const ENV_EMBEDDING_MODEL: &str = "CONTEXT_EMBEDDING_MODEL";
const ENV_EMBEDDING_API_KEY: &str = "CONTEXT_EMBEDDING_API_KEY";
const ENV_LLM_MODEL: &str = "CONTEXT_LLM_MODEL";
const ENV_LLM_BASE_URL: &str = "CONTEXT_LLM_BASE_URL";
const ENV_LLM_API_KEY: &str = "CONTEXT_LLM_API_KEY";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Nearest neighbours fetched per task
    pub top_k: usize,

    /// LLM calls before giving up on a parseable answer
    pub max_attempts: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            max_attempts: 3,
        }
    }
}

/// Everything a run needs, fixed for its duration.
///
/// Loaded from `<root>/.context/config.toml` when present, then overridden from the
/// environment. Construct with [`IndexingConfig::load`] or [`IndexingConfig::new`] and call
/// [`IndexingConfig::validate`] before use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    #[serde(skip)]
    pub root: PathBuf,

    /// Runs the context augmentation phase and indexes the shadow tree instead of the sources.
    pub context_enabled: bool,

    /// Free-text description of the application, passed to every augmentation prompt.
    pub app_context: String,

    pub augment_concurrency: usize,

    /// Extra glob patterns, relative to the root, that are never indexed.
    pub exclude_patterns: Vec<String>,

    pub max_file_size_bytes: u64,

    pub max_store_records: usize,

    pub embedding: EmbeddingConfig,

    pub llm: LlmConfig,

    pub retrieval: RetrievalConfig,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            context_enabled: true,
            app_context: String::new(),
            augment_concurrency: DEFAULT_AUGMENT_CONCURRENCY,
            exclude_patterns: Vec::new(),
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            max_store_records: DEFAULT_MAX_RECORDS,
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl IndexingConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Reads the workspace config file (if any), applies environment overrides and validates.
    pub async fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|err| IndexerError::InvalidPath(format!("{}: {err}", root.display())))?;

        let path = Self::config_path(&root);
        let mut config = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                log::debug!("Loading config from {}", path.display());
                toml::from_str::<Self>(&raw)?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(err.into()),
        };
        config.root = root;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn config_path(root: &Path) -> PathBuf {
        context_dir_for_project_root(root).join(CONFIG_FILE_NAME)
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let concurrency = lookup(limits::CONCURRENCY_ENV);
        self.augment_concurrency =
            limits::parse_concurrency(concurrency.as_deref(), self.augment_concurrency);

        if let Some(provider) = lookup(ENV_EMBEDDING_PROVIDER) {
            self.embedding.provider = EmbeddingProvider::parse(&provider)?;
        }
        if let Some(model) = lookup(ENV_EMBEDDING_MODEL) {
            self.embedding.model = model;
        }
        if let Some(key) = lookup(ENV_EMBEDDING_API_KEY) {
            self.embedding.api_key = Some(key);
        }
        if let Some(model) = lookup(ENV_LLM_MODEL) {
            self.llm.model = model;
        }
        if let Some(url) = lookup(ENV_LLM_BASE_URL) {
            self.llm.base_url = url;
        }
        if let Some(key) = lookup(ENV_LLM_API_KEY) {
            self.llm.api_key = Some(key);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(IndexerError::InvalidPath(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        if self.augment_concurrency == 0 || self.augment_concurrency > limits::MAX_AUGMENT_CONCURRENCY
        {
            return Err(IndexerError::ConfigError(format!(
                "augment_concurrency must be within 1..={}",
                limits::MAX_AUGMENT_CONCURRENCY
            )));
        }
        if self.max_file_size_bytes == 0 {
            return Err(IndexerError::ConfigError(
                "max_file_size_bytes must be positive".to_string(),
            ));
        }
        if self.max_store_records == 0 {
            return Err(IndexerError::ConfigError(
                "max_store_records must be positive".to_string(),
            ));
        }
        if self.retrieval.top_k == 0 || self.retrieval.max_attempts == 0 {
            return Err(IndexerError::ConfigError(
                "retrieval top_k and max_attempts must be positive".to_string(),
            ));
        }
        if self.embedding.chunk_size == Some(0) {
            return Err(IndexerError::ConfigError(
                "embedding chunk_size must be positive".to_string(),
            ));
        }
        for pattern in &self.exclude_patterns {
            Glob::new(pattern)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn shadow_dir(&self) -> PathBuf {
        shadow_dir_for_project_root(&self.root)
    }

    #[must_use]
    pub fn repo_hash_path(&self) -> PathBuf {
        repo_hash_path_for_project_root(&self.root)
    }

    /// Store of the namespace selected by `context_enabled`.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        vector_store_path(&self.root, self.context_enabled)
    }

    /// Tree that gets vectorized: the shadow mirror when augmentation is on.
    #[must_use]
    pub fn vectorization_root(&self) -> PathBuf {
        if self.context_enabled {
            self.shadow_dir()
        } else {
            self.root.clone()
        }
    }
}
