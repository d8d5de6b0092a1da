use crate::storage::{self, StorageManager};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const TASK_QUEUE_MAX_THREADS: u16 = 4;
const TASK_QUEUE_MAX_RETRIES: u8 = 3;

/// Default embedding model (bge-base offers +13% accuracy vs MiniLM)
const DEFAULT_EMBEDDING_MODEL: &str = "bge-base-en-v1.5";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Default similarity threshold for relation building and ad hoc search
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;
/// Default number of similar requirements returned per query
const DEFAULT_MATCH_COUNT: usize = 5;

/// Default index file name, relative to the data directory
const DEFAULT_INDEX_FILE: &str = "requirement_vectors.bin";
/// Default bounded wait for the index write lock in seconds
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;

/// Similarity matching knobs shared by ad hoc search and automatic
/// relation building.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Minimum similarity score [0.0, 1.0]; matches at or below it are dropped
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Number of candidates returned per query
    #[serde(default = "default_match_count")]
    pub match_count: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            match_count: DEFAULT_MATCH_COUNT,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name for embeddings (e.g., "bge-base-en-v1.5")
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Index file name, relative to the data directory
    #[serde(default = "default_index_file")]
    pub file: String,

    /// Bounded wait for the cross-process index write lock, in seconds
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            file: DEFAULT_INDEX_FILE.to_string(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }
}

fn default_similarity_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

fn default_match_count() -> usize {
    DEFAULT_MATCH_COUNT
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_index_file() -> String {
    DEFAULT_INDEX_FILE.to_string()
}

fn default_lock_timeout_secs() -> u64 {
    DEFAULT_LOCK_TIMEOUT_SECS
}

fn task_queue_max_threads() -> u16 {
    TASK_QUEUE_MAX_THREADS
}

fn task_queue_max_retries() -> u8 {
    TASK_QUEUE_MAX_RETRIES
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "task_queue_max_threads")]
    pub task_queue_max_threads: u16,
    #[serde(default = "task_queue_max_retries")]
    pub task_queue_max_retries: u8,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Config {
    fn validate(&mut self) -> anyhow::Result<()> {
        if self.task_queue_max_threads == 0 {
            self.task_queue_max_threads = 1
        }

        if !(0.0..=1.0).contains(&self.matching.similarity_threshold) {
            bail!(
                "matching.similarity_threshold must be between 0.0 and 1.0, got {}",
                self.matching.similarity_threshold
            );
        }

        if self.matching.match_count == 0 {
            bail!("matching.match_count must be greater than 0");
        }

        if self.embedding.download_timeout_secs == 0 {
            bail!("embedding.download_timeout_secs must be greater than 0");
        }

        if self.index.file.is_empty() {
            bail!("index.file must not be empty");
        }

        if self.index.lock_timeout_secs == 0 {
            bail!("index.lock_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    pub fn load_with(base_path: &str) -> anyhow::Result<Self> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists("config.yaml") {
            store.write("config.yaml", serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str =
            String::from_utf8(store.read("config.yaml")?).context("config file is not valid utf8")?;
        let mut config: Self =
            serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write("config.yaml", config_str.as_bytes())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_pass_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        assert!((config.matching.similarity_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.matching.match_count, 5);
        assert_eq!(config.index.lock_timeout_secs, 60);
    }

    #[test]
    fn test_zero_threads_coerced_to_one() {
        let mut config = Config {
            task_queue_max_threads: 0,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.task_queue_max_threads, 1);
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut config = Config::default();
        config.matching.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_match_count_rejected() {
        let mut config = Config::default();
        config.matching.match_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_creates_default_config() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_str().unwrap();

        let config = Config::load_with(base).unwrap();
        assert_eq!(config.embedding.model, "bge-base-en-v1.5");
        assert!(tmp.path().join("config.yaml").exists());

        // a second load reads the file back unchanged
        let reloaded = Config::load_with(base).unwrap();
        assert_eq!(reloaded.matching.match_count, config.matching.match_count);
    }
}
