use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::preset::embeddings::{DEFAULT_MAX_WORKERS, HASHED_TOKENS_MODEL};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 9092;

/// Default embedding model
const DEFAULT_EMBEDDING_MODEL: &str = "bge-small-en-v1.5";
const DEFAULT_HASHED_DIMENSIONS: usize = 256;
/// Per-call embedding timeout in milliseconds
const DEFAULT_EMBEDDING_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const DEFAULT_N_RESULTS: usize = 5;
const DEFAULT_COLLABORATOR_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Configuration for the embedding provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name (e.g., "bge-small-en-v1.5"), or "hashed-tokens" for the offline provider
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector size of the "hashed-tokens" provider
    #[serde(default = "default_hashed_dimensions")]
    pub hashed_dimensions: usize,

    /// Timeout for a single embedding call in milliseconds
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,

    /// Pause before the single retry of a failed embedding call
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Embedding calls allowed to run at once, timed out calls included
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            hashed_dimensions: default_hashed_dimensions(),
            timeout_ms: default_embedding_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_workers: default_max_workers(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_hashed_dimensions() -> usize {
    DEFAULT_HASHED_DIMENSIONS
}

fn default_embedding_timeout_ms() -> u64 {
    DEFAULT_EMBEDDING_TIMEOUT_MS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresetConfig {
    /// Write the collection to presets.bin after every mutation
    #[serde(default = "default_persist")]
    pub persist: bool,

    /// n_results used by retrieval requests that do not set one
    #[serde(default = "default_n_results")]
    pub default_n_results: usize,
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            persist: default_persist(),
            default_n_results: default_n_results(),
        }
    }
}

fn default_persist() -> bool {
    true
}

fn default_n_results() -> usize {
    DEFAULT_N_RESULTS
}

/// Where requests for the external text-to-SQL agent and plugin selector are forwarded
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    #[serde(default)]
    pub text2sql_url: Option<String>,

    #[serde(default)]
    pub plugin_selection_url: Option<String>,

    #[serde(default = "default_collaborator_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            text2sql_url: None,
            plugin_selection_url: None,
            request_timeout_secs: default_collaborator_timeout_secs(),
        }
    }
}

fn default_collaborator_timeout_secs() -> u64 {
    DEFAULT_COLLABORATOR_TIMEOUT_SECS
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub preset: PresetConfig,
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.trim().is_empty() {
            bail!("server.host must not be empty");
        }

        let emb = &self.embedding;
        if emb.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }

        if emb.model.eq_ignore_ascii_case(HASHED_TOKENS_MODEL)
            && !(1..=u16::MAX as usize).contains(&emb.hashed_dimensions)
        {
            bail!(
                "embedding.hashed_dimensions must be between 1 and {}, got {}",
                u16::MAX,
                emb.hashed_dimensions
            );
        }

        if emb.timeout_ms == 0 {
            bail!("embedding.timeout_ms must be greater than 0");
        }

        if emb.max_workers == 0 {
            bail!("embedding.max_workers must be greater than 0");
        }

        if emb.download_timeout_secs == 0 {
            bail!("embedding.download_timeout_secs must be greater than 0");
        }

        if self.preset.default_n_results == 0 {
            bail!("preset.default_n_results must be greater than 0");
        }

        for (name, url) in [
            ("collaborators.text2sql_url", &self.collaborators.text2sql_url),
            (
                "collaborators.plugin_selection_url",
                &self.collaborators.plugin_selection_url,
            ),
        ] {
            if let Some(url) = url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    bail!("{name} must be an http(s) url, got '{url}'");
                }
            }
        }

        if self.collaborators.request_timeout_secs == 0 {
            bail!("collaborators.request_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&path, defaults)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", path.display()))?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        config.apply_env_overrides()?;

        Ok(config)
    }

    /// `LLMPARSER_HOST` and `LLMPARSER_PORT` take precedence over the file.
    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = std::env::var("LLMPARSER_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("LLMPARSER_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("LLMPARSER_PORT is not a valid port: {port}"))?;
        }

        Ok(())
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = self.base_path.join(CONFIG_FILE);
        let config_str = serde_yml::to_string(&self)?;

        // write through a temp file so a crash never leaves half a config
        let temp_path = path.with_extension("yaml.tmp");
        std::fs::write(&temp_path, config_str.as_bytes())?;
        std::fs::rename(&temp_path, &path)?;

        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_config() {
        let tmp = tempfile::tempdir().unwrap();

        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.embedding.model, DEFAULT_EMBEDDING_MODEL);
        assert_eq!(config.preset.default_n_results, 5);
        assert!(config.preset.persist);
        assert_eq!(config.base_path(), tmp.path());
    }

    #[test]
    fn test_partial_config_is_filled_and_resaved() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(&path, "embedding:\n  model: hashed-tokens\n").unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.embedding.model, "hashed-tokens");
        assert_eq!(config.embedding.hashed_dimensions, DEFAULT_HASHED_DIMENSIONS);

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("hashed_dimensions"));
        assert!(saved.contains("collaborators"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            "embedding:\n  timeout_ms: 0\n",
            "embedding:\n  max_workers: 0\n",
            "preset:\n  default_n_results: 0\n",
            "embedding:\n  model: hashed-tokens\n  hashed_dimensions: 0\n",
            "collaborators:\n  text2sql_url: ftp://example.com\n",
        ];

        for case in cases {
            let tmp = tempfile::tempdir().unwrap();
            std::fs::write(tmp.path().join(CONFIG_FILE), case).unwrap();
            assert!(Config::load_with(tmp.path()).is_err(), "accepted: {case}");
        }
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "server: [not, a, map").unwrap();

        assert!(Config::load_with(tmp.path()).is_err());
    }
}
