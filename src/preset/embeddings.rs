//! Embedding providers for preset query text.
//!
//! - `EmbeddingProvider`: the seam the preset index embeds through
//! - `EmbeddingModel`: local ONNX models via fastembed, downloaded on first use
//! - `HashedTokenEmbedder`: deterministic feature-hashing of query terms, no model needed
//! - `embed_with_policy`: timeout + single retry around any provider

use fastembed::{InitOptions, TextEmbedding};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::preset::preprocess::tokenize;

/// Model name selecting `HashedTokenEmbedder`.
pub const HASHED_TOKENS_MODEL: &str = "hashed-tokens";

/// Embedding workers one index may have running at once, timed out ones included.
pub const DEFAULT_MAX_WORKERS: usize = 32;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("{0} embedding workers are still running")]
    WorkersBusy(usize),
}

/// Maps text to a fixed-dimension vector.
pub trait EmbeddingProvider: Send + Sync {
    /// Model name, persisted (hashed) alongside the vectors.
    fn name(&self) -> &str;

    /// Length of every vector `embed` returns.
    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// SHA256 of the model name, used to detect model changes in stored vectors.
    fn model_id_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.name().as_bytes());
        hasher.finalize().into()
    }
}

/// Build the provider selected in config.
pub fn provider_from_config(
    config: &EmbeddingConfig,
    base_path: &Path,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    if config.model.eq_ignore_ascii_case(HASHED_TOKENS_MODEL) {
        return Ok(Arc::new(HashedTokenEmbedder::new(config.hashed_dimensions)?));
    }

    let timeout = Duration::from_secs(config.download_timeout_secs);
    let model = EmbeddingModel::new(&config.model, base_path.to_path_buf(), Some(timeout))?;
    Ok(Arc::new(model))
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Create a new embedding model with the given name.
    ///
    /// The model will be downloaded on first use if not cached.
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        log::info!(
            "loading embedding model '{}' (download timeout {:?})",
            model_name,
            download_timeout
        );

        let (model, dimensions) = match download_timeout {
            Some(timeout) => run_with_timeout("embedding-init", timeout, move || {
                Self::load(model_enum, models_dir)
            })
            .map_err(|e| match e {
                EmbeddingError::Timeout(timeout) => EmbeddingError::InitFailed(format!(
                    "model '{}' was not ready within {:?}",
                    model_name, timeout
                )),
                other => other,
            })?,
            None => Self::load(model_enum, models_dir)?,
        };

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "bge-small-zh-v1.5" | "bgesmallzhv15" => Ok(fastembed::EmbeddingModel::BGESmallZHV15),
            "multilingual-e5-small" | "multilinguale5small" => {
                Ok(fastembed::EmbeddingModel::MultilingualE5Small)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: {}, all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, bge-small-zh-v1.5, multilingual-e5-small",
                name, HASHED_TOKENS_MODEL
            ))),
        }
    }

    /// Download (if needed) and initialize the model, then measure its output size.
    fn load(
        model: fastembed::EmbeddingModel,
        models_dir: PathBuf,
    ) -> Result<(TextEmbedding, usize), EmbeddingError> {
        let options = InitOptions::new(model)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::detect_dimensions(&mut model)?;
        Ok((model, dimensions))
    }

    /// Embed a sample text to determine embedding dimensions.
    fn detect_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to detect dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl EmbeddingProvider for EmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

/// Bag-of-words embedding: each term is hashed into one of `dimensions`
/// buckets and the count vector is L2-normalized.
///
/// Scores lexical overlap only, but is deterministic across builds and
/// needs no model download.
pub struct HashedTokenEmbedder {
    dimensions: usize,
}

impl HashedTokenEmbedder {
    pub fn new(dimensions: usize) -> Result<Self, EmbeddingError> {
        if dimensions == 0 || dimensions > u16::MAX as usize {
            return Err(EmbeddingError::InitFailed(format!(
                "hashed dimensions must be between 1 and {}, got {}",
                u16::MAX,
                dimensions
            )));
        }
        Ok(Self { dimensions })
    }
}

impl EmbeddingProvider for HashedTokenEmbedder {
    fn name(&self) -> &str {
        HASHED_TOKENS_MODEL
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut terms = tokenize(text);
        if terms.is_empty() {
            // all stop words: fall back to the whole text as one term
            let whole = text.trim().to_lowercase();
            if whole.is_empty() {
                return Err(EmbeddingError::EmbeddingFailed(
                    "cannot embed empty text".to_string(),
                ));
            }
            terms.push(whole);
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for term in &terms {
            let bucket = crc32fast::hash(term.as_bytes()) as usize % self.dimensions;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        for value in vector.iter_mut() {
            *value /= norm;
        }

        Ok(vector)
    }
}

/// Timeout, retry and worker limits for embedding calls.
///
/// Clones share one worker count.
#[derive(Debug, Clone)]
pub struct EmbeddingPolicy {
    pub timeout: Duration,
    pub retry_backoff: Duration,
    pub max_workers: usize,
    workers: Arc<AtomicUsize>,
}

impl EmbeddingPolicy {
    pub fn new(timeout: Duration, retry_backoff: Duration) -> Self {
        Self {
            timeout,
            retry_backoff,
            max_workers: DEFAULT_MAX_WORKERS,
            workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(
            Duration::from_millis(config.timeout_ms),
            Duration::from_millis(config.retry_backoff_ms),
        )
        .with_max_workers(config.max_workers)
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Workers spawned by `embed_with_policy` that have not returned yet.
    pub fn running_workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }
}

/// Releases a worker slot when the embedding call returns.
struct WorkerSlot(Arc<AtomicUsize>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Embed `text`, retrying once after `retry_backoff` on failure or timeout.
pub fn embed_with_policy(
    provider: &Arc<dyn EmbeddingProvider>,
    text: &str,
    policy: &EmbeddingPolicy,
) -> Result<Vec<f32>, EmbeddingError> {
    match embed_once(provider, text, policy) {
        Ok(embedding) => Ok(embedding),
        Err(err) => {
            log::warn!(
                "embedding with '{}' failed, retrying in {:?}: {}",
                provider.name(),
                policy.retry_backoff,
                err
            );
            std::thread::sleep(policy.retry_backoff);
            embed_once(provider, text, policy)
        }
    }
}

/// Run one embedding call on a worker thread and wait at most `policy.timeout`.
///
/// Fails fast while `policy.max_workers` earlier calls are still running.
fn embed_once(
    provider: &Arc<dyn EmbeddingProvider>,
    text: &str,
    policy: &EmbeddingPolicy,
) -> Result<Vec<f32>, EmbeddingError> {
    let running = policy.workers.fetch_add(1, Ordering::SeqCst);
    let slot = WorkerSlot(Arc::clone(&policy.workers));
    if running >= policy.max_workers {
        log::warn!(
            "refusing embedding call to '{}': {} workers still running",
            provider.name(),
            running
        );
        return Err(EmbeddingError::WorkersBusy(running));
    }

    let worker = Arc::clone(provider);
    let text = text.to_string();

    run_with_timeout("embedding", policy.timeout, move || {
        let _slot = slot;
        worker.embed(&text)
    })
    .inspect_err(|err| {
        if let EmbeddingError::Timeout(_) = err {
            log::warn!(
                "embedding call to '{}' timed out, {} workers still running",
                provider.name(),
                policy.running_workers()
            );
        }
    })
}

/// Run `work` on a named thread and wait at most `timeout` for its result.
///
/// A timed out worker is detached; its result is dropped when it finishes.
fn run_with_timeout<T, F>(name: &str, timeout: Duration, work: F) -> Result<T, EmbeddingError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EmbeddingError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(work());
        })
        .map_err(|e| EmbeddingError::EmbeddingFailed(format!("failed to spawn {name} worker: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(EmbeddingError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(EmbeddingError::EmbeddingFailed(format!(
            "{name} worker exited without a result"
        ))),
    }
}
