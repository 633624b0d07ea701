mod preset_index;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::preset::embeddings::{EmbeddingError, EmbeddingProvider, HashedTokenEmbedder};
use crate::preset::{EmbeddingPolicy, PresetQuery, PresetQueryIndex};

pub const TEST_DIMENSIONS: usize = 1024;

pub fn fast_policy() -> EmbeddingPolicy {
    EmbeddingPolicy::new(Duration::from_secs(10), Duration::from_millis(1))
}

pub fn hashed() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashedTokenEmbedder::new(TEST_DIMENSIONS).unwrap())
}

pub fn in_memory_index() -> PresetQueryIndex {
    PresetQueryIndex::in_memory(hashed(), fast_policy())
}

pub fn preset(id: &str, text: &str) -> PresetQuery {
    PresetQuery::new(id, text)
}

/// Delegates to the hashed embedder but misbehaves on texts containing a marker.
///
/// - "broken": fails every call
/// - "slow": sleeps past any test timeout
/// - "wrong": returns a vector of the wrong length
/// - "nan": returns a vector starting with NaN
pub struct FakeProvider {
    inner: HashedTokenEmbedder,
    pub calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashedTokenEmbedder::new(TEST_DIMENSIONS).unwrap(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn dimensions(&self) -> usize {
        TEST_DIMENSIONS
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if text.contains("broken") {
            return Err(EmbeddingError::EmbeddingFailed("provider unavailable".to_string()));
        }
        if text.contains("slow") {
            std::thread::sleep(Duration::from_millis(800));
        }
        if text.contains("wrong") {
            return Ok(vec![1.0; TEST_DIMENSIONS / 2]);
        }
        if text.contains("nan") {
            let mut embedding = vec![1.0; TEST_DIMENSIONS];
            embedding[0] = f32::NAN;
            return Ok(embedding);
        }

        self.inner.embed(text)
    }
}

pub fn fake_index(provider: Arc<FakeProvider>) -> PresetQueryIndex {
    PresetQueryIndex::in_memory(
        provider,
        EmbeddingPolicy::new(Duration::from_millis(200), Duration::from_millis(1)),
    )
}
