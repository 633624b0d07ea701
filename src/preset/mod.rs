//! Preset query semantic index.
//!
//! Keeps a collection of canned natural-language queries, each with an
//! embedding, and answers top-k similarity lookups against it.
//!
//! # Architecture
//!
//! - `embeddings`: Embedding providers (fastembed, hashed tokens) and call policy
//! - `records`: Canonical id -> text records
//! - `index`: In-memory vector index with cosine similarity search
//! - `storage`: Binary file I/O for presets.bin persistence
//! - `preprocess`: Text preprocessing for embedding input
//! - `collection`: The transactional index composing all of the above

mod collection;
pub mod embeddings;
mod index;
mod preprocess;
mod records;
mod storage;

pub use collection::{BatchReport, PresetIndexError, PresetQueryIndex, RetrievalResult};
pub use embeddings::{provider_from_config, EmbeddingPolicy};
pub use records::PresetQuery;
pub use storage::VectorStorage;

/// File name of the persisted collection inside the base directory
pub const STORAGE_FILE: &str = "presets.bin";
