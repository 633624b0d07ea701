//! The preset query index: record store + similarity index behind one lock.
//!
//! - Embeddings are computed before any lock is taken
//! - Every mutation updates both structures and the storage file inside one
//!   write-lock critical section, rolling back in memory if the write fails
//! - Reads share the lock and never observe a half-applied mutation

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;

use crate::preset::embeddings::{embed_with_policy, EmbeddingError, EmbeddingPolicy, EmbeddingProvider};
use crate::preset::index::{IndexError, VectorEntry, VectorIndex};
use crate::preset::preprocess::preprocess_query;
use crate::preset::records::{PresetQuery, PresetQueryRecord, RecordStore};
use crate::preset::storage::{VectorStorage, VectorStorageError};

/// Errors surfaced by preset index operations.
#[derive(Debug, thiserror::Error)]
pub enum PresetIndexError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("preset query ids already exist: {}", .0.join(", "))]
    DuplicateId(Vec<String>),

    #[error("preset query ids not found: {}", .0.join(", "))]
    NotFound(Vec<String>),

    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("embedding timed out after {0:?}")]
    EmbeddingTimeout(Duration),

    #[error("storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EmbeddingError> for PresetIndexError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::Timeout(timeout) => PresetIndexError::EmbeddingTimeout(timeout),
            other => PresetIndexError::EmbeddingProvider(other.to_string()),
        }
    }
}

/// A record of a batch that could not be embedded.
#[derive(Debug)]
pub struct RecordFailure {
    pub id: String,
    pub error: PresetIndexError,
}

/// Outcome of an add or update batch.
///
/// Records are embedded one by one; a record whose embedding fails is
/// reported here and skipped while the rest of the batch is applied.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub applied: Vec<String>,
    pub failed: Vec<RecordFailure>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One ranked match for a retrieval query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalHit {
    #[serde(rename = "preset_query_id")]
    pub id: String,
    #[serde(rename = "preset_query")]
    pub text: String,
    /// Cosine similarity, higher is closer
    pub score: f32,
}

/// Ranked matches for one input query, best first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub query: String,
    #[serde(rename = "retrieval")]
    pub hits: Vec<RetrievalHit>,
}

/// Record store and similarity index, only ever mutated together.
struct Collection {
    records: RecordStore,
    vectors: VectorIndex,
}

/// Previous state of one id, replayed in reverse to undo a mutation.
type UndoEntry = (String, Option<(PresetQueryRecord, VectorEntry)>);

impl Collection {
    fn new(dimensions: usize) -> Self {
        Self {
            records: RecordStore::new(),
            vectors: VectorIndex::new(dimensions),
        }
    }

    /// Whether `id` is present, failing if only one structure has it.
    fn presence(&self, id: &str) -> Result<bool, PresetIndexError> {
        match (self.records.contains(id), self.vectors.contains(id)) {
            (true, true) => Ok(true),
            (false, false) => Ok(false),
            (in_records, in_vectors) => {
                log::error!(
                    "preset index out of sync for id '{}': record present={}, vector present={}",
                    id,
                    in_records,
                    in_vectors
                );
                Err(PresetIndexError::Internal(format!(
                    "record store and similarity index disagree on id '{id}'"
                )))
            }
        }
    }

    fn check_len(&self) -> Result<usize, PresetIndexError> {
        let (records, vectors) = (self.records.len(), self.vectors.len());
        if records != vectors {
            log::error!(
                "preset index out of sync: {} records, {} vectors",
                records,
                vectors
            );
            return Err(PresetIndexError::Internal(format!(
                "record store has {records} entries but similarity index has {vectors}"
            )));
        }
        Ok(records)
    }

    /// Store a record and its vector, returning what they replaced.
    fn put(
        &mut self,
        record: PresetQueryRecord,
        embedding: Vec<f32>,
    ) -> Result<Option<(PresetQueryRecord, VectorEntry)>, PresetIndexError> {
        let previous_vector = self
            .vectors
            .insert(&record.id, record.seq, embedding)
            .map_err(|e| PresetIndexError::Internal(format!("validated embedding rejected: {e}")))?;
        let previous_record = self.records.insert(record);

        Ok(previous_record.zip(previous_vector))
    }

    fn take(&mut self, id: &str) -> Option<(PresetQueryRecord, VectorEntry)> {
        let record = self.records.remove(id);
        let vector = self.vectors.remove(id);
        record.zip(vector)
    }

    fn rollback(&mut self, undo: Vec<UndoEntry>, next_seq: u64) {
        for (id, previous) in undo.into_iter().rev() {
            self.records.remove(&id);
            self.vectors.remove(&id);
            if let Some((record, vector)) = previous {
                self.vectors.restore(&id, vector);
                self.records.insert(record);
            }
        }
        self.records.set_next_seq(next_seq);
    }
}

/// Maintains the preset query collection and serves similarity queries.
///
/// One instance is shared for the process lifetime.
pub struct PresetQueryIndex {
    state: RwLock<Collection>,
    embedder: Arc<dyn EmbeddingProvider>,
    policy: EmbeddingPolicy,
    storage: Option<VectorStorage>,
}

impl PresetQueryIndex {
    /// Create an empty index that is never written to disk.
    pub fn in_memory(embedder: Arc<dyn EmbeddingProvider>, policy: EmbeddingPolicy) -> Self {
        Self {
            state: RwLock::new(Collection::new(embedder.dimensions())),
            embedder,
            policy,
            storage: None,
        }
    }

    /// Open an index backed by `storage`, loading existing records.
    ///
    /// A file written with another model, format version or dimensionality
    /// is ignored and the collection starts empty; it is overwritten on the
    /// next mutation.
    pub fn open(
        embedder: Arc<dyn EmbeddingProvider>,
        policy: EmbeddingPolicy,
        storage: VectorStorage,
    ) -> Result<Self, PresetIndexError> {
        let dimensions = embedder.dimensions();
        let model_id = embedder.model_id_hash();

        let mut collection = Collection::new(dimensions);

        if storage.exists() {
            match storage.load(&model_id, dimensions) {
                Ok(stored) => {
                    collection.records = RecordStore::with_capacity(stored.entries.len(), stored.next_seq);
                    collection.vectors = VectorIndex::with_capacity(dimensions, stored.entries.len());

                    for entry in stored.entries {
                        if collection.records.contains(&entry.record.id) {
                            return Err(VectorStorageError::InvalidFormat(format!(
                                "duplicate preset query id '{}'",
                                entry.record.id
                            ))
                            .into());
                        }
                        if let Err(err) = collection.vectors.validate(&entry.embedding) {
                            return Err(VectorStorageError::InvalidFormat(format!(
                                "stored preset query '{}' has an invalid embedding: {}",
                                entry.record.id, err
                            ))
                            .into());
                        }
                        collection.put(entry.record, entry.embedding)?;
                    }
                    log::info!(
                        "loaded {} preset queries from {}",
                        collection.records.len(),
                        storage.path().display()
                    );
                }
                Err(VectorStorageError::ModelMismatch) => {
                    log::warn!("embedding model changed, starting with an empty preset collection");
                }
                Err(VectorStorageError::DimensionMismatch { expected, got }) => {
                    log::warn!(
                        "stored presets have {} dimensions, model has {}, starting with an empty preset collection",
                        got,
                        expected
                    );
                }
                Err(VectorStorageError::VersionMismatch(file_ver, _)) => {
                    log::warn!(
                        "preset storage version {} unsupported, starting with an empty preset collection",
                        file_ver
                    );
                }
                Err(e) => {
                    log::error!("failed to load preset queries: {}", e);
                    return Err(e.into());
                }
            }
        } else {
            log::info!("no preset storage at {}, starting fresh", storage.path().display());
        }

        Ok(Self {
            state: RwLock::new(collection),
            embedder,
            policy,
            storage: Some(storage),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.embedder.name()
    }

    /// Insert new preset queries. Existing ids are never overwritten.
    pub fn add(&self, presets: Vec<PresetQuery>) -> Result<BatchReport, PresetIndexError> {
        validate_batch(&presets)?;

        {
            let state = self.read()?;
            let existing = existing_ids(&state, &presets)?;
            if !existing.is_empty() {
                return Err(PresetIndexError::DuplicateId(existing));
            }
        }

        let (embedded, failed) = self.embed_batch(presets);

        let mut state = self.write()?;

        // a concurrent add may have claimed an id while we were embedding
        let existing = existing_ids(&state, embedded.iter().map(|(p, _)| p))?;
        if !existing.is_empty() {
            return Err(PresetIndexError::DuplicateId(existing));
        }

        let now = chrono::Utc::now().timestamp();
        let next_seq = state.records.next_seq();
        let mut undo: Vec<UndoEntry> = Vec::with_capacity(embedded.len());
        let mut applied = Vec::with_capacity(embedded.len());

        for (preset, embedding) in embedded {
            let seq = state.records.allocate_seq();
            let record = PresetQueryRecord {
                id: preset.id,
                text: preset.text,
                seq,
                created_at: now,
                updated_at: now,
            };
            let id = record.id.clone();
            match state.put(record, embedding) {
                Ok(previous) => {
                    undo.push((id.clone(), previous));
                    applied.push(id);
                }
                Err(err) => {
                    state.rollback(undo, next_seq);
                    return Err(err);
                }
            }
        }

        if !applied.is_empty() {
            if let Err(err) = self.persist(&state) {
                state.rollback(undo, next_seq);
                return Err(err);
            }
        }

        log::info!("added {} preset queries ({} failed)", applied.len(), failed.len());

        Ok(BatchReport { applied, failed })
    }

    /// Replace the text and embedding of existing preset queries.
    pub fn update(&self, presets: Vec<PresetQuery>) -> Result<BatchReport, PresetIndexError> {
        validate_batch(&presets)?;

        {
            let state = self.read()?;
            let missing = missing_ids(&state, &presets)?;
            if !missing.is_empty() {
                return Err(PresetIndexError::NotFound(missing));
            }
        }

        let (embedded, failed) = self.embed_batch(presets);

        let mut state = self.write()?;

        // a concurrent delete may have removed an id while we were embedding
        let missing = missing_ids(&state, embedded.iter().map(|(p, _)| p))?;
        if !missing.is_empty() {
            return Err(PresetIndexError::NotFound(missing));
        }

        let now = chrono::Utc::now().timestamp();
        let next_seq = state.records.next_seq();
        let mut undo: Vec<UndoEntry> = Vec::with_capacity(embedded.len());
        let mut applied = Vec::with_capacity(embedded.len());

        for (preset, embedding) in embedded {
            let Some(current) = state.records.get(&preset.id).cloned() else {
                state.rollback(undo, next_seq);
                return Err(PresetIndexError::Internal(format!(
                    "record '{}' vanished under write lock",
                    preset.id
                )));
            };
            let record = PresetQueryRecord {
                text: preset.text,
                updated_at: now,
                ..current
            };
            match state.put(record, embedding) {
                Ok(previous) => {
                    undo.push((preset.id.clone(), previous));
                    applied.push(preset.id);
                }
                Err(err) => {
                    state.rollback(undo, next_seq);
                    return Err(err);
                }
            }
        }

        if !applied.is_empty() {
            if let Err(err) = self.persist(&state) {
                state.rollback(undo, next_seq);
                return Err(err);
            }
        }

        log::info!("updated {} preset queries ({} failed)", applied.len(), failed.len());

        Ok(BatchReport { applied, failed })
    }

    /// Remove the given ids. Absent ids are ignored.
    ///
    /// Returns the number of records removed.
    pub fn delete_by_ids(&self, ids: &[String]) -> Result<usize, PresetIndexError> {
        let mut state = self.write()?;
        let next_seq = state.records.next_seq();
        let mut undo: Vec<UndoEntry> = Vec::new();

        for id in ids {
            if !state.presence(id)? {
                continue;
            }
            if let Some(previous) = state.take(id) {
                undo.push((id.clone(), Some(previous)));
            }
        }

        let removed = undo.len();
        if removed > 0 {
            if let Err(err) = self.persist(&state) {
                state.rollback(undo, next_seq);
                return Err(err);
            }
        }

        log::info!("deleted {} of {} requested preset queries", removed, ids.len());

        Ok(removed)
    }

    /// Look up records by id, in request order. Absent ids yield `None`.
    pub fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<PresetQueryRecord>>, PresetIndexError> {
        let state = self.read()?;
        ids.iter()
            .map(|id| {
                state
                    .presence(id)
                    .map(|present| if present { state.records.get(id).cloned() } else { None })
            })
            .collect()
    }

    /// Remove every record.
    pub fn empty(&self) -> Result<(), PresetIndexError> {
        let mut state = self.write()?;
        let next_seq = state.records.next_seq();

        let previous = std::mem::replace(&mut *state, Collection::new(self.dimensions()));
        state.records.set_next_seq(next_seq);

        if let Err(err) = self.persist(&state) {
            *state = previous;
            return Err(err);
        }

        log::info!("emptied preset collection ({} records removed)", previous.records.len());

        Ok(())
    }

    pub fn size(&self) -> Result<usize, PresetIndexError> {
        self.read()?.check_len()
    }

    /// Top-`n_results` preset queries for each query text, in input order.
    pub fn retrieve(
        &self,
        query_texts: &[String],
        n_results: usize,
    ) -> Result<Vec<RetrievalResult>, PresetIndexError> {
        let prepared = query_texts
            .iter()
            .map(|text| {
                preprocess_query(text).ok_or_else(|| {
                    PresetIndexError::InvalidArgument("query text must not be empty".to_string())
                })
            })
            .collect::<Result<Vec<String>, _>>()?;

        let no_hits = || {
            query_texts
                .iter()
                .map(|query| RetrievalResult {
                    query: query.clone(),
                    hits: Vec::new(),
                })
                .collect()
        };

        if n_results == 0 || self.size()? == 0 {
            return Ok(no_hits());
        }

        let embeddings = prepared
            .iter()
            .map(|text| embed_with_policy(&self.embedder, text, &self.policy))
            .collect::<Result<Vec<Vec<f32>>, EmbeddingError>>()?;

        let state = self.read()?;
        let mut results = Vec::with_capacity(query_texts.len());

        for (query, embedding) in query_texts.iter().zip(embeddings) {
            let matches = state
                .vectors
                .search(&embedding, n_results)
                .map_err(|e| PresetIndexError::EmbeddingProvider(e.to_string()))?;

            let hits = matches
                .into_iter()
                .map(|m| {
                    let record = state.records.get(&m.id).ok_or_else(|| {
                        log::error!("vector '{}' has no record", m.id);
                        PresetIndexError::Internal(format!("vector '{}' has no record", m.id))
                    })?;
                    Ok(RetrievalHit {
                        id: m.id,
                        text: record.text.clone(),
                        score: m.score,
                    })
                })
                .collect::<Result<Vec<_>, PresetIndexError>>()?;

            results.push(RetrievalResult {
                query: query.clone(),
                hits,
            });
        }

        Ok(results)
    }

    /// Embed every preset, isolating failures per record.
    fn embed_batch(
        &self,
        presets: Vec<PresetQuery>,
    ) -> (Vec<(PresetQuery, Vec<f32>)>, Vec<RecordFailure>) {
        let shape = VectorIndex::new(self.dimensions());
        let mut embedded = Vec::with_capacity(presets.len());
        let mut failed = Vec::new();

        for preset in presets {
            let result = preprocess_query(&preset.text)
                .ok_or_else(|| PresetIndexError::InvalidArgument("preset query must not be empty".to_string()))
                .and_then(|text| {
                    embed_with_policy(&self.embedder, &text, &self.policy)
                        .map_err(PresetIndexError::from)
                })
                .and_then(|embedding| {
                    shape
                        .validate(&embedding)
                        .map(|_| embedding)
                        .map_err(|e: IndexError| PresetIndexError::EmbeddingProvider(e.to_string()))
                });

            match result {
                Ok(embedding) => embedded.push((preset, embedding)),
                Err(error) => {
                    log::warn!("failed to embed preset query '{}': {}", preset.id, error);
                    failed.push(RecordFailure {
                        id: preset.id,
                        error,
                    });
                }
            }
        }

        (embedded, failed)
    }

    /// Write the whole collection to storage, if persistent.
    fn persist(&self, state: &Collection) -> Result<(), PresetIndexError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        let records = state.records.iter_by_seq();
        let entries = records
            .iter()
            .map(|record| {
                state
                    .vectors
                    .get(&record.id)
                    .map(|entry| (*record, entry.embedding.as_slice()))
                    .ok_or_else(|| {
                        PresetIndexError::Internal(format!("record '{}' has no vector", record.id))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        storage
            .save(
                entries.into_iter(),
                self.dimensions(),
                state.records.next_seq(),
                &self.embedder.model_id_hash(),
            )
            .map_err(|e| {
                log::error!("failed to persist preset queries: {}", e);
                PresetIndexError::from(e)
            })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Collection>, PresetIndexError> {
        self.state
            .read()
            .map_err(|e| PresetIndexError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Collection>, PresetIndexError> {
        self.state
            .write()
            .map_err(|e| PresetIndexError::Internal(format!("Lock poisoned: {}", e)))
    }
}

/// Reject blank ids or texts and ids repeated within the batch.
fn validate_batch(presets: &[PresetQuery]) -> Result<(), PresetIndexError> {
    let mut seen = HashSet::with_capacity(presets.len());

    for (position, preset) in presets.iter().enumerate() {
        if preset.id.trim().is_empty() {
            return Err(PresetIndexError::InvalidArgument(format!(
                "preset_query_id at position {position} is empty"
            )));
        }
        if preset.text.trim().is_empty() {
            return Err(PresetIndexError::InvalidArgument(format!(
                "preset_query for id '{}' is empty",
                preset.id
            )));
        }
        if !seen.insert(preset.id.as_str()) {
            return Err(PresetIndexError::InvalidArgument(format!(
                "preset_query_id '{}' appears more than once in the batch",
                preset.id
            )));
        }
    }

    Ok(())
}

fn existing_ids<'a>(
    state: &Collection,
    presets: impl IntoIterator<Item = &'a PresetQuery>,
) -> Result<Vec<String>, PresetIndexError> {
    let mut existing = Vec::new();
    for preset in presets {
        if state.presence(&preset.id)? {
            existing.push(preset.id.clone());
        }
    }
    Ok(existing)
}

fn missing_ids<'a>(
    state: &Collection,
    presets: impl IntoIterator<Item = &'a PresetQuery>,
) -> Result<Vec<String>, PresetIndexError> {
    let mut missing = Vec::new();
    for preset in presets {
        if !state.presence(&preset.id)? {
            missing.push(preset.id.clone());
        }
    }
    Ok(missing)
}
