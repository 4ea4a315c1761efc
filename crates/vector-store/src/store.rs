use crate::embeddings::{Embedder, EmbeddingConfig};
use crate::error::{Result, VectorStoreError};
use crate::flat_index::FlatIndex;
use crate::types::{RecordMetadata, SearchResult, VectorRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const STORE_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_MAX_RECORDS: usize = 250_000;

/// Identifies which embedding model produced the vectors of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSignature {
    pub provider: String,
    pub model: String,
}

impl From<&EmbeddingConfig> for EmbeddingSignature {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            provider: config.provider.to_string(),
            model: config.model.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedRecord {
    #[serde(flatten)]
    record: VectorRecord,
    vector: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct PersistedStore {
    schema_version: u32,
    embedding: EmbeddingSignature,
    dimension: Option<usize>,
    records: Vec<PersistedRecord>,
}

/// Records keyed by slot, plus a per-id slot list so every chunk of a file can be found
/// (and deleted) through the file path.
pub struct VectorStore {
    records: BTreeMap<usize, VectorRecord>,
    by_id: HashMap<String, Vec<usize>>,
    index: FlatIndex,
    signature: EmbeddingSignature,
    next_slot: usize,
    max_records: usize,
}

impl VectorStore {
    #[must_use]
    pub fn new(signature: EmbeddingSignature) -> Self {
        Self {
            records: BTreeMap::new(),
            by_id: HashMap::new(),
            index: FlatIndex::new(None),
            signature,
            next_slot: 0,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }

    #[must_use]
    pub const fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    #[must_use]
    pub const fn signature(&self) -> &EmbeddingSignature {
        &self.signature
    }

    /// Returns `Ok(None)` when nothing has been persisted at `path` yet.
    pub async fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let persisted: PersistedStore = serde_json::from_slice(&bytes)?;
        if persisted.schema_version != STORE_SCHEMA_VERSION {
            return Err(VectorStoreError::IndexError(format!(
                "Unsupported store schema_version {} (expected {STORE_SCHEMA_VERSION})",
                persisted.schema_version
            )));
        }

        let mut store = Self::new(persisted.embedding);
        store.index = FlatIndex::new(persisted.dimension);
        for PersistedRecord { record, vector } in persisted.records {
            store.insert(record, vector)?;
        }
        log::info!("Loaded {} records from {}", store.len(), path.display());
        Ok(Some(store))
    }

    /// Atomic write: `<path>.tmp` then rename.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut records = Vec::with_capacity(self.records.len());
        for (slot, record) in &self.records {
            let vector = self.index.get(*slot).ok_or_else(|| {
                VectorStoreError::IndexError(format!("missing vector for slot {slot}"))
            })?;
            records.push(PersistedRecord {
                record: record.clone(),
                vector: vector.to_vec(),
            });
        }
        let persisted = PersistedStore {
            schema_version: STORE_SCHEMA_VERSION,
            embedding: self.signature.clone(),
            dimension: self.index.dimension(),
            records,
        };
        let bytes = serde_json::to_vec(&persisted)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        log::debug!("Saved {} records to {}", self.len(), path.display());
        Ok(())
    }

    /// Inserts or updates records. A record whose `(id, text)` pair already exists replaces
    /// the stored one, so repeating an upsert leaves the store unchanged.
    pub async fn upsert(
        &mut self,
        embedder: &dyn Embedder,
        docs: Vec<VectorRecord>,
    ) -> Result<Vec<String>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let existing: HashMap<(&str, &str), usize> = self
            .records
            .iter()
            .map(|(slot, r)| ((r.id.as_str(), r.text.as_str()), *slot))
            .collect();
        let mut replace_slots = Vec::with_capacity(docs.len());
        let mut new_records = 0usize;
        for doc in &docs {
            let slot = existing.get(&(doc.id.as_str(), doc.text.as_str())).copied();
            if slot.is_none() {
                new_records += 1;
            }
            replace_slots.push(slot);
        }
        drop(existing);
        self.ensure_capacity(self.len() + new_records)?;

        let vectors = self.embed(embedder, &docs).await?;
        let ids = docs.iter().map(|d| d.id.clone()).collect();
        for ((doc, vector), slot) in docs.into_iter().zip(vectors).zip(replace_slots) {
            match slot {
                Some(slot) => {
                    self.index.remove(slot);
                    self.index.add(slot, vector)?;
                    self.records.insert(slot, doc);
                }
                None => self.insert(doc, vector)?,
            }
        }
        Ok(ids)
    }

    /// Replaces every record of `id` with `docs`. Embedding happens before any mutation, so a
    /// failed call leaves the previous records of `id` in place.
    pub async fn replace_source(
        &mut self,
        embedder: &dyn Embedder,
        id: &str,
        docs: Vec<VectorRecord>,
    ) -> Result<usize> {
        let current = self.by_id.get(id).map_or(0, Vec::len);
        self.ensure_capacity(self.len() - current + docs.len())?;

        let vectors = self.embed(embedder, &docs).await?;
        self.delete(&[id.to_string()]);
        let count = docs.len();
        for (doc, vector) in docs.into_iter().zip(vectors) {
            self.insert(doc, vector)?;
        }
        Ok(count)
    }

    /// Removes every record whose id is in `ids`; returns how many records were dropped.
    pub fn delete(&mut self, ids: &[String]) -> usize {
        let mut removed = 0;
        for id in ids {
            let Some(slots) = self.by_id.remove(id) else {
                continue;
            };
            for slot in slots {
                self.records.remove(&slot);
                self.index.remove(slot);
                removed += 1;
            }
        }
        removed
    }

    pub async fn search(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchResult>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = embedder.embed_query(query).await?;
        let neighbors = self.index.search(&query_vector, k)?;

        let results: Vec<SearchResult> = neighbors
            .into_iter()
            .filter_map(|(slot, score)| {
                self.records.get(&slot).map(|record| SearchResult {
                    record: record.clone(),
                    score,
                })
            })
            .collect();
        log::debug!("Search '{query}' returned {} results", results.len());
        Ok(results)
    }

    /// `(id, metadata)` of every record, in insertion order.
    pub fn documents(&self) -> impl Iterator<Item = (&str, &RecordMetadata)> {
        self.records
            .values()
            .map(|record| (record.id.as_str(), &record.metadata))
    }

    /// One fingerprint per source id, taken from any of its chunks.
    #[must_use]
    pub fn source_fingerprints(&self) -> HashMap<String, String> {
        let mut out = HashMap::with_capacity(self.by_id.len());
        for (id, metadata) in self.documents() {
            out.entry(id.to_string())
                .or_insert_with(|| metadata.fingerprint.clone());
        }
        out
    }

    #[must_use]
    pub fn contains_source(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    #[must_use]
    pub fn source_count(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn ensure_capacity(&self, requested: usize) -> Result<()> {
        if requested > self.max_records {
            return Err(VectorStoreError::CapacityExceeded {
                requested,
                limit: self.max_records,
            });
        }
        Ok(())
    }

    async fn embed(&self, embedder: &dyn Embedder, docs: &[VectorRecord]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = docs.iter().map(|d| d.text.clone()).collect();
        let vectors = embedder.embed_documents(&texts).await?;
        if vectors.len() != docs.len() {
            return Err(VectorStoreError::EmbeddingError(format!(
                "embedder returned {} vectors for {} documents",
                vectors.len(),
                docs.len()
            )));
        }
        for vector in &vectors {
            self.index.check(vector)?;
        }
        Ok(vectors)
    }

    fn insert(&mut self, record: VectorRecord, vector: Vec<f32>) -> Result<()> {
        let slot = self.next_slot;
        self.index.add(slot, vector)?;
        self.next_slot += 1;
        self.by_id.entry(record.id.clone()).or_default().push(slot);
        self.records.insert(slot, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::StubEmbedder;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn record(id: &str, text: &str, chunk_index: usize) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            text: text.to_string(),
            metadata: RecordMetadata {
                source: id.to_string(),
                file_name: id.rsplit('/').next().unwrap_or(id).to_string(),
                fingerprint: format!("fp-{id}"),
                chunk_index,
            },
        }
    }

    fn signature() -> EmbeddingSignature {
        EmbeddingSignature {
            provider: "stub".into(),
            model: "stub".into(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_for_identical_pairs() {
        let embedder = StubEmbedder::new(8);
        let mut store = VectorStore::new(signature());
        let docs = vec![record("/r/a.rs", "alpha", 0), record("/r/a.rs", "beta", 1)];

        store.upsert(&embedder, docs.clone()).await.unwrap();
        store.upsert(&embedder, docs).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.source_count(), 1);
    }

    #[tokio::test]
    async fn delete_removes_every_chunk_of_a_source() {
        let embedder = StubEmbedder::new(8);
        let mut store = VectorStore::new(signature());
        store
            .upsert(
                &embedder,
                vec![
                    record("/r/a.rs", "alpha", 0),
                    record("/r/a.rs", "beta", 1),
                    record("/r/b.rs", "gamma", 0),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.delete(&["/r/a.rs".to_string()]), 2);
        let ids: Vec<&str> = store.documents().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["/r/b.rs"]);
    }

    #[tokio::test]
    async fn search_returns_best_match_first() {
        let embedder = StubEmbedder::new(32);
        let mut store = VectorStore::new(signature());
        store
            .upsert(
                &embedder,
                vec![record("/r/a.rs", "alpha", 0), record("/r/b.rs", "beta", 0)],
            )
            .await
            .unwrap();

        let hits = store.search(&embedder, "beta", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "/r/b.rs");
    }

    #[tokio::test]
    async fn save_and_load_preserve_records_and_fingerprints() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vectors").join("store.json");
        let embedder = StubEmbedder::new(8);
        let mut store = VectorStore::new(signature());
        store
            .upsert(&embedder, vec![record("/r/a.rs", "alpha", 0)])
            .await
            .unwrap();
        store.save(&path).await.unwrap();

        let loaded = VectorStore::load(&path).await.unwrap().expect("store exists");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.signature(), &signature());
        assert_eq!(
            loaded.source_fingerprints().get("/r/a.rs").map(String::as_str),
            Some("fp-/r/a.rs")
        );
    }

    #[tokio::test]
    async fn load_missing_store_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(VectorStore::load(tmp.path().join("nope.json"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn capacity_limit_rejects_without_mutation() {
        let embedder = StubEmbedder::new(8);
        let mut store = VectorStore::new(signature()).with_max_records(2);
        store
            .upsert(&embedder, vec![record("/r/a.rs", "alpha", 0)])
            .await
            .unwrap();

        let err = store
            .replace_source(
                &embedder,
                "/r/b.rs",
                vec![record("/r/b.rs", "x", 0), record("/r/b.rs", "y", 1)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::CapacityExceeded { .. }));
        assert_eq!(store.len(), 1);

        // Replacing an existing source counts its current records as freed.
        store
            .replace_source(
                &embedder,
                "/r/a.rs",
                vec![record("/r/a.rs", "x", 0), record("/r/a.rs", "y", 1)],
            )
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
    }
}
