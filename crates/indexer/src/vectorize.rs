//! Vectorization: keeps the vector store of the active namespace in sync with the tree being
//! indexed (the shadow mirror when augmentation is on, the sources otherwise).
//!
//! Records are keyed by the absolute path of the *source* file in both modes, so retrieval
//! always answers with real project paths.

use crate::chunker::chunk_text;
use crate::config::IndexingConfig;
use crate::error::{IndexerError, Result};
use crate::hasher::{fingerprint, FingerprintSalt};
use crate::progress::{Phase, PipelineState, ProgressReporter, StateCell};
use crate::scanner::{CandidateFile, FileScanner, ScanOptions};
use crate::stats::PhaseStats;
use async_trait::async_trait;
use context_vector_store::{
    Embedder, EmbeddingConfig, EmbeddingProvider, EmbeddingSignature, RecordMetadata,
    VectorRecord, VectorStore, VectorStoreError,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const PHASE_TAG: &str = "vectorization";

#[derive(Serialize)]
struct VectorizationSalt<'a> {
    embedding: &'a EmbeddingConfig,
    chunk_size: usize,
    context_enabled: bool,
}

struct EmbedJob {
    id: String,
    path: PathBuf,
}

/// Feeds the embedder one batch at a time and refuses the next batch once the run is
/// cancelled. A refused file keeps its previous records.
struct CancellableEmbedder<'a> {
    inner: &'a dyn Embedder,
    cancel: &'a CancellationToken,
    batch_size: usize,
}

#[async_trait]
impl Embedder for CancellableEmbedder<'_> {
    fn provider(&self) -> EmbeddingProvider {
        self.inner.provider()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn embed_documents(
        &self,
        texts: &[String],
    ) -> context_vector_store::Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            if self.cancel.is_cancelled() {
                return Err(VectorStoreError::Other("cancelled".to_string()));
            }
            vectors.extend(self.inner.embed_documents(batch).await?);
        }
        Ok(vectors)
    }
}

pub struct VectorizationPipeline {
    root: PathBuf,
    source_root: PathBuf,
    store_path: PathBuf,
    scanner: FileScanner,
    embedder: Arc<dyn Embedder>,
    embedding: EmbeddingConfig,
    context_enabled: bool,
    max_records: usize,
    cancel: CancellationToken,
    progress: ProgressReporter,
    state: StateCell,
}

impl VectorizationPipeline {
    pub fn new(
        config: &IndexingConfig,
        embedder: Arc<dyn Embedder>,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Result<Self> {
        let source_root = config.vectorization_root();
        let options = if config.context_enabled {
            ScanOptions::for_shadow(config)
        } else {
            ScanOptions::for_sources(config)
        };
        Ok(Self {
            root: config.root.clone(),
            scanner: FileScanner::new(&source_root, options)?,
            source_root,
            store_path: config.store_path(),
            embedder,
            embedding: config.embedding.clone(),
            context_enabled: config.context_enabled,
            max_records: config.max_store_records,
            cancel,
            progress,
            state: StateCell::default(),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Synchronises the store with the tree. `scope` holds source paths (files or
    /// directories, absolute or relative to the project root).
    ///
    /// Embedding failures abort the run with an error; records of files processed before the
    /// failure stay persisted.
    pub async fn run(&self, scope: Option<&[PathBuf]>) -> Result<PhaseStats> {
        self.state.set(Phase::Vectorization, PipelineState::Starting);
        self.progress.start().await;

        let result = self.execute(scope).await;
        match &result {
            Ok(stats) => log::info!(
                "Vectorization: {} files embedded ({} chunks), {} unchanged, {} removed, {} failed{}",
                stats.processed,
                stats.chunks,
                stats.skipped,
                stats.deleted,
                stats.errors.len(),
                if stats.aborted { " (aborted)" } else { "" }
            ),
            Err(err) => {
                log::error!("Vectorization failed: {err}");
                self.progress
                    .error(format!("vectorization failed: {err}"))
                    .await;
            }
        }

        self.progress.done().await;
        self.state.set(Phase::Vectorization, PipelineState::Idle);
        result
    }

    async fn execute(&self, scope: Option<&[PathBuf]>) -> Result<PhaseStats> {
        let mut stats = PhaseStats::default();
        let mut store = self.open_store().await;
        let stored = store.source_fingerprints();

        let candidates = self.resolve(scope).await?;
        let live: BTreeMap<String, CandidateFile> = candidates
            .into_iter()
            .filter_map(|candidate| Some((self.source_id(&candidate.path)?, candidate)))
            .collect();

        let mut deletions: Vec<String> = stored
            .keys()
            .filter(|id| self.in_scope(Path::new(id.as_str()), scope) && !live.contains_key(*id))
            .cloned()
            .collect();

        stats.total = live.len();
        self.progress.total(stats.total).await;
        self.state.set(Phase::Vectorization, PipelineState::Running);

        let salt = self.salt()?;
        let mut jobs = Vec::new();
        for (id, candidate) in live {
            if self.cancel.is_cancelled() {
                break;
            }
            if candidate.is_binary {
                if stored.contains_key(&id) {
                    deletions.push(id);
                }
                stats.skipped += 1;
                continue;
            }
            let bytes = match tokio::fs::read(&candidate.path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    stats.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if bytes.iter().all(u8::is_ascii_whitespace) {
                if stored.contains_key(&id) {
                    deletions.push(id);
                }
                stats.skipped += 1;
                continue;
            }
            let fingerprint = fingerprint(&bytes, &salt);
            if stored.get(&id).map(String::as_str) == Some(fingerprint.as_str()) {
                stats.skipped += 1;
                continue;
            }
            jobs.push(EmbedJob {
                id,
                path: candidate.path,
            });
        }
        self.progress.advance(stats.skipped).await;

        if !deletions.is_empty() {
            stats.deleted = deletions.len();
            let removed = store.delete(&deletions);
            log::debug!("Removed {removed} records of {} files", deletions.len());
            store.save(&self.store_path).await?;
        }

        for job in jobs {
            if self.cancel.is_cancelled() {
                break;
            }
            self.embed_file(&mut store, &salt, job, &mut stats).await?;
        }

        store.save(&self.store_path).await?;

        if self.cancel.is_cancelled() {
            self.state.set(Phase::Vectorization, PipelineState::Aborting);
            stats.aborted = true;
        } else {
            self.state.set(Phase::Vectorization, PipelineState::Completing);
        }
        Ok(stats)
    }

    async fn embed_file(
        &self,
        store: &mut VectorStore,
        salt: &FingerprintSalt,
        job: EmbedJob,
        stats: &mut PhaseStats,
    ) -> Result<()> {
        let bytes = tokio::fs::read(&job.path).await?;
        let fingerprint = fingerprint(&bytes, salt);
        let text = String::from_utf8_lossy(&bytes);
        let file_name = Path::new(&job.id)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let records: Vec<VectorRecord> = chunk_text(&text, self.embedding.chunk_size())
            .into_iter()
            .enumerate()
            .map(|(chunk_index, text)| VectorRecord {
                id: job.id.clone(),
                text,
                metadata: RecordMetadata {
                    source: job.id.clone(),
                    file_name: file_name.clone(),
                    fingerprint: fingerprint.as_str().to_string(),
                    chunk_index,
                },
            })
            .collect();

        let embedder = CancellableEmbedder {
            inner: self.embedder.as_ref(),
            cancel: &self.cancel,
            batch_size: self.embedding.batch_size,
        };
        match store.replace_source(&embedder, &job.id, records).await {
            Ok(chunks) => {
                store.save(&self.store_path).await?;
                stats.processed += 1;
                stats.chunks += chunks;
                self.progress.advance(1).await;
                Ok(())
            }
            Err(_) if self.cancel.is_cancelled() => {
                log::debug!("Stopped embedding {} on cancellation", job.id);
                Ok(())
            }
            Err(err @ VectorStoreError::CapacityExceeded { .. }) => {
                // The previous records of this file stay; the next run retries it.
                log::warn!("Not indexing {}: {err}", job.id);
                let message = format!("{}: {err}", job.id);
                stats.add_error(message.clone());
                self.progress.error(message).await;
                self.progress.advance(1).await;
                Ok(())
            }
            Err(err) => Err(IndexerError::Other(format!(
                "embedding {} failed: {err}",
                job.id
            ))),
        }
    }

    /// Loads the namespace store. A missing, unreadable or foreign-model store is replaced by
    /// an empty one, which makes the run re-embed everything.
    async fn open_store(&self) -> VectorStore {
        let signature = EmbeddingSignature::from(&self.embedding);
        let store = match VectorStore::load(&self.store_path).await {
            Ok(Some(store)) if store.signature() == &signature => store,
            Ok(Some(store)) => {
                log::info!(
                    "Embedding model changed ({}/{} -> {}/{}); rebuilding {}",
                    store.signature().provider,
                    store.signature().model,
                    signature.provider,
                    signature.model,
                    self.store_path.display()
                );
                VectorStore::new(signature)
            }
            Ok(None) => VectorStore::new(signature),
            Err(err) => {
                log::warn!(
                    "Discarding unreadable store {}: {err}",
                    self.store_path.display()
                );
                VectorStore::new(signature)
            }
        };
        store.with_max_records(self.max_records)
    }

    async fn resolve(&self, scope: Option<&[PathBuf]>) -> Result<Vec<CandidateFile>> {
        if !tokio::fs::try_exists(&self.source_root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let scanner = self.scanner.clone();
        let scope: Option<Vec<PathBuf>> = scope.map(|paths| {
            paths
                .iter()
                .filter_map(|path| self.to_source_tree(path))
                .collect()
        });
        tokio::task::spawn_blocking(move || match scope {
            Some(paths) => scanner.filter_paths(&paths),
            None => scanner.scan(),
        })
        .await
        .map_err(|err| IndexerError::Other(format!("file scan failed: {err}")))
    }

    fn salt(&self) -> Result<FingerprintSalt> {
        FingerprintSalt::new(
            PHASE_TAG,
            &VectorizationSalt {
                embedding: &self.embedding,
                chunk_size: self.embedding.chunk_size(),
                context_enabled: self.context_enabled,
            },
        )
    }

    /// Maps a path of the indexed tree to the id of its source file.
    fn source_id(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.source_root).ok()?;
        Some(self.root.join(relative).to_string_lossy().into_owned())
    }

    /// Maps a project path to its counterpart in the indexed tree.
    fn to_source_tree(&self, path: &Path) -> Option<PathBuf> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let relative = absolute.strip_prefix(&self.root).ok()?;
        Some(self.source_root.join(relative))
    }

    fn in_scope(&self, id: &Path, scope: Option<&[PathBuf]>) -> bool {
        scope.map_or(true, |paths| {
            paths.iter().any(|path| {
                let absolute = if path.is_absolute() {
                    path.clone()
                } else {
                    self.root.join(path)
                };
                id.starts_with(absolute)
            })
        })
    }
}
