//! # Context Indexer
//!
//! Incremental indexing of a project for LLM-assisted retrieval.
//!
//! ## Pipeline
//!
//! ```text
//! Project root
//!     │
//!     ├──> File Scanner (.gitignore aware)
//!     │      └─> Candidate files
//!     │
//!     ├──> Context augmentation (optional, streamed LLM rewrite)
//!     │      └─> .context/shadow/<path>         + .context/context.repo.hash
//!     │
//!     ├──> Vectorization (chunk + embed, per-file fingerprints)
//!     │      └─> .context/vectors/<namespace>/store.json
//!     │
//!     └──> Retrieval agent (vector search + LLM file selection)
//! ```
//!
//! Both phases skip files whose salted fingerprint is unchanged, so a second run over an
//! unchanged tree makes no model calls.
//!
//! ## Example
//!
//! ```no_run
//! use context_indexer::{configured_embedders, IndexingConfig, PipelineOrchestrator, RunRequest};
//! use context_llm::OpenAiCompatibleClient;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IndexingConfig::load("/path/to/project").await?;
//!     let llm = Arc::new(OpenAiCompatibleClient::new(config.llm.clone())?);
//!     let orchestrator = PipelineOrchestrator::new(config, llm, configured_embedders())?;
//!
//!     if let Some(summary) = orchestrator.run(RunRequest::full()).await? {
//!         println!("Indexed in {} ms", summary.time_ms);
//!     }
//!     Ok(())
//! }
//! ```

mod augment;
mod chunker;
mod config;
mod error;
mod hasher;
mod limits;
mod orchestrator;
mod progress;
mod repo_hash;
mod retrieval;
mod scanner;
mod stats;
mod vectorize;
mod watcher;
mod work_queue;

pub use augment::AugmentationPipeline;
pub use chunker::chunk_text;
pub use config::{IndexingConfig, RetrievalConfig, CONFIG_FILE_NAME, DEFAULT_MAX_FILE_SIZE_BYTES};
pub use error::{IndexerError, Result};
pub use hasher::{fingerprint, ContentFingerprint, FingerprintSalt};
pub use limits::{
    clamp_concurrency, CONCURRENCY_ENV, DEFAULT_AUGMENT_CONCURRENCY, MAX_AUGMENT_CONCURRENCY,
};
pub use orchestrator::{
    configured_embedders, EmbedderFactory, PipelineOrchestrator, RunHandle, RunRequest,
    StartOutcome,
};
pub use progress::{
    HostEvent, Phase, PhaseEvent, PhaseEventKind, PipelineState, ProgressReporter,
    ProgressState, ProgressTracker,
};
pub use repo_hash::RepoHash;
pub use retrieval::{parse_path_array, RetrievalAgent};
pub use scanner::{looks_binary, CandidateFile, FileScanner, ScanOptions};
pub use stats::{PhaseStats, RunSummary};
pub use vectorize::VectorizationPipeline;
pub use watcher::{ChangeWatcher, FilesChanged, WatcherConfig};
pub use work_queue::{QueueReport, QueueRun, WorkOutcome, WorkQueue};
