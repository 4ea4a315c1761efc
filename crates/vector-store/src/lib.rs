//! # Context Vector Store
//!
//! Embedding-indexed record store used by the vectorization pipeline and the retrieval agent.
//!
//! ## Features
//!
//! - **Delete-by-source** semantics: every chunk of a file shares the file path as its id
//! - **Exact cosine search** over a flat in-memory index
//! - **Persistent storage** with atomic JSON writes
//! - **Pluggable embedders** (deterministic stub, OpenAI-compatible, Ollama)
//!
//! ## Architecture
//!
//! ```text
//! VectorRecord[] (id = source path, one per chunk)
//!     │
//!     ├──> Embedder (stub / openai / ollama)
//!     │      └─> Vector[dim]
//!     │
//!     ├──> Flat index
//!     │      └─> Cosine top-k
//!     │
//!     └──> store.json
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use context_vector_store::{EmbeddingConfig, VectorStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EmbeddingConfig::default();
//!     let embedder = config.build()?;
//!     let Some(store) = VectorStore::load("store.json").await? else {
//!         return Ok(());
//!     };
//!
//!     for hit in store.search(embedder.as_ref(), "retry with backoff", 5).await? {
//!         println!("{}: {:.3}", hit.record.id, hit.score);
//!     }
//!     Ok(())
//! }
//! ```

mod embeddings;
mod error;
mod flat_index;
mod paths;
mod store;
mod types;

pub use embeddings::{
    cosine_similarity, Embedder, EmbeddingConfig, EmbeddingProvider, OllamaEmbedder,
    OpenAiEmbedder, StubEmbedder,
};
pub use error::{Result, VectorStoreError};
pub use paths::{
    context_dir_for_project_root, repo_hash_path_for_project_root,
    shadow_dir_for_project_root, vector_store_path, vectors_dir_for_project_root,
    CONTEXT_DIR_NAME, REPO_HASH_FILE_NAME, SHADOW_DIR_NAME, STORE_FILE_NAME,
};
pub use store::{EmbeddingSignature, VectorStore, DEFAULT_MAX_RECORDS, STORE_SCHEMA_VERSION};
pub use types::{RecordMetadata, SearchResult, VectorRecord};
