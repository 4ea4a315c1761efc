#![allow(dead_code)]

use async_trait::async_trait;
use context_indexer::{EmbedderFactory, IndexingConfig, PipelineOrchestrator};
use context_llm::{LlmClient, LlmError, Message, MessageStream, StreamChunk};
use context_vector_store::{
    Embedder, EmbeddingConfig, EmbeddingProvider, StubEmbedder, VectorStore, VectorStoreError,
};
use futures_util::{stream, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const AUGMENT_MARKER: &str = "// augmented\n";

/// How a request for one particular file goes wrong.
#[derive(Clone, Copy)]
pub enum Fault {
    /// The request itself is rejected.
    Request,
    /// Some text arrives, then the model hits its output limit.
    CutOff,
}

/// Chat model double. Replies with queued answers first, then echoes the file body of the
/// prompt behind [`AUGMENT_MARKER`].
pub struct ScriptedLlm {
    calls: AtomicUsize,
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    chunk_delay: Option<Duration>,
    max_input_tokens: usize,
    max_output_tokens: usize,
    fault: Option<(String, Fault)>,
}

impl ScriptedLlm {
    pub fn echo() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            replies: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            chunk_delay: None,
            max_input_tokens: 10_000,
            max_output_tokens: 10_000,
            fault: None,
        }
    }

    /// Echoes every file except `relative`, whose request fails the way `fault` says.
    pub fn failing_on(relative: &str, fault: Fault) -> Self {
        Self {
            fault: Some((relative.to_string(), fault)),
            ..Self::echo()
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: usize) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_replies(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let llm = Self::echo();
        llm.replies
            .lock()
            .expect("replies")
            .extend(replies.into_iter().map(Into::into));
        llm
    }

    /// Streams every reply slowly, so a run can be aborted mid-file.
    pub fn slow(chunk_delay: Duration) -> Self {
        Self {
            chunk_delay: Some(chunk_delay),
            ..Self::echo()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts").clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted"
    }

    fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    fn max_output_tokens(&self) -> usize {
        self.max_output_tokens
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn create_message(
        &self,
        _system: &str,
        messages: Vec<Message>,
    ) -> context_llm::Result<MessageStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        self.prompts.lock().expect("prompts").push(prompt.clone());

        let fault = self
            .fault
            .as_ref()
            .filter(|(relative, _)| prompt.contains(&format!("File: {relative}\n")))
            .map(|(_, fault)| *fault);
        match fault {
            Some(Fault::Request) => {
                return Err(LlmError::NetworkError("connection reset".to_string()))
            }
            Some(Fault::CutOff) => {
                let chunks = vec![
                    Ok(StreamChunk::Text(format!("{AUGMENT_MARKER}fn half_of_the_fi"))),
                    Err(LlmError::Truncated("finish_reason=length".to_string())),
                ];
                return Ok(stream::iter(chunks).boxed());
            }
            None => {}
        }

        let reply = self
            .replies
            .lock()
            .expect("replies")
            .pop_front()
            .unwrap_or_else(|| echo_reply(&prompt));

        let chunks: Vec<String> = reply
            .chars()
            .collect::<Vec<_>>()
            .chunks(16)
            .map(|chunk| chunk.iter().collect())
            .collect();
        let delay = self.chunk_delay;
        Ok(stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, LlmError>(StreamChunk::Text(chunk))
            })
            .boxed())
    }
}

fn echo_reply(prompt: &str) -> String {
    let body = prompt
        .split_once("\n\n")
        .map_or(prompt, |(_, rest)| rest)
        .to_string();
    let body = body
        .strip_prefix("File: ")
        .and_then(|rest| rest.split_once("\n\n").map(|(_, body)| body.to_string()))
        .unwrap_or(body);
    format!("{AUGMENT_MARKER}{body}")
}

/// Stub embedder that rejects any batch containing `poison`.
pub struct FailingEmbedder {
    inner: StubEmbedder,
    poison: String,
}

impl FailingEmbedder {
    pub fn new(dimension: usize, poison: &str) -> Self {
        Self {
            inner: StubEmbedder::new(dimension),
            poison: poison.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for FailingEmbedder {
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
        if texts.iter().any(|text| text.contains(&self.poison)) {
            return Err(VectorStoreError::EmbeddingError(
                "provider returned HTTP 500".to_string(),
            ));
        }
        self.inner.embed_documents(texts).await
    }
}

/// Factory that hands out one shared embedder.
pub fn shared_embedder<E: Embedder + 'static>(embedder: &Arc<E>) -> EmbedderFactory {
    let embedder = Arc::clone(embedder);
    Arc::new(
        move |_: &EmbeddingConfig| -> context_vector_store::Result<Arc<dyn Embedder>> {
            Ok(Arc::clone(&embedder) as Arc<dyn Embedder>)
        },
    )
}

pub struct Workspace {
    dir: TempDir,
    root: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().canonicalize().expect("canonical root");
        Self { dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn write(&self, relative: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(&path, contents).expect("write file");
        path
    }

    pub fn remove(&self, relative: &str) {
        std::fs::remove_file(self.path(relative)).expect("remove file");
    }

    pub fn config(&self, context_enabled: bool) -> IndexingConfig {
        let mut config = IndexingConfig::new(&self.root);
        config.context_enabled = context_enabled;
        config.augment_concurrency = 2;
        config
    }

    pub fn shadow(&self, relative: &str) -> PathBuf {
        self.root.join(".context/shadow").join(relative)
    }

    pub fn id(&self, relative: &str) -> String {
        self.path(relative).to_string_lossy().into_owned()
    }

    pub async fn store(&self, config: &IndexingConfig) -> VectorStore {
        VectorStore::load(config.store_path())
            .await
            .expect("load store")
            .expect("store exists")
    }
}

pub fn orchestrator<E: Embedder + 'static>(
    config: IndexingConfig,
    llm: &Arc<ScriptedLlm>,
    embedder: &Arc<E>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        config,
        Arc::clone(llm) as Arc<dyn LlmClient>,
        shared_embedder(embedder),
    )
    .expect("orchestrator")
}
