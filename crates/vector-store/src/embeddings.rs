use crate::error::{Result, VectorStoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LOCAL_CHUNK_SIZE: usize = 1_000;
const HOSTED_CHUNK_SIZE: usize = 4_000;
const DEFAULT_STUB_DIMENSION: usize = 64;
const DEFAULT_BATCH_SIZE: usize = 64;
const MAX_RETRIES: usize = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Deterministic hash-seeded vectors; no network, used offline and in tests.
    Stub,
    /// Any OpenAI-compatible `/embeddings` endpoint.
    OpenAi,
    /// Ollama `/api/embed` on a local host.
    Ollama,
}

impl EmbeddingProvider {
    /// Locally hosted models get smaller chunks; hosted APIs take larger ones.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::Stub | Self::Ollama)
    }

    #[must_use]
    pub const fn default_chunk_size(self) -> usize {
        if self.is_local() {
            LOCAL_CHUNK_SIZE
        } else {
            HOSTED_CHUNK_SIZE
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(Self::Stub),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(VectorStoreError::NotConfigured(format!(
                "unsupported embedding provider '{other}' (expected 'stub', 'openai' or 'ollama')"
            ))),
        }
    }
}

impl Display for EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stub => "stub",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        })
    }
}

/// Provider selection plus provider options. Everything except the credential takes part in
/// the vectorization fingerprint salt, so changing any of it re-embeds the tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub dimension: Option<usize>,
    /// Overrides the provider-class chunk size (characters).
    pub chunk_size: Option<usize>,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Stub,
            model: "stub".to_string(),
            base_url: None,
            api_key: None,
            dimension: None,
            chunk_size: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl EmbeddingConfig {
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
            .filter(|size| *size > 0)
            .unwrap_or_else(|| self.provider.default_chunk_size())
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        if self.model.trim().is_empty() || self.batch_size == 0 {
            return false;
        }
        match self.provider {
            EmbeddingProvider::Stub | EmbeddingProvider::Ollama => true,
            EmbeddingProvider::OpenAi => self
                .api_key
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty()),
        }
    }

    /// Builds a fresh client for one run.
    pub fn build(&self) -> Result<Arc<dyn Embedder>> {
        if !self.is_configured() {
            return Err(VectorStoreError::NotConfigured(format!(
                "provider '{}' model '{}'",
                self.provider, self.model
            )));
        }
        Ok(match self.provider {
            EmbeddingProvider::Stub => Arc::new(StubEmbedder::new(
                self.dimension.unwrap_or(DEFAULT_STUB_DIMENSION),
            )),
            EmbeddingProvider::OpenAi => Arc::new(OpenAiEmbedder::new(self)?),
            EmbeddingProvider::Ollama => Arc::new(OllamaEmbedder::new(self)?),
        })
    }
}

/// Batch vector generator.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn provider(&self) -> EmbeddingProvider;

    fn model(&self) -> &str;

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_documents(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| VectorStoreError::EmbeddingError("Empty embedding result".to_string()))
    }

    /// Issues a minimal request to prove the credentials work.
    async fn validate_credentials(&self) -> bool {
        match self.embed_query("ping").await {
            Ok(vector) => !vector.is_empty(),
            Err(err) => {
                log::warn!("Embedding credential check failed for {}: {err}", self.model());
                false
            }
        }
    }
}

#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Deterministic embedder: each text maps to a fixed pseudo-random unit vector.
pub struct StubEmbedder {
    dimension: usize,
    batch_calls: AtomicUsize,
    embedded_texts: AtomicUsize,
}

impl StubEmbedder {
    #[must_use]
    pub const fn new(dimension: usize) -> Self {
        Self {
            dimension,
            batch_calls: AtomicUsize::new(0),
            embedded_texts: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of `embed_documents` calls served so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::Relaxed)
    }

    pub fn embedded_texts(&self) -> usize {
        self.embedded_texts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    fn provider(&self) -> EmbeddingProvider {
        EmbeddingProvider::Stub
    }

    fn model(&self) -> &str {
        "stub"
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        self.embedded_texts.fetch_add(texts.len(), Ordering::Relaxed);
        Ok(texts
            .iter()
            .map(|text| stub_embed(text, self.dimension))
            .collect())
    }

    async fn validate_credentials(&self) -> bool {
        true
    }
}

fn stub_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut state =
        fnv1a_64(text.as_bytes()) ^ (dimension as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let mut vec = Vec::with_capacity(dimension);
    for _ in 0..dimension {
        let bits = splitmix64(&mut state);
        let high = (bits >> 32) as u32;
        let mantissa = high >> 9;
        let unit = f32::from_bits(0x3f80_0000 | mantissa) - 1.0;
        vec.push(unit.mul_add(2.0, -1.0));
    }
    normalize(&mut vec);
    vec
}

fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vec.iter_mut() {
            *value /= norm;
        }
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

const fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?)
}

fn retry_backoff(attempt: usize) -> Duration {
    let shift = u32::try_from(attempt.min(6)).unwrap_or(6);
    Duration::from_millis(250u64.saturating_mul(1u64 << shift))
}

fn should_retry(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

#[derive(Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingEntry>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for OpenAI-compatible `/embeddings` endpoints.
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    dimensions: Option<usize>,
    batch_size: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| VectorStoreError::NotConfigured("missing OpenAI API key".into()))?
            .to_string();
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        Ok(Self {
            http: http_client()?,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            dimensions: config.dimension,
            batch_size: config.batch_size.max(1),
        })
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0usize;
        loop {
            let request = OpenAiEmbeddingRequest {
                model: &self.model,
                input: inputs,
                dimensions: self.dimensions,
            };
            let response = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let mut parsed: OpenAiEmbeddingResponse = resp.json().await?;
                    parsed.data.sort_by_key(|entry| entry.index);
                    if parsed.data.len() != inputs.len() {
                        return Err(VectorStoreError::EmbeddingError(format!(
                            "OpenAI returned {} embeddings for {} inputs",
                            parsed.data.len(),
                            inputs.len()
                        )));
                    }
                    return Ok(parsed.data.into_iter().map(|e| e.embedding).collect());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < MAX_RETRIES {
                        attempt += 1;
                        log::warn!("Embedding request returned {status}; retry {attempt}");
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(VectorStoreError::EmbeddingError(format!(
                        "OpenAI embeddings request failed ({status}): {body}"
                    )));
                }
                Err(err) => {
                    if (err.is_timeout() || err.is_connect()) && attempt + 1 < MAX_RETRIES {
                        attempt += 1;
                        log::warn!("Embedding request failed: {err}; retry {attempt}");
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn provider(&self) -> EmbeddingProvider {
        EmbeddingProvider::OpenAi
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for a local Ollama server (`/api/embed`).
pub struct OllamaEmbedder {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    batch_size: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or("http://localhost:11434");
        Ok(Self {
            http: http_client()?,
            endpoint: format!("{}/api/embed", base_url.trim_end_matches('/')),
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn provider(&self) -> EmbeddingProvider {
        EmbeddingProvider::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let response = self
                .http
                .post(&self.endpoint)
                .json(&OllamaEmbedRequest {
                    model: &self.model,
                    input: batch,
                })
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(VectorStoreError::EmbeddingError(format!(
                    "Ollama embed request failed ({status}): {body}"
                )));
            }
            let parsed: OllamaEmbedResponse = response.json().await?;
            if parsed.embeddings.len() != batch.len() {
                return Err(VectorStoreError::EmbeddingError(format!(
                    "Ollama returned {} embeddings for {} inputs",
                    parsed.embeddings.len(),
                    batch.len()
                )));
            }
            out.extend(parsed.embeddings);
        }
        Ok(out)
    }
}
