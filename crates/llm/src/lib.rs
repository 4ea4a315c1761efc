//! # Context LLM
//!
//! Streaming completion client consumed by the context pipelines.
//!
//! ## Contract
//!
//! ```text
//! create_message(system, messages)
//!     │
//!     └──> MessageStream
//!            ├─> StreamChunk::Text   (incremental output)
//!            └─> StreamChunk::Usage  (token accounting)
//! ```
//!
//! Dropping a [`MessageStream`] before it is exhausted closes the underlying HTTP body, so
//! callers may stop consuming at any point (e.g. on cancellation) without leaking the request.
//!
//! ## Example
//!
//! ```no_run
//! use context_llm::{collect_text, LlmClient, LlmConfig, Message, OpenAiCompatibleClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OpenAiCompatibleClient::new(LlmConfig::default())?;
//!     let stream = client
//!         .create_message("You are terse.", vec![Message::user("Say hi")])
//!         .await?;
//!     println!("{}", collect_text(stream).await?);
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod openai;
mod tokens;
mod types;

pub use client::{collect_text, LlmClient};
pub use config::LlmConfig;
pub use error::{LlmError, Result};
pub use openai::OpenAiCompatibleClient;
pub use tokens::estimate_tokens;
pub use types::{Message, MessageStream, Role, StreamChunk, Usage};
