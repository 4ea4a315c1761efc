use crate::error::Result;
use crate::types::{Message, MessageStream, StreamChunk};
use async_trait::async_trait;
use futures_util::StreamExt;

/// Streaming text generator used by the augmentation pipeline and the retrieval agent.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier, used in logs and in the augmentation fingerprint salt.
    fn model(&self) -> &str;

    /// Input budget of the active model in tokens.
    fn max_input_tokens(&self) -> usize;

    /// Longest completion the model may produce in one response.
    fn max_output_tokens(&self) -> usize;

    /// Cheap local check that the client has what it needs to issue requests.
    fn is_configured(&self) -> bool;

    async fn create_message(&self, system: &str, messages: Vec<Message>) -> Result<MessageStream>;
}

/// Drains a stream into a single string, ignoring usage chunks.
pub async fn collect_text(mut stream: MessageStream) -> Result<String> {
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        if let StreamChunk::Text(text) = chunk? {
            out.push_str(&text);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Usage;
    use crate::LlmError;
    use futures_util::stream;

    #[tokio::test]
    async fn collect_text_concatenates_text_and_skips_usage() {
        let chunks: Vec<Result<StreamChunk>> = vec![
            Ok(StreamChunk::Text("hello ".into())),
            Ok(StreamChunk::Usage(Usage {
                input_tokens: 3,
                output_tokens: 2,
            })),
            Ok(StreamChunk::Text("world".into())),
        ];
        let text = collect_text(stream::iter(chunks).boxed()).await.unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn collect_text_surfaces_stream_errors() {
        let chunks: Vec<Result<StreamChunk>> = vec![
            Ok(StreamChunk::Text("partial".into())),
            Err(LlmError::NetworkError("reset".into())),
        ];
        let err = collect_text(stream::iter(chunks).boxed()).await.unwrap_err();
        assert!(matches!(err, LlmError::NetworkError(_)));
    }
}
