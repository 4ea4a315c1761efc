use crate::client::LlmClient;
use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::types::{Message, MessageStream, StreamChunk, Usage};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;

/// Client for any `/chat/completions` endpoint that speaks the OpenAI SSE dialect
/// (OpenAI, Azure-style gateways, Ollama, vLLM, llama.cpp server).
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    config: LlmConfig,
    endpoint: String,
}

impl OpenAiCompatibleClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        Ok(Self {
            http,
            config,
            endpoint,
        })
    }

    fn request_body(&self, system: &str, messages: &[Message]) -> serde_json::Value {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            wire.push(json!({ "role": "system", "content": system }));
        }
        for message in messages {
            wire.push(json!({ "role": message.role, "content": message.content }));
        }
        json!({
            "model": self.config.model,
            "stream": true,
            "stream_options": { "include_usage": true },
            "max_tokens": self.config.max_output_tokens,
            "messages": wire,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    fn max_input_tokens(&self) -> usize {
        self.config.max_input_tokens
    }

    fn max_output_tokens(&self) -> usize {
        self.config.max_output_tokens
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn create_message(&self, system: &str, messages: Vec<Message>) -> Result<MessageStream> {
        if !self.is_configured() {
            return Err(LlmError::NotConfigured(format!(
                "model '{}' at {}",
                self.config.model, self.config.base_url
            )));
        }

        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&self.request_body(system, &messages));
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.bearer_auth(key.trim());
        }

        log::debug!(
            "Requesting streamed completion from {} (model={}, messages={})",
            self.endpoint,
            self.config.model,
            messages.len()
        );
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(LlmError::from_status(status.as_u16(), &body));
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(sse_stream(body))
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<StreamChunk>,
    finished: bool,
}

fn sse_stream(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> MessageStream {
    let state = SseState {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok::<_, LlmError>(chunk), st));
            }
            if st.finished {
                return None;
            }

            let events = match st.body.next().await {
                Some(Ok(bytes)) => st.decoder.push(&bytes),
                Some(Err(err)) => {
                    st.finished = true;
                    return Some((Err(LlmError::from(err)), st));
                }
                None => {
                    st.finished = true;
                    st.decoder.finish()
                }
            };

            for event in events {
                match event {
                    SseEvent::Done => st.finished = true,
                    SseEvent::Data(payload) => match parse_payload(&payload) {
                        Ok(chunks) => st.pending.extend(chunks),
                        Err(err) => {
                            st.finished = true;
                            st.pending.clear();
                            return Some((Err(err), st));
                        }
                    },
                }
            }
        }
    })
    .boxed()
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Line-oriented SSE decoder. Buffers raw bytes so multi-byte characters split across
/// network chunks are decoded intact.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = Self::decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        Self::decode_line(&line).into_iter().collect()
    }

    fn decode_line(line: &[u8]) -> Option<SseEvent> {
        let line = String::from_utf8_lossy(line);
        let payload = line.trim().strip_prefix("data:")?.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == "[DONE]" {
            return Some(SseEvent::Done);
        }
        Some(SseEvent::Data(payload.to_string()))
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: ChatDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn parse_payload(payload: &str) -> Result<Vec<StreamChunk>> {
    let chunk: ChatChunk =
        serde_json::from_str(payload).map_err(|e| LlmError::ParseError(format!("{e}: {payload}")))?;
    let mut out = Vec::new();
    for choice in chunk.choices {
        if choice.finish_reason.as_deref() == Some("length") {
            return Err(LlmError::Truncated("finish_reason=length".to_string()));
        }
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            out.push(StreamChunk::Text(text));
        }
    }
    if let Some(usage) = chunk.usage {
        out.push(StreamChunk::Usage(Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::collect_text;
    use pretty_assertions::assert_eq;

    fn body_of(parts: Vec<&'static [u8]>) -> BoxStream<'static, reqwest::Result<Vec<u8>>> {
        stream::iter(parts.into_iter().map(|p| Ok(p.to_vec()))).boxed()
    }

    #[test]
    fn decoder_handles_split_lines_and_done() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let events = decoder.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".to_string()), SseEvent::Done]
        );
    }

    #[test]
    fn decoder_keeps_multibyte_characters_intact() {
        let mut decoder = SseDecoder::default();
        let line = "data: é\n".as_bytes();
        let (head, tail) = line.split_at(7);
        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.push(tail), vec![SseEvent::Data("é".to_string())]);
    }

    #[tokio::test]
    async fn stream_yields_text_then_usage() {
        let body = body_of(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"fn \"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"main\"}}]}\n\n",
            b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
            b"data: [DONE]\n\n",
        ]);
        let chunks: Vec<StreamChunk> = sse_stream(body)
            .map(|c| c.expect("chunk"))
            .collect()
            .await;
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Text("fn ".into()),
                StreamChunk::Text("main".into()),
                StreamChunk::Usage(Usage {
                    input_tokens: 5,
                    output_tokens: 2
                }),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_an_error() {
        let body = body_of(vec![b"data: {not json}\n\n"]);
        let err = collect_text(sse_stream(body)).await.unwrap_err();
        assert!(matches!(err, LlmError::ParseError(_)));
    }

    #[tokio::test]
    async fn length_stop_is_reported_as_truncation() {
        let body = body_of(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"fn half_of_the_fi\"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}\n\n",
            b"data: [DONE]\n\n",
        ]);
        let err = collect_text(sse_stream(body)).await.unwrap_err();
        assert!(matches!(err, LlmError::Truncated(_)));
    }

    #[tokio::test]
    async fn normal_stop_ends_the_stream() {
        let body = body_of(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"done\"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            b"data: [DONE]\n\n",
        ]);
        assert_eq!(collect_text(sse_stream(body)).await.unwrap(), "done");
    }

    #[test]
    fn request_body_puts_system_prompt_first() {
        let client = OpenAiCompatibleClient::new(LlmConfig::default()).unwrap();
        let body = client.request_body("sys", &[Message::user("hi")]);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["stream"], true);
    }
}
