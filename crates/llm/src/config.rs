use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Connection settings for an OpenAI-compatible chat completions endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Input budget; files estimated above it are not sent to the model.
    pub max_input_tokens: usize,
    /// Output cap sent with every request. Longer completions are reported as truncated.
    pub max_output_tokens: usize,
    /// Connect timeout and the longest silence tolerated between streamed chunks.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            max_input_tokens: 100_000,
            max_output_tokens: 16_384,
            timeout_secs: 300,
        }
    }
}

impl LlmConfig {
    /// Local endpoints (Ollama, llama.cpp, vLLM on loopback) do not need a key.
    #[must_use]
    pub fn is_local(&self) -> bool {
        let url = self.base_url.to_ascii_lowercase();
        url.contains("://localhost") || url.contains("://127.0.0.1") || url.contains("://[::1]")
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        let has_key = self
            .api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        !self.model.trim().is_empty()
            && !self.base_url.trim().is_empty()
            && self.max_input_tokens > 0
            && (has_key || self.is_local())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_endpoint_requires_key() {
        let mut cfg = LlmConfig::default();
        assert!(!cfg.is_configured());
        cfg.api_key = Some("  ".into());
        assert!(!cfg.is_configured());
        cfg.api_key = Some("sk-test".into());
        assert!(cfg.is_configured());
    }

    #[test]
    fn local_endpoint_works_without_key() {
        let cfg = LlmConfig {
            base_url: "http://localhost:11434/v1".into(),
            ..LlmConfig::default()
        };
        assert!(cfg.is_configured());
    }
}
