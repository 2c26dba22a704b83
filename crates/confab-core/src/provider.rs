use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::model::ModelParams;

/// The wire family a provider speaks. Everything else about a provider
/// (endpoint, secret, defaults) is configuration; the family decides
/// request shape and stream grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireKind {
    #[serde(alias = "openai")]
    ChatCompletions,
    #[serde(alias = "anthropic")]
    NativeMessages,
    #[serde(alias = "gemini")]
    ContentsParts,
}

impl std::fmt::Display for WireKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireKind::ChatCompletions => write!(f, "chat-completions"),
            WireKind::NativeMessages => write!(f, "native-messages"),
            WireKind::ContentsParts => write!(f, "contents-parts"),
        }
    }
}

impl WireKind {
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            WireKind::ChatCompletions => "https://api.openai.com/v1/chat/completions",
            WireKind::NativeMessages => "https://api.anthropic.com/v1/messages",
            WireKind::ContentsParts => {
                "https://generativelanguage.googleapis.com/v1beta/models/{model}:streamGenerateContent?key={key}"
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: WireKind,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_max_tokens: Option<u32>,
    #[serde(default)]
    pub supports_reasoning_effort: bool,
    #[serde(default)]
    pub web_search: bool,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: WireKind) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoint: kind.default_endpoint().to_string(),
            default_max_tokens: None,
            supports_reasoning_effort: false,
            web_search: false,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_default_max_tokens(mut self, max_tokens: u32) -> Self {
        self.default_max_tokens = Some(max_tokens);
        self
    }

    pub fn with_reasoning_effort_support(mut self) -> Self {
        self.supports_reasoning_effort = true;
        self
    }

    pub fn with_web_search(mut self) -> Self {
        self.web_search = true;
        self
    }
}

/// A fully-resolved request: the message list from the context builder
/// plus the normalized model parameters. `raw_body` bypasses message
/// serialization entirely and ships the given text as the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: ModelParams,
    #[serde(default)]
    pub web_search: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>, model: ModelParams) -> Self {
        Self {
            messages,
            model,
            web_search: false,
            raw_body: None,
        }
    }

    pub fn with_web_search(mut self, web_search: bool) -> Self {
        self.web_search = web_search;
        self
    }

    pub fn with_raw_body(mut self, body: impl Into<String>) -> Self {
        self.raw_body = Some(body.into());
        self
    }

    pub fn is_raw(&self) -> bool {
        self.raw_body.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_kind_aliases() {
        let kind: WireKind = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(kind, WireKind::ChatCompletions);
        let kind: WireKind = serde_json::from_str("\"native-messages\"").unwrap();
        assert_eq!(kind, WireKind::NativeMessages);
        let kind: WireKind = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(kind, WireKind::ContentsParts);
    }

    #[test]
    fn test_default_endpoints() {
        let cfg = ProviderConfig::new("anthropic", WireKind::NativeMessages);
        assert!(cfg.endpoint.contains("api.anthropic.com"));
        let cfg = ProviderConfig::new("gemini", WireKind::ContentsParts);
        assert!(cfg.endpoint.contains("{model}"));
        assert!(cfg.endpoint.contains("{key}"));
    }

    #[test]
    fn test_raw_request() {
        let req = ChatRequest::new(Vec::new(), ModelParams::new("gpt-4o"))
            .with_raw_body("{\"model\": \"gpt-4o\"}");
        assert!(req.is_raw());
    }
}
