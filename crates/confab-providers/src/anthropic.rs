use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use confab_core::{
    ChatRequest, DecodeResult, Error, PayloadAdapter, ProviderConfig, Role, StreamDecoder,
    UsageStats, WireRequest,
};

use crate::find_event_boundary;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;
const BETA_PROMPT_CACHING: &str = "prompt-caching-2024-07-31";
const BETA_WEB_SEARCH: &str = "web-search-2025-03-05";
const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";

/// Native messages wire family: system prompt as a block array separate
/// from the turn list, typed stream events.
pub struct NativeMessagesAdapter;

impl PayloadAdapter for NativeMessagesAdapter {
    fn family(&self) -> &'static str {
        "native-messages"
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        provider: &ProviderConfig,
        secret: &str,
    ) -> Result<WireRequest, Error> {
        let with_tools = request.web_search;
        let body = match &request.raw_body {
            Some(raw) => raw.clone(),
            None => serde_json::to_string(&build_body(request, provider))?,
        };

        // The beta header advertises the caching feature set; attaching
        // server-side tools switches it to the tool feature set as well.
        let beta = if with_tools {
            format!("{BETA_WEB_SEARCH},{BETA_PROMPT_CACHING}")
        } else {
            BETA_PROMPT_CACHING.to_string()
        };

        Ok(WireRequest {
            endpoint: provider.endpoint.clone(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("x-api-key".to_string(), secret.to_string()),
                ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
                ("anthropic-beta".to_string(), beta),
            ],
            body,
        })
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(NativeMessagesDecoder::new())
    }
}

fn build_body(request: &ChatRequest, provider: &ProviderConfig) -> AnthropicBody {
    let model = &request.model;

    let mut system_blocks: Vec<SystemBlock> = Vec::new();
    let mut messages: Vec<AnthropicMessage> = Vec::new();

    for message in &request.messages {
        if message.content.trim().is_empty() {
            continue;
        }
        match message.role {
            Role::System => system_blocks.push(SystemBlock {
                block_type: "text".to_string(),
                text: message.content.clone(),
                cache_control: message.cache_hint.then(|| CacheControl {
                    control_type: "ephemeral".to_string(),
                }),
            }),
            Role::Assistant => messages.push(AnthropicMessage {
                role: "assistant".to_string(),
                content: message.content.clone(),
            }),
            Role::User | Role::Tool => messages.push(AnthropicMessage {
                role: "user".to_string(),
                content: message.content.clone(),
            }),
        }
    }

    let messages = merge_adjacent_messages(messages);

    let tools = request.web_search.then(|| {
        vec![ToolDeclaration {
            tool_type: WEB_SEARCH_TOOL_TYPE.to_string(),
            name: "web_search".to_string(),
        }]
    });

    debug!(
        model = %model.name,
        message_count = messages.len(),
        system_blocks = system_blocks.len(),
        has_tools = tools.is_some(),
        "native-messages request"
    );

    AnthropicBody {
        model: model.name.clone(),
        max_tokens: model
            .max_tokens
            .or(provider.default_max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system_blocks.is_empty() {
            None
        } else {
            Some(system_blocks)
        },
        messages,
        temperature: model.temperature.map(|t| t.clamp(0.0, 1.0)),
        top_p: model.top_p.map(|p| p.clamp(0.0, 1.0)),
        stream: true,
        tools,
    }
}

/// The wire format rejects adjacent turns with the same role, so runs
/// collapse into one message.
fn merge_adjacent_messages(messages: Vec<AnthropicMessage>) -> Vec<AnthropicMessage> {
    let mut merged: Vec<AnthropicMessage> = Vec::new();

    for msg in messages {
        if let Some(last) = merged.last_mut() {
            if last.role == msg.role {
                last.content.push_str("\n\n");
                last.content.push_str(&msg.content);
                continue;
            }
        }
        merged.push(msg);
    }

    merged
}

/// Decoder for the typed event stream. Every event's data payload
/// carries a `type` tag, which is what the decoder keys on; the `event:`
/// framing lines are redundant and ignored.
pub struct NativeMessagesDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl NativeMessagesDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            done: false,
        }
    }

    fn decode_event(&mut self, event: &str, out: &mut DecodeResult) {
        for line in event.lines() {
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let parsed: StreamEvent = match serde_json::from_str(data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "skipping malformed stream fragment");
                    continue;
                }
            };
            match parsed.event_type.as_str() {
                "message_start" => {
                    if let Some(input) = parsed
                        .message
                        .and_then(|m| m.usage)
                        .and_then(|u| u.input_tokens)
                    {
                        push_usage(out, UsageStats::new(input, 0));
                    }
                }
                "content_block_start" => {
                    if let Some(block) = parsed.content_block {
                        if block.block_type == "text" {
                            if let Some(text) = block.text {
                                out.text.push_str(&text);
                            }
                        }
                    }
                }
                "content_block_delta" => {
                    if let Some(delta) = parsed.delta {
                        if delta.delta_type.as_deref() == Some("text_delta") {
                            if let Some(text) = delta.text {
                                out.text.push_str(&text);
                            }
                        }
                    }
                }
                "message_delta" => {
                    if let Some(output) = parsed.usage.and_then(|u| u.output_tokens) {
                        push_usage(out, UsageStats::new(0, output));
                    }
                    if let Some(reason) = parsed.delta.and_then(|d| d.stop_reason) {
                        debug!(stop_reason = %reason, "stream finishing");
                    }
                }
                "message_stop" => {
                    self.done = true;
                    return;
                }
                "error" => {
                    if let Some(error) = parsed.error {
                        out.error = Some(error.message);
                    }
                }
                // ping and anything newer
                _ => {}
            }
        }
    }
}

impl Default for NativeMessagesDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for NativeMessagesDecoder {
    fn feed(&mut self, chunk: &[u8]) -> DecodeResult {
        let mut out = DecodeResult::default();
        if self.done {
            return out;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(boundary) = find_event_boundary(&self.buffer) {
            let event = String::from_utf8_lossy(&self.buffer[..boundary]).into_owned();
            self.buffer.drain(..boundary + 2);
            self.decode_event(&event, &mut out);
            if self.done {
                break;
            }
        }

        out
    }

    fn finish(&mut self) -> DecodeResult {
        let mut out = DecodeResult::default();
        if self.done || self.buffer.is_empty() {
            return out;
        }
        let event = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        self.decode_event(&event, &mut out);
        out
    }
}

fn push_usage(out: &mut DecodeResult, usage: UsageStats) {
    match &mut out.usage {
        Some(current) => current.merge(&usage),
        None => out.usage = Some(usage),
    }
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct AnthropicBody {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock>>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclaration>>,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    control_type: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ToolDeclaration {
    #[serde(rename = "type")]
    tool_type: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    message: Option<MessageStart>,
    content_block: Option<ContentBlock>,
    delta: Option<EventDelta>,
    usage: Option<OutputUsage>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: Option<InputUsage>,
}

#[derive(Debug, Deserialize)]
struct InputUsage {
    input_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OutputUsage {
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::{Message, ModelParams, WireKind};

    fn provider() -> ProviderConfig {
        ProviderConfig::new("anthropic", WireKind::NativeMessages)
    }

    fn body_json(request: &ChatRequest, provider: &ProviderConfig) -> serde_json::Value {
        let wire = NativeMessagesAdapter
            .build_request(request, provider, "sk-ant-test")
            .unwrap();
        serde_json::from_str(&wire.body).unwrap()
    }

    #[test]
    fn test_build_request_headers() {
        let request = ChatRequest::new(vec![Message::user("hi")], ModelParams::new("claude-sonnet-4"));
        let wire = NativeMessagesAdapter
            .build_request(&request, &provider(), "sk-ant-test")
            .unwrap();
        assert_eq!(wire.header("x-api-key"), Some("sk-ant-test"));
        assert_eq!(wire.header("anthropic-version"), Some(ANTHROPIC_VERSION));
        assert_eq!(wire.header("anthropic-beta"), Some(BETA_PROMPT_CACHING));
    }

    #[test]
    fn test_beta_header_switches_with_tools() {
        let request = ChatRequest::new(vec![Message::user("hi")], ModelParams::new("claude-sonnet-4"))
            .with_web_search(true);
        let wire = NativeMessagesAdapter
            .build_request(&request, &provider(), "sk-ant-test")
            .unwrap();
        let beta = wire.header("anthropic-beta").unwrap();
        assert!(beta.contains(BETA_WEB_SEARCH));
        assert!(beta.contains(BETA_PROMPT_CACHING));
    }

    #[test]
    fn test_system_blocks_extracted_with_cache_control() {
        let request = ChatRequest::new(
            vec![
                Message::system("You are terse."),
                Message::system("<notes.md>\nfile body").with_cache_hint(),
                Message::user("hi"),
            ],
            ModelParams::new("claude-sonnet-4"),
        );
        let body = body_json(&request, &provider());

        let system = body["system"].as_array().unwrap();
        assert_eq!(system.len(), 2);
        assert_eq!(system[0]["type"], "text");
        assert!(system[0].get("cache_control").is_none());
        assert_eq!(system[1]["cache_control"]["type"], "ephemeral");

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn test_merge_adjacent_messages() {
        let messages = vec![
            AnthropicMessage {
                role: "user".to_string(),
                content: "one".to_string(),
            },
            AnthropicMessage {
                role: "user".to_string(),
                content: "two".to_string(),
            },
            AnthropicMessage {
                role: "assistant".to_string(),
                content: "reply".to_string(),
            },
        ];
        let merged = merge_adjacent_messages(messages);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content, "one\n\ntwo");
        assert_eq!(merged[1].role, "assistant");
    }

    #[test]
    fn test_max_tokens_defaults() {
        let request = ChatRequest::new(vec![Message::user("hi")], ModelParams::new("claude-sonnet-4"));
        let body = body_json(&request, &provider());
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);

        let cfg = provider().with_default_max_tokens(2048);
        let body = body_json(&request, &cfg);
        assert_eq!(body["max_tokens"], 2048);

        let request = ChatRequest::new(
            vec![Message::user("hi")],
            ModelParams::new("claude-sonnet-4").with_max_tokens(512),
        );
        let body = body_json(&request, &cfg);
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn test_temperature_clamped_to_unit_range() {
        let request = ChatRequest::new(
            vec![Message::user("hi")],
            ModelParams::new("claude-sonnet-4").with_temperature(1.8),
        );
        let body = body_json(&request, &provider());
        assert_eq!(body["temperature"], 1.0);
    }

    #[test]
    fn test_web_search_tool_attached() {
        let request = ChatRequest::new(vec![Message::user("hi")], ModelParams::new("claude-sonnet-4"))
            .with_web_search(true);
        let body = body_json(&request, &provider());
        assert_eq!(body["tools"][0]["type"], WEB_SEARCH_TOOL_TYPE);
        assert_eq!(body["tools"][0]["name"], "web_search");
    }

    #[test]
    fn test_decode_typed_event_stream() {
        let mut decoder = NativeMessagesDecoder::new();
        let stream = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":9}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"content_block\":{\"type\":\"text\",\"text\":\"Hi\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
        );
        let out = decoder.feed(stream.as_bytes());
        assert_eq!(out.text, "Hi there");
        assert_eq!(out.usage.unwrap().prompt_tokens, 9);
    }

    #[test]
    fn test_decode_usage_accumulates_across_events() {
        let mut decoder = NativeMessagesDecoder::new();
        let start = decoder.feed(
            b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":7}}}\n\n",
        );
        let end = decoder.feed(
            b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":21}}\n\n",
        );
        let mut total = start.usage.unwrap();
        total.merge(&end.usage.unwrap());
        assert_eq!(total.prompt_tokens, 7);
        assert_eq!(total.completion_tokens, 21);
    }

    #[test]
    fn test_decode_split_event() {
        let mut decoder = NativeMessagesDecoder::new();
        let first = decoder.feed(b"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"te");
        assert_eq!(first.text, "");
        let second = decoder.feed(b"xt\":\"whole\"}}\n\n");
        assert_eq!(second.text, "whole");
    }

    #[test]
    fn test_decode_error_event() {
        let mut decoder = NativeMessagesDecoder::new();
        let out = decoder.feed(
            b"data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        );
        assert_eq!(out.error.as_deref(), Some("Overloaded"));
    }

    #[test]
    fn test_decode_stop_latches() {
        let mut decoder = NativeMessagesDecoder::new();
        decoder.feed(b"data: {\"type\":\"message_stop\"}\n\n");
        let late = decoder.feed(
            b"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"x\"}}\n\n",
        );
        assert_eq!(late.text, "");
    }

    #[test]
    fn test_decode_ping_ignored() {
        let mut decoder = NativeMessagesDecoder::new();
        let out = decoder.feed(b"event: ping\ndata: {\"type\":\"ping\"}\n\n");
        assert!(out.is_empty());
    }
}
