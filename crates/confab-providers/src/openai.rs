use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use confab_core::{
    ChatRequest, DecodeResult, Error, PayloadAdapter, ProviderConfig, Role, StreamDecoder,
    UsageStats, WireRequest,
};

use crate::find_event_boundary;

const DEFAULT_REASONING_EFFORT: &str = "medium";

/// Chat-completions wire family: OpenAI and every API-compatible
/// server behind the same request shape.
pub struct ChatCompletionsAdapter;

impl PayloadAdapter for ChatCompletionsAdapter {
    fn family(&self) -> &'static str {
        "chat-completions"
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        provider: &ProviderConfig,
        secret: &str,
    ) -> Result<WireRequest, Error> {
        let body = match &request.raw_body {
            Some(raw) => raw.clone(),
            None => serde_json::to_string(&build_body(request, provider))?,
        };

        Ok(WireRequest {
            endpoint: provider.endpoint.clone(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), format!("Bearer {secret}")),
            ],
            body,
        })
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(ChatCompletionsDecoder::new())
    }
}

fn build_body(request: &ChatRequest, provider: &ProviderConfig) -> ChatCompletionsBody {
    let model = &request.model;
    let reasoning = model.is_reasoning();

    let messages: Vec<WireMessage> = request
        .messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .filter(|m| !(reasoning && m.role == Role::System))
        .map(|m| WireMessage {
            role: m.role.to_string(),
            content: m.content.clone(),
        })
        .collect();

    let reasoning_effort = if reasoning && provider.supports_reasoning_effort {
        Some(
            model
                .reasoning_effort
                .clone()
                .unwrap_or_else(|| DEFAULT_REASONING_EFFORT.to_string()),
        )
    } else {
        None
    };

    debug!(
        model = %model.name,
        message_count = messages.len(),
        reasoning,
        "chat-completions request"
    );

    ChatCompletionsBody {
        model: model.name.clone(),
        messages,
        temperature: if reasoning {
            None
        } else {
            model.temperature.map(|t| t.clamp(0.0, 2.0))
        },
        top_p: if reasoning {
            None
        } else {
            model.top_p.map(|p| p.clamp(0.0, 1.0))
        },
        max_tokens: if reasoning { None } else { model.max_tokens },
        reasoning_effort,
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
    }
}

/// Incremental decoder for the `data:`-prefixed SSE stream. Events are
/// burned off the buffer as each `\n\n` boundary completes; a fragment
/// split across reads stays buffered until its event closes.
pub struct ChatCompletionsDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl ChatCompletionsDecoder {
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
            if data == "[DONE]" {
                self.done = true;
                return;
            }
            match serde_json::from_str::<StreamResponse>(data) {
                Ok(response) => {
                    if let Some(error) = response.error {
                        out.error = Some(error.message);
                        continue;
                    }
                    for choice in response.choices {
                        if let Some(content) = choice.delta.content {
                            out.text.push_str(&content);
                        }
                    }
                    if let Some(usage) = response.usage {
                        out.usage = Some(UsageStats::new(
                            usage.prompt_tokens,
                            usage.completion_tokens,
                        ));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed stream fragment");
                }
            }
        }
    }
}

impl Default for ChatCompletionsDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for ChatCompletionsDecoder {
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

// Chat-completions API types

#[derive(Debug, Serialize)]
struct ChatCompletionsBody {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}
