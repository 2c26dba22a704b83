use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use confab_core::{
    ChatRequest, DecodeResult, Error, PayloadAdapter, ProviderConfig, Role, StreamDecoder,
    UsageStats, WireRequest,
};

/// Contents-parts wire family. The model name and API key travel in the
/// endpoint URL, and the response streams as one JSON array of objects
/// rather than SSE frames.
pub struct ContentsPartsAdapter;

impl PayloadAdapter for ContentsPartsAdapter {
    fn family(&self) -> &'static str {
        "contents-parts"
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        provider: &ProviderConfig,
        secret: &str,
    ) -> Result<WireRequest, Error> {
        let endpoint = provider
            .endpoint
            .replace("{model}", &request.model.name)
            .replace("{key}", secret);

        let body = match &request.raw_body {
            Some(raw) => raw.clone(),
            None => serde_json::to_string(&build_body(request))?,
        };

        Ok(WireRequest {
            endpoint,
            headers: vec![(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )],
            body,
        })
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(ContentsPartsDecoder::new())
    }
}

fn build_body(request: &ChatRequest) -> GeminiBody {
    let model = &request.model;

    // No separate system channel in this format; system text becomes a
    // leading user turn.
    let contents: Vec<GeminiContent> = request
        .messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| GeminiContent {
            role: match m.role {
                Role::Assistant => Some("model".to_string()),
                Role::System | Role::User | Role::Tool => Some("user".to_string()),
            },
            parts: vec![GeminiPart {
                text: m.content.clone(),
            }],
        })
        .collect();

    let contents = merge_adjacent_contents(contents);

    let generation_config = if model.temperature.is_some()
        || model.top_p.is_some()
        || model.max_tokens.is_some()
    {
        Some(GenerationConfig {
            temperature: model.temperature.map(|t| t.clamp(0.0, 2.0)),
            top_p: model.top_p.map(|p| p.clamp(0.0, 1.0)),
            max_output_tokens: model.max_tokens,
        })
    } else {
        None
    };

    debug!(
        model = %model.name,
        content_count = contents.len(),
        "contents-parts request"
    );

    GeminiBody {
        contents,
        generation_config,
    }
}

/// Adjacent turns with the same role merge by extending the parts list,
/// which the wire format requires.
fn merge_adjacent_contents(contents: Vec<GeminiContent>) -> Vec<GeminiContent> {
    let mut merged: Vec<GeminiContent> = Vec::new();

    for content in contents {
        if let Some(last) = merged.last_mut() {
            if last.role == content.role {
                last.parts.extend(content.parts);
                continue;
            }
        }
        merged.push(content);
    }

    merged
}

/// Decoder for the streamed JSON array. Objects arrive incrementally and
/// may split at any byte, so the scanner tracks brace depth and string
/// state instead of waiting for the array to close.
pub struct ContentsPartsDecoder {
    buffer: Vec<u8>,
    scan: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    start: Option<usize>,
}

impl ContentsPartsDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            scan: 0,
            depth: 0,
            in_string: false,
            escaped: false,
            start: None,
        }
    }

    fn decode_object(&self, object: &str, out: &mut DecodeResult) {
        let parsed: StreamObject = match serde_json::from_str(object) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "skipping malformed stream fragment");
                return;
            }
        };

        if let Some(candidates) = parsed.candidates {
            for candidate in candidates {
                let parts = candidate.content.and_then(|c| c.parts).unwrap_or_default();
                for part in parts {
                    if let Some(text) = part.text {
                        out.text.push_str(&text);
                    }
                }
            }
        }

        if let Some(meta) = parsed.usage_metadata {
            let usage = UsageStats::new(
                meta.prompt_token_count.unwrap_or(0),
                meta.candidates_token_count.unwrap_or(0),
            );
            match &mut out.usage {
                Some(current) => current.merge(&usage),
                None => out.usage = Some(usage),
            }
        }

        if let Some(error) = parsed.error {
            out.error = Some(error.message);
        }
    }
}

impl Default for ContentsPartsDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for ContentsPartsDecoder {
    fn feed(&mut self, chunk: &[u8]) -> DecodeResult {
        let mut out = DecodeResult::default();
        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        let mut i = self.scan;
        while i < self.buffer.len() {
            let byte = self.buffer[i];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
            } else {
                match byte {
                    b'"' if self.depth > 0 => self.in_string = true,
                    b'{' => {
                        if self.depth == 0 {
                            self.start = Some(i);
                        }
                        self.depth += 1;
                    }
                    b'}' if self.depth > 0 => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            if let Some(start) = self.start.take() {
                                let object = String::from_utf8_lossy(&self.buffer[start..=i])
                                    .into_owned();
                                self.decode_object(&object, &mut out);
                            }
                            consumed = i + 1;
                        }
                    }
                    // array punctuation and whitespace between objects
                    _ => {}
                }
            }
            i += 1;
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
            self.start = self.start.map(|s| s - consumed);
        }
        self.scan = self.buffer.len();

        out
    }

    fn finish(&mut self) -> DecodeResult {
        if self.start.is_some() {
            warn!("stream ended inside an unterminated object");
        }
        self.buffer.clear();
        self.scan = 0;
        self.start = None;
        DecodeResult::default()
    }
}

// Gemini API types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiBody {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamObject {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Option<Vec<CandidatePart>>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}
