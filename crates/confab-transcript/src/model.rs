use std::collections::HashMap;

use confab_core::{Error, ModelDescriptor, Result};

/// A parsed header value. Numeric-looking values are coerced, `true`
/// and `false` become booleans, and values that look like JSON are
/// kept structured.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Json(serde_json::Value),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        match self {
            HeaderValue::Integer(n) if *n >= 0 => Some(*n as usize),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// One physical metadata line (summary or reasoning), recorded with its
/// position so it can be rewritten in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub index: usize,
    pub text: String,
}

/// A file inclusion directive found in a question span. The parser
/// records the directive; resolving the path to content is the
/// caller's job.
#[derive(Debug, Clone, PartialEq)]
pub struct FileReference {
    pub raw_directive: String,
    pub path: String,
    pub line: usize,
    pub resolved_content: Option<String>,
}

/// A contiguous run of document lines belonging to one question or
/// answer. `content` is the exact source text of `start_line..=end_line`
/// and is what in-place edits must reproduce; `text` is the same run
/// with directive, local, and metadata lines removed, and is what the
/// context builder sends.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub text: String,
    pub file_references: Vec<FileReference>,
}

impl TextSpan {
    /// A span with no content, anchored where content would begin.
    pub fn empty(anchor: usize) -> Self {
        Self {
            start_line: anchor,
            end_line: anchor,
            content: String::new(),
            text: String::new(),
            file_references: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn contains_line(&self, line: usize) -> bool {
        !self.is_empty() && self.start_line <= line && line <= self.end_line
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub question: TextSpan,
    pub answer: Option<TextSpan>,
    pub summary: Option<Line>,
    pub reasoning: Option<Line>,
}

impl Exchange {
    pub fn has_file_references(&self) -> bool {
        !self.question.file_references.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeComponent {
    Question,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transcript {
    pub headers: HashMap<String, HeaderValue>,
    pub exchanges: Vec<Exchange>,
}

impl Transcript {
    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn topic(&self) -> Option<&str> {
        self.header("topic").and_then(|v| v.as_str())
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.header("provider").and_then(|v| v.as_str())
    }

    /// The `model` header, either a bare name or a structured record.
    pub fn model_descriptor(&self) -> Result<Option<ModelDescriptor>> {
        match self.header("model") {
            None => Ok(None),
            Some(HeaderValue::Text(name)) => Ok(Some(ModelDescriptor::Named(name.clone()))),
            Some(HeaderValue::Json(value)) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| Error::malformed_header(format!("bad model header: {e}"))),
            Some(other) => Err(Error::malformed_header(format!(
                "bad model header: {other:?}"
            ))),
        }
    }

    /// Per-document override for how many trailing exchanges stay
    /// unsummarized.
    pub fn max_full_exchanges_override(&self) -> Option<usize> {
        self.header("config_max_full_exchanges")
            .and_then(|v| v.as_usize())
    }

    pub fn web_search_override(&self) -> Option<bool> {
        self.header("config_web_search").and_then(|v| v.as_bool())
    }

    /// First exchange whose question or answer span contains `line`.
    /// Linear scan; transcripts are short enough that nothing faster
    /// is warranted.
    pub fn exchange_at_line(&self, line: usize) -> Option<(usize, ExchangeComponent)> {
        for (index, exchange) in self.exchanges.iter().enumerate() {
            if exchange.question.contains_line(line) {
                return Some((index, ExchangeComponent::Question));
            }
            if let Some(answer) = &exchange.answer {
                if answer.contains_line(line) {
                    return Some((index, ExchangeComponent::Answer));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value_coercions() {
        assert_eq!(HeaderValue::Integer(3).as_usize(), Some(3));
        assert_eq!(HeaderValue::Integer(-1).as_usize(), None);
        assert_eq!(HeaderValue::Bool(true).as_bool(), Some(true));
        assert_eq!(HeaderValue::Text("x".into()).as_str(), Some("x"));
    }

    #[test]
    fn test_model_descriptor_from_json_header() {
        let mut transcript = Transcript::default();
        transcript.headers.insert(
            "model".to_string(),
            HeaderValue::Json(serde_json::json!({"name": "o3", "reasoning_effort": "high"})),
        );
        let desc = transcript.model_descriptor().unwrap().unwrap();
        let params = desc.normalize();
        assert_eq!(params.name, "o3");
        assert_eq!(params.reasoning_effort.as_deref(), Some("high"));
    }

    #[test]
    fn test_empty_span_contains_nothing() {
        let span = TextSpan::empty(4);
        assert!(!span.contains_line(4));
    }
}
