use crate::error::Error;
use crate::message::UsageStats;
use crate::provider::{ChatRequest, ProviderConfig};

/// A provider-ready request: where to send it, what headers to attach,
/// and the serialized body. The transport layer turns this into a
/// subprocess invocation without inspecting the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl WireRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What a decoder extracted from one slice of transport output.
///
/// `text` is display text to forward (may be empty), `usage` a token
/// snapshot when the provider reported one, `error` a provider-side
/// failure decoded out of the stream body.
#[derive(Debug, Default)]
pub struct DecodeResult {
    pub text: String,
    pub usage: Option<UsageStats>,
    pub error: Option<String>,
}

impl DecodeResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.usage.is_none() && self.error.is_none()
    }

    pub fn absorb(&mut self, other: DecodeResult) {
        self.text.push_str(&other.text);
        if let Some(usage) = other.usage {
            match &mut self.usage {
                Some(current) => current.merge(&usage),
                None => self.usage = Some(usage),
            }
        }
        if self.error.is_none() {
            self.error = other.error;
        }
    }
}

/// Incremental decoder for one stream. Fed raw transport bytes in
/// whatever chunk sizes the pipe delivers; must tolerate fragments that
/// split events, lines, or JSON objects at arbitrary byte positions.
pub trait StreamDecoder: Send {
    fn feed(&mut self, chunk: &[u8]) -> DecodeResult;

    /// Called once after the transport exits. Flushes anything the
    /// decoder was still buffering.
    fn finish(&mut self) -> DecodeResult;
}

/// Serialization strategy for one wire family.
pub trait PayloadAdapter: Send + Sync {
    /// Wire family name, for logs.
    fn family(&self) -> &'static str;

    fn build_request(
        &self,
        request: &ChatRequest,
        provider: &ProviderConfig,
        secret: &str,
    ) -> Result<WireRequest, Error>;

    fn decoder(&self) -> Box<dyn StreamDecoder>;
}
