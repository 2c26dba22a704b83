//! confab-providers: Wire-family adapters for confab
//!
//! One [`PayloadAdapter`] implementation per wire family. Each owns its
//! request serialization and the incremental grammar of its stream;
//! decoders are plain state machines fed raw transport bytes, so they
//! work the same against a live subprocess or a test fixture.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod raw;

pub use anthropic::{NativeMessagesAdapter, NativeMessagesDecoder};
pub use gemini::{ContentsPartsAdapter, ContentsPartsDecoder};
pub use openai::{ChatCompletionsAdapter, ChatCompletionsDecoder};
pub use raw::RawDecoder;

use confab_core::{ChatRequest, PayloadAdapter, StreamDecoder, WireKind};

pub fn adapter_for(kind: WireKind) -> &'static dyn PayloadAdapter {
    match kind {
        WireKind::ChatCompletions => &ChatCompletionsAdapter,
        WireKind::NativeMessages => &NativeMessagesAdapter,
        WireKind::ContentsParts => &ContentsPartsAdapter,
    }
}

/// Decoder for one dispatch. Raw-mode requests bypass the family
/// grammar and accumulate the response verbatim.
pub fn decoder_for(kind: WireKind, request: &ChatRequest) -> Box<dyn StreamDecoder> {
    if request.is_raw() {
        Box::new(RawDecoder::new())
    } else {
        adapter_for(kind).decoder()
    }
}

/// Byte offset of the first SSE event boundary (`\n\n`) in `buffer`.
/// Boundaries are scanned at the byte level so a UTF-8 sequence split
/// across two reads never corrupts the event text.
pub(crate) fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_selection() {
        assert_eq!(adapter_for(WireKind::ChatCompletions).family(), "chat-completions");
        assert_eq!(adapter_for(WireKind::NativeMessages).family(), "native-messages");
        assert_eq!(adapter_for(WireKind::ContentsParts).family(), "contents-parts");
    }

    #[test]
    fn test_event_boundary() {
        assert_eq!(find_event_boundary(b"data: x\n\nrest"), Some(7));
        assert_eq!(find_event_boundary(b"data: x\n"), None);
    }
}
