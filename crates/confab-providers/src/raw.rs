use confab_core::{DecodeResult, StreamDecoder};

/// Decoder for raw passthrough requests. The response is not interpreted
/// as a stream at all; bytes accumulate and come back as one fenced block
/// so the reply lands in the document verbatim.
pub struct RawDecoder {
    buffer: Vec<u8>,
}

impl RawDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Default for RawDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for RawDecoder {
    fn feed(&mut self, chunk: &[u8]) -> DecodeResult {
        self.buffer.extend_from_slice(chunk);
        DecodeResult::default()
    }

    fn finish(&mut self) -> DecodeResult {
        if self.buffer.is_empty() {
            return DecodeResult::default();
        }
        let body = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        DecodeResult {
            text: format!("```\n{}\n```", body.trim_end()),
            usage: None,
            error: None,
        }
    }
}
