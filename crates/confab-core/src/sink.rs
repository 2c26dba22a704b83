use crate::error::Error;

/// Mutation seam for the document a conversation lives in. Streaming
/// answers land through this without the engine knowing whether the
/// other side is a file, an editor buffer, or a test fixture.
///
/// Lines are addressed by zero-based index; ranges are inclusive on
/// both ends, matching transcript spans.
pub trait DocumentSink: Send {
    /// Total number of lines in the document.
    fn line_count(&self) -> usize;

    /// Lines in the inclusive range `start..=end`, without trailing
    /// newlines.
    fn read_lines(&self, start: usize, end: usize) -> Result<Vec<String>, Error>;

    /// Insert `lines` so the first one lands at index `line`, shifting
    /// everything from there downward. `line == line_count()` appends at
    /// the end of the document.
    fn append_at(&mut self, line: usize, lines: &[String]) -> Result<(), Error>;

    /// Replace the inclusive range `start..=end` with `lines`. The
    /// replacement may be shorter or longer than the range it covers.
    fn replace_span(&mut self, start: usize, end: usize, lines: &[String]) -> Result<(), Error>;
}

/// Resolves the API secret for a named provider. Implementations may
/// read config, environment, or an external command; the engine only
/// ever sees the final string.
#[async_trait::async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, provider: &str) -> Result<String, Error>;
}
