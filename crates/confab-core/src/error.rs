use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed transcript header: {0}")]
    MalformedHeader(String),

    #[error("Document is busy: {document}")]
    BusyConflict { document: String },

    #[error("Failed to start transport: {0}")]
    TransportSpawn(String),

    #[error("Stream produced no content")]
    EmptyStream,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Secret resolution failed: {0}")]
    Secret(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn malformed_header(message: impl Into<String>) -> Self {
        Self::MalformedHeader(message.into())
    }

    pub fn busy(document: impl Into<String>) -> Self {
        Self::BusyConflict {
            document: document.into(),
        }
    }

    pub fn transport_spawn(message: impl Into<String>) -> Self {
        Self::TransportSpawn(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn secret(message: impl Into<String>) -> Self {
        Self::Secret(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Error::BusyConflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::EmptyStream | Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::busy("notes/rust.chat");
        assert!(err.to_string().contains("notes/rust.chat"));
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn test_is_busy() {
        assert!(Error::busy("a.chat").is_busy());
        assert!(!Error::EmptyStream.is_busy());
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::EmptyStream.is_retryable());
        assert!(Error::timeout("query exceeded 120s").is_retryable());
        assert!(!Error::malformed_header("no separator").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
