//! Protocol error types.

use serde_json::error::Category;
use std::fmt;
use thiserror::Error;

/// Errors that end decoding of a device stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected end of stream with {buffered} bytes of an incomplete record")]
    UnexpectedEof { buffered: usize },

    #[error("expected a JSON object")]
    NotAnObject,

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a decode failure, used for logs and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    /// The bytes are not valid JSON.
    Syntax,
    /// Valid JSON whose shape or field types do not match a record.
    Data,
    /// The stream ended inside a record.
    Eof,
    /// A single record exceeded the configured size limit.
    TooLarge,
    /// Reading from the underlying transport failed.
    Io,
}

impl ProtocolError {
    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            ProtocolError::Json(e) => match e.classify() {
                Category::Syntax => DecodeErrorKind::Syntax,
                Category::Data => DecodeErrorKind::Data,
                Category::Eof => DecodeErrorKind::Eof,
                Category::Io => DecodeErrorKind::Io,
            },
            ProtocolError::NotAnObject => DecodeErrorKind::Data,
            ProtocolError::UnexpectedEof { .. } => DecodeErrorKind::Eof,
            ProtocolError::RecordTooLarge { .. } => DecodeErrorKind::TooLarge,
            ProtocolError::Io(_) => DecodeErrorKind::Io,
        }
    }
}

impl DecodeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeErrorKind::Syntax => "syntax",
            DecodeErrorKind::Data => "data",
            DecodeErrorKind::Eof => "eof",
            DecodeErrorKind::TooLarge => "too_large",
            DecodeErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
