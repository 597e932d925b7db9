use std::error::Error;
use std::fmt;
use std::io;

/// Errors raised while turning wire or on-disk bytes into chunk data.
/// A decode error is always fatal to that single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    EmptyPayload,
    InvalidBase64 { token: String },
    InvalidToken { token: String, position: usize },
    InvalidRepeat { token: String },
    UnknownReference { index: usize, position: usize },
    WrongLength { len: usize },
    Truncated { len: usize, needed: usize },
    BadMagic,
    UnsupportedVersion(u16),
    UnknownKind(u8),
    Compression(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::EmptyPayload => write!(f, "empty chunk data string"),
            DecodeError::InvalidBase64 { token } => write!(f, "invalid base64 token: {}", token),
            DecodeError::InvalidToken { token, position } => {
                write!(f, "unexpected token {:?} at position {}", token, position)
            }
            DecodeError::InvalidRepeat { token } => write!(f, "invalid repeat count in {:?}", token),
            DecodeError::UnknownReference { index, position } => write!(
                f,
                "reference to unknown index {} at position {}",
                index, position
            ),
            DecodeError::WrongLength { len } => {
                write!(f, "decoded chunk length {} != 256", len)
            }
            DecodeError::Truncated { len, needed } => {
                write!(f, "buffer of {} bytes is too small, need {}", len, needed)
            }
            DecodeError::BadMagic => write!(f, "invalid magic"),
            DecodeError::UnsupportedVersion(version) => {
                write!(f, "unsupported version {}", version)
            }
            DecodeError::UnknownKind(kind) => write!(f, "unknown record kind {}", kind),
            DecodeError::Compression(msg) => write!(f, "compression error: {}", msg),
        }
    }
}

impl Error for DecodeError {}

/// Errors delivered to every result handle of a failed generation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    Worker(String),
    Accelerator(String),
    Cancelled,
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::Worker(msg) => write!(f, "worker failed: {}", msg),
            GenerationError::Accelerator(msg) => write!(f, "accelerator failed: {}", msg),
            GenerationError::Cancelled => write!(f, "generation cancelled"),
        }
    }
}

impl Error for GenerationError {}

#[derive(Debug)]
pub enum StrataError {
    Io(io::Error),
    Decode(DecodeError),
    Generation(GenerationError),
    Storage(String),
    Protocol(String),
    Config(String),
    NotFound(String),
}

impl fmt::Display for StrataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrataError::Io(err) => write!(f, "IO error: {}", err),
            StrataError::Decode(err) => write!(f, "Decode error: {}", err),
            StrataError::Generation(err) => write!(f, "Generation error: {}", err),
            StrataError::Storage(msg) => write!(f, "Storage error: {}", msg),
            StrataError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            StrataError::Config(msg) => write!(f, "Config error: {}", msg),
            StrataError::NotFound(what) => write!(f, "Not found: {}", what),
        }
    }
}

impl Error for StrataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StrataError::Io(err) => Some(err),
            StrataError::Decode(err) => Some(err),
            StrataError::Generation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StrataError {
    fn from(err: io::Error) -> Self {
        StrataError::Io(err)
    }
}

impl From<DecodeError> for StrataError {
    fn from(err: DecodeError) -> Self {
        StrataError::Decode(err)
    }
}

impl From<GenerationError> for StrataError {
    fn from(err: GenerationError) -> Self {
        StrataError::Generation(err)
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Protocol(err.to_string())
    }
}
