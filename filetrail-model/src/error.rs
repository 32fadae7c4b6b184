use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug)]
pub enum ModelError {
    /// An algorithm identifier that no supported digest matches.
    UnknownAlgorithm(String),
    /// A digest string that is not `algorithm:hex`.
    InvalidHash(String),
    /// An ignore pattern that failed to compile.
    InvalidPattern { pattern: String, reason: String },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownAlgorithm(name) => {
                write!(f, "unknown hash algorithm: {name}")
            }
            ModelError::InvalidHash(raw) => {
                write!(f, "malformed content hash: {raw}")
            }
            ModelError::InvalidPattern { pattern, reason } => {
                write!(f, "invalid ignore pattern {pattern:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
