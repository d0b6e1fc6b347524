//! Engine construction errors.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine creation failed: {0}")]
    CreationFailed(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Invalid engine initialization: {0}")]
    InvalidInit(String),

    #[error("Engine panicked: {0}")]
    Panicked(String),

    #[error("Engine already registered for language: {0}")]
    AlreadyRegistered(String),
}
