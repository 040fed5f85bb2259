//! Error types for the protocol model

use thiserror::Error;

/// Protocol-level error types
#[derive(Debug, Clone, Error)]
pub enum ProtoError {
    #[error("invalid signature {signature:?}: {reason}")]
    InvalidSignature { signature: String, reason: String },

    #[error("signature mismatch: expected {expected}, got {found}")]
    SignatureMismatch { expected: String, found: String },

    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("invalid object path: {0:?}")]
    InvalidPath(String),

    #[error("invalid match rule: {0:?}")]
    InvalidMatchRule(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl ProtoError {
    pub(crate) fn signature(signature: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSignature {
            signature: signature.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::SignatureMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
