//! Error taxonomy for sipvine.
//!
//! Each layer gets its own `thiserror`-derived enum rather than one
//! grab-bag type, so callers can match on exactly the failures their
//! layer can produce. The engine never lets any of these escape to the
//! transport: every error is converted into an optional response plus
//! an audit event (see `engine::SipEngine::ingest`).

use thiserror::Error;

/// Failures from `message::SipMessage::parse` / `serialize`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed start line: {0}")]
    MalformedStartLine(String),

    #[error("malformed header at line {line}: {text}")]
    MalformedHeader { line: usize, text: String },

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("header value contains a bare CR or LF: {0:?}")]
    HeaderInjection(String),
}

/// Failures from `registry::UserRegistry`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid extension {0:?}: must match ^[0-9]{{3,}}$")]
    InvalidExtension(String),

    #[error("address pool exhausted")]
    AddressPoolExhausted,
}

/// Failures from `dialog::DialogStore`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialogError {
    #[error("illegal dialog transition for {call_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        call_id: String,
        from: crate::dialog::DialogState,
        to: crate::dialog::DialogState,
    },

    #[error("unknown call-id: {0}")]
    UnknownCallId(String),

    #[error("dialog {0} already exists")]
    AlreadyExists(String),
}

/// Top-level engine failures that are fatal enough to report upward
/// instead of converting into a response/audit pair (startup-time
/// configuration problems, for instance).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dialog(#[from] DialogError),
}
