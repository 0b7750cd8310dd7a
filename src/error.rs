//! Library error type.
//!
//! Mirrors the error-kind taxonomy from the design: transient errors are the
//! only ones retry loops ever see twice, and `InvariantViolation` /
//! `Configuration` are meant to fail loudly at the call site instead of being
//! retried.

use thiserror::Error;

/// Structured metadata extracted from a fatal session event, mirroring the
/// fields a Postgres driver error typically carries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorMeta {
    pub code: Option<String>,
    pub sqlstate: Option<String>,
    pub errno: Option<String>,
    pub syscall: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub severity: Option<String>,
    pub routine: Option<String>,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure (reset, timeout, refused, ...). Retryable.
    #[error("transient transport error: {message}")]
    TransientTransport { message: String, meta: ErrorMeta },

    /// SQLSTATE class 08, 57Pxx, or 53300. Retryable.
    #[error("transient database error ({sqlstate}): {message}")]
    TransientDatabase {
        sqlstate: String,
        message: String,
        meta: ErrorMeta,
    },

    /// Anything else the driver reported (syntax errors, integrity
    /// violations, serialization failures). Never retried.
    #[error("permanent database error: {message}")]
    Permanent { message: String, meta: ErrorMeta },

    /// A configuration value was missing or out of range.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An internal invariant (e.g. the 63-byte label budget) would have been
    /// violated. This is a bug, not a runtime condition, and is never
    /// retried or swallowed.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The underlying driver reported something outside the taxonomy above;
    /// carried through so callers can still inspect the original message.
    #[error("driver error: {0}")]
    Driver(String),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientTransport { .. } | Error::TransientDatabase { .. }
        )
    }

    pub fn meta(&self) -> Option<&ErrorMeta> {
        match self {
            Error::TransientTransport { meta, .. }
            | Error::TransientDatabase { meta, .. }
            | Error::Permanent { meta, .. } => Some(meta),
            _ => None,
        }
    }
}
