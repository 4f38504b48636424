use crate::context::SpfResult;
use thiserror::Error;

/// Control-flow signals raised while evaluating a policy.
///
/// Any of these aborts the remaining mechanisms of the record being
/// evaluated and becomes the terminal result of the evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpfError {
    /// No applicable policy for the domain
    #[error("no SPF policy applies")]
    None,

    #[error("explicit neutral result")]
    Neutral,

    /// Malformed record or macro. Never retried.
    #[error("permanent error: {0}")]
    PermError(String),

    /// Transient infrastructure failure. Callers may retry later.
    #[error("temporary error: {0}")]
    TempError(String),
}

impl SpfError {
    pub fn perm(msg: impl Into<String>) -> Self {
        SpfError::PermError(msg.into())
    }

    pub fn temp(msg: impl Into<String>) -> Self {
        SpfError::TempError(msg.into())
    }

    /// Terminal result reported to the caller for this signal
    pub fn result(&self) -> SpfResult {
        match self {
            SpfError::None => SpfResult::None,
            SpfError::Neutral => SpfResult::Neutral,
            SpfError::PermError(_) => SpfResult::PermError,
            SpfError::TempError(_) => SpfResult::TempError,
        }
    }
}
