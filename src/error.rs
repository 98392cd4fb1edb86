//! # Error Types
//!
//! Typed failures surfaced by the routing core.
//!
//! | Type | Raised by | Meaning |
//! |------|-----------|---------|
//! | [`QueryError`] | [`PeerNetwork`](crate::protocols::PeerNetwork) | A single peer query failed |
//! | [`ValidationError`] | [`ipns`](crate::ipns) | A name record was rejected |
//! | [`DhtError`] | lookups, adapter | Operation-level outcome |
//!
//! Per-peer [`QueryError`]s are absorbed inside iterative lookups and only
//! surface in aggregate. [`ValidationError`]s are always passed through to the
//! caller unchanged.

use thiserror::Error;

use crate::clock::Timestamp;

/// Failure of one query to one peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The peer did not answer within the caller-supplied timeout.
    #[error("peer query timed out")]
    Timeout,
    /// Transport-level failure (no route, connection refused, reset).
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    /// The peer answered with something that could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Reasons a name record is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("name record signature is invalid")]
    SignatureInvalid,
    #[error("name does not match the record's public key")]
    NameMismatch,
    #[error("name record expired at {deadline} (now {now})")]
    Expired { deadline: Timestamp, now: Timestamp },
    #[error("malformed name record: {0}")]
    Malformed(String),
    /// Rejected by a remote routing endpoint; the detail is its message.
    #[error("rejected by remote: {0}")]
    Remote(String),
}

/// Operation-level error for lookups and the protocol adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DhtError {
    /// The lookup was exhausted and nothing was discovered.
    #[error("not found")]
    NotFound,
    /// The operation deadline elapsed before an answer was produced.
    #[error("operation timed out")]
    Timeout,
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("malformed: {0}")]
    Malformed(String),
    /// The caller aborted the operation.
    #[error("cancelled")]
    Cancelled,
    /// Local invariant violation; fatal to the operation that saw it.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<QueryError> for DhtError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Timeout => DhtError::Timeout,
            QueryError::Unreachable(reason) => DhtError::Unreachable(reason),
            QueryError::Malformed(reason) => DhtError::Malformed(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_errors_map_to_distinct_kinds() {
        assert_eq!(DhtError::from(QueryError::Timeout), DhtError::Timeout);
        assert_eq!(
            DhtError::from(QueryError::Unreachable("refused".into())),
            DhtError::Unreachable("refused".into())
        );
        assert_ne!(DhtError::from(QueryError::Timeout), DhtError::NotFound);
    }

    #[test]
    fn validation_errors_pass_through_verbatim() {
        let err: DhtError = ValidationError::SignatureInvalid.into();
        assert_eq!(err, DhtError::Validation(ValidationError::SignatureInvalid));
        assert_eq!(err.to_string(), "name record signature is invalid");
    }
}
