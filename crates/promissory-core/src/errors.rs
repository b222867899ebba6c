//! Error types for the promise kernel.
//!
//! The kernel distinguishes three failure shapes:
//!
//! - User-domain rejections travel inside [`Outcome::Error`](crate::Outcome)
//!   as plain `E` values; they are data, not exceptions.
//! - [`Unfulfilled`] is the boundary error produced when a non-value outcome
//!   is converted into a `Result`.
//! - Library invariant violations (impossible state transitions, a resolved
//!   cell with no stored outcome) are fatal assertions, never `Result`s.
//!
//! All types derive `Serialize` so errors can cross a JSON boundary.

use serde::Serialize;

// -- Unfulfilled --

/// Why a promise did not produce a value.
///
/// Returned by [`Outcome::into_result`](crate::Outcome::into_result) so
/// `Result`-shaped callers see rejection and cancellation as distinct
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize)]
pub enum Unfulfilled<E> {
    /// The promise was rejected with a domain error.
    #[error("the promise was rejected")]
    Rejected(E),

    /// The promise was cancelled before producing a value.
    #[error("the promise was cancelled")]
    Cancelled,
}

impl<E> Unfulfilled<E> {
    /// The domain error, if this is a rejection.
    pub fn rejection(&self) -> Option<&E> {
        match self {
            Self::Rejected(e) => Some(e),
            Self::Cancelled => None,
        }
    }

    /// `true` if the promise was cancelled rather than rejected.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
