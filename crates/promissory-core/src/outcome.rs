//! The tagged result of a promise.
//!
//! Every promise settles into exactly one [`Outcome`]: a value, an error, or
//! cancellation. Cancellation is a first-class third state, not an error
//! variant — combinators and observers distinguish it explicitly.
//!
//! # Connections
//!
//! - Stored inside the resolution cell (`crate::cell`) once settled.
//! - Delivered by reference to every completion observer.
//! - Converted to `Result` at API boundaries via [`Outcome::into_result`]
//!   and [`Unfulfilled`](crate::errors::Unfulfilled).

use serde::{Deserialize, Serialize};

use crate::errors::Unfulfilled;

/// The settled result of a promise.
///
/// `Value` carries the success type `V`, `Error` carries the domain error
/// type `E`, and `Cancelled` carries nothing. The two type parameters are
/// independent; a cancelled outcome is representable for any `V`/`E`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<V, E> {
    /// The promise was fulfilled with a value.
    Value(V),
    /// The promise was rejected with an error.
    Error(E),
    /// The promise was cancelled.
    Cancelled,
}

impl<V, E> Outcome<V, E> {
    /// `true` if this outcome is a fulfilled value.
    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// `true` if this outcome is a rejection.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// `true` if this outcome is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The fulfilled value, if any.
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The rejection error, if any.
    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the outcome, keeping the variant.
    pub fn as_ref(&self) -> Outcome<&V, &E> {
        match self {
            Self::Value(v) => Outcome::Value(v),
            Self::Error(e) => Outcome::Error(e),
            Self::Cancelled => Outcome::Cancelled,
        }
    }

    /// Map the value, passing errors and cancellation through.
    pub fn map<V2, F: FnOnce(V) -> V2>(self, f: F) -> Outcome<V2, E> {
        match self {
            Self::Value(v) => Outcome::Value(f(v)),
            Self::Error(e) => Outcome::Error(e),
            Self::Cancelled => Outcome::Cancelled,
        }
    }

    /// Map the error, passing values and cancellation through.
    pub fn map_error<E2, F: FnOnce(E) -> E2>(self, f: F) -> Outcome<V, E2> {
        match self {
            Self::Value(v) => Outcome::Value(v),
            Self::Error(e) => Outcome::Error(f(e)),
            Self::Cancelled => Outcome::Cancelled,
        }
    }

    /// Convert into a `Result`, folding rejection and cancellation into
    /// [`Unfulfilled`].
    ///
    /// This is the standard boundary conversion for callers that expect
    /// `Result` and treat cancellation as a failure.
    pub fn into_result(self) -> Result<V, Unfulfilled<E>> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Error(e) => Err(Unfulfilled::Rejected(e)),
            Self::Cancelled => Err(Unfulfilled::Cancelled),
        }
    }
}

impl<V, E> From<Result<V, E>> for Outcome<V, E> {
    fn from(result: Result<V, E>) -> Self {
        match result {
            Ok(v) => Self::Value(v),
            Err(e) => Self::Error(e),
        }
    }
}
