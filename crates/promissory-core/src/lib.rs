//! promissory-core: Pure Rust kernel for typed, cancellable one-shot
//! promises.
//!
//! A promise eventually holds exactly one of three outcomes: a value `V`,
//! an error `E`, or cancellation. Observers register callbacks that run
//! when it settles; combinators chain promises into pipelines; cancellation
//! flows cooperatively downstream as outcomes and upstream as advisory
//! requests. The resolution engine is lock-free: one atomic state machine
//! and two intrusive callback stacks per promise, no mutex, no awaiting.
//!
//! # Crate Organization
//!
//! - `outcome` — the Value / Error / Cancelled result model
//! - `errors` — boundary error taxonomy
//! - `cell` — the lock-free resolution cell (internal)
//! - `resolver` — the unique write capability of a promise
//! - `promise` — read handles, combinators, cancellation propagation
//! - `token` — invalidation tokens with generation gating
//! - `context` — where observer callbacks run
//! - `testing` — blocking settle helpers for tests
//!
//! # Example
//!
//! ```rust
//! use promissory_core::{Context, Outcome, Promise};
//!
//! let (promise, resolver) = Promise::<i32, String>::pending();
//! let chained = promise
//!     .map(&Context::Immediate, None, |x| x + 1)
//!     .recover(&Context::Immediate, None, |_| 0);
//!
//! resolver.fulfill(41);
//! assert_eq!(chained.result(), Some(Outcome::Value(42)));
//! ```

mod cell;
pub mod context;
pub mod errors;
pub mod outcome;
pub mod promise;
pub mod resolver;
pub mod testing;
pub mod token;

pub use context::{Context, Job, SerialQueue};
pub use errors::Unfulfilled;
pub use outcome::Outcome;
pub use promise::Promise;
pub use resolver::Resolver;
pub use token::InvalidationToken;
