//! The write capability of a promise.
//!
//! A [`Resolver`] is the unique settling handle for one promise. It is not
//! `Clone`; the cancel-request pipeline hands out secondary resolvers to
//! handlers, but only the primary resolver cancels the promise when dropped
//! unresolved.
//!
//! # Connections
//!
//! - Wraps the resolution cell from `crate::cell`.
//! - Produced by [`Promise::pending`](crate::Promise::pending) and passed to
//!   [`Promise::new`](crate::Promise::new) bodies.
//! - Received by [`on_request_cancel`](Resolver::on_request_cancel) handlers.

use std::fmt;
use std::sync::Arc;

use log::trace;

use crate::cell::PromiseCell;
use crate::context::Context;
use crate::outcome::Outcome;
use crate::promise::Promise;

/// The settling handle for a promise.
///
/// Every settling method is idempotent: the first effective call decides the
/// outcome and every later call is a silent no-op.
///
/// # Example
///
/// ```rust
/// use promissory_core::{Outcome, Promise};
///
/// let (promise, resolver) = Promise::<i32, String>::pending();
/// resolver.fulfill(42);
/// assert_eq!(promise.result(), Some(Outcome::Value(42)));
/// ```
pub struct Resolver<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    cell: Arc<PromiseCell<V, E>>,
    /// Primary resolvers cancel the cell when dropped unresolved.
    primary: bool,
}

impl<V, E> Resolver<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub(crate) fn primary(cell: Arc<PromiseCell<V, E>>) -> Self {
        Self {
            cell,
            primary: true,
        }
    }

    pub(crate) fn secondary(cell: Arc<PromiseCell<V, E>>) -> Self {
        Self {
            cell,
            primary: false,
        }
    }

    /// A resolver over a fresh, already-cancelled cell. Handed to cancel
    /// handlers that outlive their promise.
    pub(crate) fn detached_cancelled() -> Self {
        Self {
            cell: Arc::new(PromiseCell::settled(Outcome::Cancelled)),
            primary: false,
        }
    }

    /// Fulfill the promise with a value.
    pub fn fulfill(&self, value: V) {
        self.cell.resolve(Outcome::Value(value));
    }

    /// Reject the promise with an error.
    pub fn reject(&self, error: E) {
        self.cell.resolve(Outcome::Error(error));
    }

    /// Cancel the promise.
    pub fn cancel(&self) {
        self.cell.resolve(Outcome::Cancelled);
    }

    /// Settle the promise with an already-built outcome.
    pub fn resolve(&self, outcome: Outcome<V, E>) {
        self.cell.resolve(outcome);
    }

    /// Whether cancellation has been requested (and not since overridden by
    /// a delivered value).
    ///
    /// Bodies poll this to decide whether to keep working; honoring it is
    /// cooperative, never mandatory.
    pub fn has_requested_cancel(&self) -> bool {
        self.cell.has_requested_cancel()
    }

    /// Register a handler that runs on `on` if cancellation is requested.
    ///
    /// If the request already happened the handler is scheduled now (or runs
    /// synchronously when `on` is `Immediate`). If the promise settles
    /// without a cancel request the handler is discarded unrun.
    pub fn on_request_cancel<F>(&self, on: &Context, handler: F)
    where
        F: FnOnce(Resolver<V, E>) + Send + 'static,
    {
        PromiseCell::attach_cancel_handler(&self.cell, on, Box::new(handler));
    }
}

impl<V, E> Resolver<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Adopt the outcome of `source`: when it settles, this promise settles
    /// the same way.
    ///
    /// The resolver moves into the registered observer, so dropping the
    /// source unsettled still cancels this promise. Cancel requests against
    /// this promise flow back to `source`.
    pub fn resolve_with(self, source: &Promise<V, E>) {
        let parent = source.cell_arc().clone();
        parent.add_observer();
        let edge_parent = parent.clone();
        self.cell.set_upstream(Box::new(move || {
            PromiseCell::observer_requested_cancel(&edge_parent);
        }));
        // A cancel request that raced the edge installation must still
        // reach the new source.
        if self.cell.has_requested_cancel() {
            self.cell.fire_upstream();
        }
        let resolver = self;
        parent.attach_callback(Box::new(move |outcome| {
            resolver.resolve(outcome.clone());
        }));
    }
}

impl<V, E> Drop for Resolver<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Dropping the primary resolver unresolved is not an error; the
        // promise just reports cancellation to its observers.
        if self.primary && !self.cell.is_settled() {
            trace!("primary resolver dropped unresolved, cancelling");
            self.cell.resolve(Outcome::Cancelled);
        }
    }
}

impl<V, E> fmt::Debug for Resolver<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("state", &self.cell.state_label())
            .field("primary", &self.primary)
            .finish()
    }
}
