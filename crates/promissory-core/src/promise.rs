//! The read handle of a promise and its combinator surface.
//!
//! A [`Promise`] shares one resolution cell with its producer and with every
//! other handle cloned from it. Chaining a combinator allocates a fresh
//! child cell, registers one completion observer on the parent that maps
//! the parent's outcome into a settlement of the child, and returns a
//! promise over the child.
//!
//! # Combinator Semantics
//!
//! Given the parent outcome and a user function `f`:
//!
//! | Combinator        | Value(v)             | Error(e)             | Cancelled       |
//! |-------------------|----------------------|----------------------|-----------------|
//! | `map`             | Value(f(v))          | Error(e)             | Cancelled       |
//! | `flat_map`        | piped from f(v)      | Error(e)             | Cancelled       |
//! | `catch`           | Value(v)             | runs f; Error(e)     | Cancelled       |
//! | `recover`         | Value(v)             | Value(f(e))          | Cancelled       |
//! | `map_error`       | Value(v)             | Error(f(e))          | Cancelled       |
//! | `flat_map_error`  | Value(v)             | piped from f(e)      | Cancelled       |
//! | `always`          | runs f; passes through                                        |
//! | `map_result`      | f(outcome)                                                    |
//! | `flat_map_result` | piped from f(outcome)                                         |
//! | `on_cancel`       | Value(v)             | Error(e)             | runs f; Cancelled |
//! | `tap`             | runs f; passes through, outside cancel accounting             |
//!
//! # Cancellation Propagation
//!
//! Each combinator registers as a *propagating observer* of its parent and
//! the child keeps a one-shot upstream edge back to it. When a promise
//! receives a cancel request it notifies its upstream edge; the parent
//! decrements its remaining-observer count and, when the last observer has
//! asked for cancellation and no external handle keeps the parent alive,
//! requests cancellation of itself in turn. [`Promise::tap`] stays outside
//! this accounting, [`Promise::ignoring_cancel`] severs it, and
//! [`Promise::propagating_cancellation`] propagates even while externally
//! held.
//!
//! # Connections
//!
//! - Observer scheduling honors the registered [`Context`] and the
//!   registration-time `NowOr` collapse.
//! - An [`InvalidationToken`] generation snapshot gates every registered
//!   user function at dispatch time.

use std::fmt;
use std::sync::Arc;

use crate::cell::PromiseCell;
use crate::context::Context;
use crate::outcome::Outcome;
use crate::resolver::Resolver;
use crate::token::{InvalidationToken, TokenGate};

/// A read handle to an eventually-settled outcome.
///
/// Cloning is cheap and shares the underlying cell. When the last handle to
/// an unobserved promise goes away, cancellation is requested automatically
/// (the producer may still deliver; the request is advisory).
///
/// # Example
///
/// ```rust
/// use promissory_core::{Context, Outcome, Promise};
///
/// let (promise, resolver) = Promise::<i32, String>::pending();
/// let doubled = promise.map(&Context::Immediate, None, |x| x * 2);
/// resolver.fulfill(21);
/// assert_eq!(doubled.result(), Some(Outcome::Value(42)));
/// ```
#[must_use]
pub struct Promise<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    cell: Arc<PromiseCell<V, E>>,
}

impl<V, E> Promise<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    // -- Constructors --

    /// A pending promise and its resolver.
    pub fn pending() -> (Self, Resolver<V, E>) {
        let cell = Arc::new(PromiseCell::new(false, false));
        (Self::from_cell(cell.clone()), Resolver::primary(cell))
    }

    /// A promise that is already fulfilled.
    pub fn fulfilled(value: V) -> Self {
        Self::from_cell(Arc::new(PromiseCell::settled(Outcome::Value(value))))
    }

    /// A promise that is already rejected.
    pub fn rejected(error: E) -> Self {
        Self::from_cell(Arc::new(PromiseCell::settled(Outcome::Error(error))))
    }

    /// A promise that is already cancelled.
    pub fn cancelled() -> Self {
        Self::from_cell(Arc::new(PromiseCell::settled(Outcome::Cancelled)))
    }

    /// Run `body` on `on` with the resolver for a fresh promise.
    ///
    /// A body that drops its resolver without settling cancels the promise;
    /// a body that panics on an asynchronous context does the same, since
    /// unwinding drops the resolver.
    pub fn new<F>(on: &Context, body: F) -> Self
    where
        F: FnOnce(Resolver<V, E>) + Send + 'static,
    {
        let (promise, resolver) = Self::pending();
        on.execute(Box::new(move || body(resolver)));
        promise
    }

    pub(crate) fn from_cell(cell: Arc<PromiseCell<V, E>>) -> Self {
        cell.retain_handle();
        Self { cell }
    }

    pub(crate) fn cell_arc(&self) -> &Arc<PromiseCell<V, E>> {
        &self.cell
    }

    // -- Queries --

    /// Whether the promise has settled (resolved or cancelled).
    pub fn is_resolved(&self) -> bool {
        self.cell.is_settled()
    }

    // -- Lifecycle --

    /// Request cancellation. Advisory: registered cancel handlers run and
    /// the request propagates upstream, but the producer may still deliver
    /// a value.
    pub fn request_cancel(&self) {
        PromiseCell::request_cancel(&self.cell);
    }

    /// Request cancellation of this promise whenever `token` is
    /// invalidated.
    pub fn request_cancel_on_invalidate(&self, token: &InvalidationToken) {
        token.request_cancel_on_invalidate(self);
    }

    // -- Child construction --

    /// A child cell wired as a propagating observer of this promise.
    fn propagating_child<V2, E2>(&self) -> (Promise<V2, E2>, Resolver<V2, E2>)
    where
        V2: Send + Sync + 'static,
        E2: Send + Sync + 'static,
    {
        let cell = Arc::new(PromiseCell::new(false, false));
        self.cell.add_observer();
        let parent = self.cell.clone();
        cell.set_upstream(Box::new(move || {
            PromiseCell::observer_requested_cancel(&parent);
        }));
        (Promise::from_cell(cell.clone()), Resolver::primary(cell))
    }

    /// A child cell outside the cancel accounting entirely.
    fn detached_child(&self) -> (Promise<V, E>, Resolver<V, E>) {
        let cell = Arc::new(PromiseCell::new(false, false));
        (Promise::from_cell(cell.clone()), Resolver::primary(cell))
    }
}

impl<V, E> Promise<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// The settled outcome, or `None` while pending.
    pub fn result(&self) -> Option<Outcome<V, E>> {
        self.cell.settled_outcome()
    }

    /// Attach one observer that maps the parent outcome, honoring the
    /// registered context and the token generation gate at dispatch time.
    fn register<F>(&self, on: &Context, token: Option<&InvalidationToken>, f: F)
    where
        F: FnOnce(&Outcome<V, E>, bool) + Send + 'static,
    {
        let bound = on.bound_to(self.cell.is_settled());
        let gate: Option<TokenGate> = token.map(InvalidationToken::gate);
        self.cell.attach_callback(Box::new(move |outcome| {
            if bound.is_immediate() {
                let suppressed = gate.map_or(false, |g| g.superseded());
                f(outcome, suppressed);
            } else {
                let owned = outcome.clone();
                bound.execute(Box::new(move || {
                    let suppressed = gate.map_or(false, |g| g.superseded());
                    f(&owned, suppressed);
                }));
            }
        }));
    }

    // -- Value combinators --

    /// Map the value through `f`. Errors and cancellation pass through.
    pub fn map<V2, F>(&self, on: &Context, token: Option<&InvalidationToken>, f: F) -> Promise<V2, E>
    where
        V2: Send + Sync + 'static,
        F: FnOnce(V) -> V2 + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| match outcome {
            Outcome::Value(v) => {
                if suppressed {
                    resolver.cancel();
                } else {
                    resolver.fulfill(f(v.clone()));
                }
            }
            Outcome::Error(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.cancel(),
        });
        child
    }

    /// Chain a promise-returning `f` on the value; the child adopts the
    /// returned promise's outcome. Errors and cancellation pass through.
    pub fn flat_map<V2, F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V2, E>
    where
        V2: Clone + Send + Sync + 'static,
        F: FnOnce(V) -> Promise<V2, E> + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| match outcome {
            Outcome::Value(v) => {
                if suppressed {
                    resolver.cancel();
                } else {
                    resolver.resolve_with(&f(v.clone()));
                }
            }
            Outcome::Error(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.cancel(),
        });
        child
    }

    /// Fallible [`map`](Self::map): an `Err` rejects the child.
    pub fn try_map<V2, F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V2, E>
    where
        V2: Send + Sync + 'static,
        F: FnOnce(V) -> Result<V2, E> + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| match outcome {
            Outcome::Value(v) => {
                if suppressed {
                    resolver.cancel();
                } else {
                    match f(v.clone()) {
                        Ok(mapped) => resolver.fulfill(mapped),
                        Err(error) => resolver.reject(error),
                    }
                }
            }
            Outcome::Error(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.cancel(),
        });
        child
    }

    /// Fallible [`flat_map`](Self::flat_map): an `Err` rejects the child.
    pub fn try_flat_map<V2, F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V2, E>
    where
        V2: Clone + Send + Sync + 'static,
        F: FnOnce(V) -> Result<Promise<V2, E>, E> + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| match outcome {
            Outcome::Value(v) => {
                if suppressed {
                    resolver.cancel();
                } else {
                    match f(v.clone()) {
                        Ok(inner) => resolver.resolve_with(&inner),
                        Err(error) => resolver.reject(error),
                    }
                }
            }
            Outcome::Error(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.cancel(),
        });
        child
    }

    // -- Error combinators --

    /// Observe an error without consuming it; everything passes through.
    pub fn catch<F>(&self, on: &Context, token: Option<&InvalidationToken>, f: F) -> Promise<V, E>
    where
        F: FnOnce(E) + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| {
            if let Outcome::Error(e) = outcome {
                if !suppressed {
                    f(e.clone());
                }
            }
            resolver.resolve(outcome.clone());
        });
        child
    }

    /// Turn an error into a value. Values and cancellation pass through.
    pub fn recover<F>(&self, on: &Context, token: Option<&InvalidationToken>, f: F) -> Promise<V, E>
    where
        F: FnOnce(E) -> V + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| match outcome {
            Outcome::Value(v) => resolver.fulfill(v.clone()),
            Outcome::Error(e) => {
                if suppressed {
                    resolver.cancel();
                } else {
                    resolver.fulfill(f(e.clone()));
                }
            }
            Outcome::Cancelled => resolver.cancel(),
        });
        child
    }

    /// Fallible [`recover`](Self::recover): an `Err` rejects the child.
    pub fn try_recover<F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V, E>
    where
        F: FnOnce(E) -> Result<V, E> + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| match outcome {
            Outcome::Value(v) => resolver.fulfill(v.clone()),
            Outcome::Error(e) => {
                if suppressed {
                    resolver.cancel();
                } else {
                    match f(e.clone()) {
                        Ok(recovered) => resolver.fulfill(recovered),
                        Err(error) => resolver.reject(error),
                    }
                }
            }
            Outcome::Cancelled => resolver.cancel(),
        });
        child
    }

    /// Map the error type. Values and cancellation pass through.
    pub fn map_error<E2, F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V, E2>
    where
        E2: Send + Sync + 'static,
        F: FnOnce(E) -> E2 + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| match outcome {
            Outcome::Value(v) => resolver.fulfill(v.clone()),
            Outcome::Error(e) => {
                if suppressed {
                    resolver.cancel();
                } else {
                    resolver.reject(f(e.clone()));
                }
            }
            Outcome::Cancelled => resolver.cancel(),
        });
        child
    }

    /// Chain a promise-returning `f` on the error; the child adopts the
    /// returned promise's outcome. Values and cancellation pass through.
    pub fn flat_map_error<E2, F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V, E2>
    where
        V: Clone,
        E2: Clone + Send + Sync + 'static,
        F: FnOnce(E) -> Promise<V, E2> + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| match outcome {
            Outcome::Value(v) => resolver.fulfill(v.clone()),
            Outcome::Error(e) => {
                if suppressed {
                    resolver.cancel();
                } else {
                    resolver.resolve_with(&f(e.clone()));
                }
            }
            Outcome::Cancelled => resolver.cancel(),
        });
        child
    }

    // -- Outcome combinators --

    /// Observe every outcome; the child settles the same way.
    pub fn always<F>(&self, on: &Context, token: Option<&InvalidationToken>, f: F) -> Promise<V, E>
    where
        F: FnOnce(Outcome<V, E>) + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| {
            if !suppressed {
                f(outcome.clone());
            }
            resolver.resolve(outcome.clone());
        });
        child
    }

    /// Map the whole outcome, including cancellation. This is the only
    /// combinator family that can convert a cancellation into a value or
    /// error.
    pub fn map_result<V2, E2, F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V2, E2>
    where
        V2: Send + Sync + 'static,
        E2: Send + Sync + 'static,
        F: FnOnce(Outcome<V, E>) -> Outcome<V2, E2> + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| {
            if suppressed {
                resolver.cancel();
            } else {
                resolver.resolve(f(outcome.clone()));
            }
        });
        child
    }

    /// Chain a promise-returning `f` on the whole outcome.
    pub fn flat_map_result<V2, E2, F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V2, E2>
    where
        V2: Clone + Send + Sync + 'static,
        E2: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<V, E>) -> Promise<V2, E2> + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| {
            if suppressed {
                resolver.cancel();
            } else {
                resolver.resolve_with(&f(outcome.clone()));
            }
        });
        child
    }

    /// Fallible [`map_result`](Self::map_result).
    pub fn try_map_result<V2, E2, F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V2, E2>
    where
        V2: Send + Sync + 'static,
        E2: Send + Sync + 'static,
        F: FnOnce(Outcome<V, E>) -> Result<Outcome<V2, E2>, E2> + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| {
            if suppressed {
                resolver.cancel();
            } else {
                match f(outcome.clone()) {
                    Ok(mapped) => resolver.resolve(mapped),
                    Err(error) => resolver.reject(error),
                }
            }
        });
        child
    }

    /// Fallible [`flat_map_result`](Self::flat_map_result).
    pub fn try_flat_map_result<V2, E2, F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V2, E2>
    where
        V2: Clone + Send + Sync + 'static,
        E2: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<V, E>) -> Result<Promise<V2, E2>, E2> + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| {
            if suppressed {
                resolver.cancel();
            } else {
                match f(outcome.clone()) {
                    Ok(inner) => resolver.resolve_with(&inner),
                    Err(error) => resolver.reject(error),
                }
            }
        });
        child
    }

    /// Observe cancellation only; the child settles like the parent.
    pub fn on_cancel<F>(
        &self,
        on: &Context,
        token: Option<&InvalidationToken>,
        f: F,
    ) -> Promise<V, E>
    where
        F: FnOnce() + Send + 'static,
    {
        let (child, resolver) = self.propagating_child();
        self.register(on, token, move |outcome, suppressed| {
            if outcome.is_cancelled() && !suppressed {
                f();
            }
            resolver.resolve(outcome.clone());
        });
        child
    }

    // -- Propagation modifiers --

    /// Observe every outcome without participating in cancellation
    /// accounting: a tap neither keeps the parent's work wanted nor pushes
    /// cancel requests toward it.
    pub fn tap<F>(&self, on: &Context, token: Option<&InvalidationToken>, f: F) -> Promise<V, E>
    where
        F: FnOnce(Outcome<V, E>) + Send + 'static,
    {
        let (child, resolver) = self.detached_child();
        self.register(on, token, move |outcome, suppressed| {
            if !suppressed {
                f(outcome.clone());
            }
            resolver.resolve(outcome.clone());
        });
        child
    }

    /// A child that inherits this promise's outcome but never accepts or
    /// forwards cancel requests. The parent keeps one observer that never
    /// gives up, so automatic propagation can no longer reach it.
    pub fn ignoring_cancel(&self) -> Promise<V, E> {
        let cell = Arc::new(PromiseCell::new(true, false));
        self.cell.add_observer();
        let resolver = Resolver::primary(cell.clone());
        self.cell.attach_callback(Box::new(move |outcome| {
            resolver.resolve(outcome.clone());
        }));
        Promise::from_cell(cell)
    }

    /// A child with the inverted propagation rule: it forwards cancellation
    /// upstream as soon as all of its own observers request cancel, even
    /// while a strong handle to it is still held. `cancel_requested` runs
    /// exactly once, on `on`, just before the upstream notification; caches
    /// that de-duplicate in-flight promises release their entry there.
    pub fn propagating_cancellation<F>(&self, on: &Context, cancel_requested: F) -> Promise<V, E>
    where
        F: FnOnce() + Send + 'static,
    {
        let cell = Arc::new(PromiseCell::new(false, true));
        self.cell.add_observer();
        let parent = self.cell.clone();
        let hook_context = on.clone();
        let hook: Box<dyn FnOnce() + Send> = Box::new(cancel_requested);
        cell.set_upstream(Box::new(move || {
            hook_context.execute(hook);
            PromiseCell::observer_requested_cancel(&parent);
        }));
        let resolver = Resolver::primary(cell.clone());
        self.cell.attach_callback(Box::new(move |outcome| {
            resolver.resolve(outcome.clone());
        }));
        Promise::from_cell(cell)
    }
}

impl<V, E> Clone for Promise<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        self.cell.retain_handle();
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<V, E> Drop for Promise<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn drop(&mut self) {
        PromiseCell::release_handle(&self.cell);
    }
}

impl<V, E> fmt::Debug for Promise<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.cell.state_label())
            .finish()
    }
}
