//! Invalidation tokens: generation-gated callback suppression.
//!
//! A token carries a monotonically increasing generation counter. Every
//! combinator registration that names a token snapshots the generation; at
//! dispatch time the user function runs only if the generation is unchanged.
//! Suppression is independent of cancellation: an invalidated token silences
//! callbacks that already raced into a context queue, which a cancel request
//! cannot do.
//!
//! Beyond suppression, a token can:
//!
//! - cascade invalidation to chained child tokens,
//! - request cancellation of registered promises when invalidated,
//! - signal upstream work to stop without invalidating
//!   ([`InvalidationToken::cancel_without_invalidating`]).
//!
//! # Connections
//!
//! - `crate::promise` snapshots a [`TokenGate`] per registration.
//! - Cancel subscribers are weak references into `crate::cell`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::trace;

use crate::cell::PromiseCell;
use crate::promise::Promise;

// ---------------------------------------------------------------------------
// CancelSink
// ---------------------------------------------------------------------------

/// A weakly-held target that can receive a cancel request. Implemented by
/// the resolution cell so tokens never keep promises alive.
pub(crate) trait CancelSink: Send + Sync {
    fn request_cancel_sink(self: Arc<Self>);
}

impl<V, E> CancelSink for PromiseCell<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn request_cancel_sink(self: Arc<Self>) {
        PromiseCell::request_cancel(&self);
    }
}

// ---------------------------------------------------------------------------
// TokenGate
// ---------------------------------------------------------------------------

/// A registration-time generation snapshot.
///
/// The gate shares the token's counter allocation, so it stays answerable
/// after the token itself is gone (a token that invalidates on drop bumps
/// the counter before dying).
#[derive(Clone)]
pub(crate) struct TokenGate {
    generation: Arc<AtomicU64>,
    snapshot: u64,
}

impl TokenGate {
    /// Whether the recorded generation has been superseded.
    ///
    /// Read with acquire; a dispatch racing an invalidation may observe
    /// either generation.
    pub(crate) fn superseded(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.snapshot
    }
}

// ---------------------------------------------------------------------------
// TokenCore
// ---------------------------------------------------------------------------

/// A weak link to a chained child token.
struct ChainLink {
    child: Weak<TokenCore>,
    /// Whether `cancel_without_invalidating` also crosses this link.
    include_cancel_without_invalidating: bool,
}

/// Shared token state. Dropping the last handle optionally invalidates.
struct TokenCore {
    /// Kept in its own allocation so gates outlive the core.
    generation: Arc<AtomicU64>,
    invalidate_on_drop: bool,
    children: Mutex<Vec<ChainLink>>,
    subscribers: Mutex<Vec<Weak<dyn CancelSink>>>,
}

impl TokenCore {
    fn new(invalidate_on_drop: bool) -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            invalidate_on_drop,
            children: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        trace!("invalidation token advanced its generation");
        self.fire_subscribers();
        // Snapshot under the lock, recurse outside it.
        let children: Vec<Arc<TokenCore>> = {
            let links = self.children.lock().unwrap();
            links.iter().filter_map(|link| link.child.upgrade()).collect()
        };
        for child in children {
            child.invalidate();
        }
    }

    fn cancel_without_invalidating(&self) {
        self.fire_subscribers();
        let children: Vec<Arc<TokenCore>> = {
            let links = self.children.lock().unwrap();
            links
                .iter()
                .filter(|link| link.include_cancel_without_invalidating)
                .filter_map(|link| link.child.upgrade())
                .collect()
        };
        for child in children {
            child.cancel_without_invalidating();
        }
    }

    /// Drain the subscriber list and request cancellation of every promise
    /// still alive.
    fn fire_subscribers(&self) {
        let drained = std::mem::take(&mut *self.subscribers.lock().unwrap());
        for weak in drained {
            if let Some(sink) = weak.upgrade() {
                sink.request_cancel_sink();
            }
        }
    }

    /// Register a cancel subscriber, compacting dead entries so repeated
    /// registration across re-invalidations cannot grow without bound.
    fn subscribe(&self, sink: Weak<dyn CancelSink>) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.push(sink);
    }

    fn link_child(&self, link: ChainLink) {
        let mut children = self.children.lock().unwrap();
        children.retain(|existing| existing.child.strong_count() > 0);
        children.push(link);
    }
}

impl Drop for TokenCore {
    fn drop(&mut self) {
        if self.invalidate_on_drop {
            self.invalidate();
        }
    }
}

// ---------------------------------------------------------------------------
// InvalidationToken
// ---------------------------------------------------------------------------

/// A suppression and cancellation handle.
///
/// Cloning shares the token; the shared state invalidates itself when the
/// last clone drops, unless built with
/// [`without_drop_invalidation`](Self::without_drop_invalidation).
///
/// # Example
///
/// ```rust
/// use promissory_core::{Context, Outcome, Promise, InvalidationToken};
///
/// let (promise, resolver) = Promise::<i32, String>::pending();
/// let token = InvalidationToken::new();
/// let chained = promise.map(&Context::Immediate, Some(&token), |x| x * 2);
///
/// token.invalidate();
/// resolver.fulfill(21);
///
/// // The mapping closure was suppressed, so the child is cancelled.
/// assert_eq!(chained.result(), Some(Outcome::Cancelled));
/// ```
#[derive(Clone)]
pub struct InvalidationToken {
    core: Arc<TokenCore>,
}

impl InvalidationToken {
    /// A token that invalidates itself when the last clone drops.
    pub fn new() -> Self {
        Self {
            core: Arc::new(TokenCore::new(true)),
        }
    }

    /// A token that does nothing on drop; callbacks registered against it
    /// keep running after it is gone.
    pub fn without_drop_invalidation() -> Self {
        Self {
            core: Arc::new(TokenCore::new(false)),
        }
    }

    /// The current generation.
    ///
    /// Reads with acquire ordering; when an invalidation races this read,
    /// either value may be observed and callers must not rely on which.
    pub fn generation(&self) -> u64 {
        self.core.generation.load(Ordering::Acquire)
    }

    /// Advance the generation, cancel subscribed promises, and cascade to
    /// chained child tokens.
    ///
    /// Callbacks registered with an older generation are suppressed from
    /// now on, even ones already queued on a context.
    pub fn invalidate(&self) {
        self.core.invalidate();
    }

    /// Cancel subscribed promises and cascade to child tokens that opted
    /// in, without advancing the generation: existing callbacks still run,
    /// but upstream work is told to stop.
    pub fn cancel_without_invalidating(&self) {
        self.core.cancel_without_invalidating();
    }

    /// Request cancellation of `promise` whenever this token is
    /// invalidated. The registration is weak; the token never keeps the
    /// promise alive.
    pub fn request_cancel_on_invalidate<V, E>(&self, promise: &Promise<V, E>)
    where
        V: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let weak_concrete: Weak<PromiseCell<V, E>> = Arc::downgrade(promise.cell_arc());
        let weak: Weak<dyn CancelSink> = weak_concrete;
        self.core.subscribe(weak);
    }

    /// Chain this token below `parent`: invalidating the parent also
    /// invalidates this token. When
    /// `include_cancel_without_invalidating` is set, the parent's
    /// [`cancel_without_invalidating`](Self::cancel_without_invalidating)
    /// crosses the link too. The link is weak in both directions, and
    /// chaining a token to itself is a no-op.
    pub fn chain_from(&self, parent: &InvalidationToken, include_cancel_without_invalidating: bool) {
        if Arc::ptr_eq(&self.core, &parent.core) {
            return;
        }
        parent.core.link_child(ChainLink {
            child: Arc::downgrade(&self.core),
            include_cancel_without_invalidating,
        });
    }

    /// Snapshot the current generation for one registration.
    pub(crate) fn gate(&self) -> TokenGate {
        TokenGate {
            generation: self.core.generation.clone(),
            snapshot: self.generation(),
        }
    }
}

impl Default for InvalidationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InvalidationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationToken")
            .field("generation", &self.generation())
            .finish()
    }
}
