//! Execution contexts for observer callbacks.
//!
//! Every observer registration names a [`Context`] that decides where the
//! callback runs once the promise settles. The resolution core itself never
//! awaits; a context is only a capability to eventually run a closure.
//!
//! # Variants
//!
//! | Context     | Dispatch                                               |
//! |-------------|--------------------------------------------------------|
//! | `Immediate` | Synchronously, on the thread that settles the promise  |
//! | `Spawn`     | As a task on a tokio runtime (no ordering guarantee)   |
//! | `Serial`    | On a dedicated worker, in submission order             |
//! | `NowOr`     | Synchronously iff the source is already settled at     |
//! |             | registration time, otherwise via the inner context     |
//! | `Custom`    | Through a user-supplied executor                       |
//!
//! # Connections
//!
//! - Captured by combinator callbacks in `crate::promise`.
//! - Captured by cancel-request handlers in `crate::resolver`.

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Where a callback runs.
///
/// Cloning a context is cheap; all variants share their backing resources.
///
/// # Example
///
/// ```rust
/// use promissory_core::Context;
///
/// let ctx = Context::Immediate;
/// assert!(ctx.is_immediate());
/// ctx.execute(Box::new(|| {}));
/// ```
#[derive(Clone)]
pub enum Context {
    /// Run synchronously on the invoking thread.
    Immediate,
    /// Spawn onto a tokio runtime.
    Spawn(Handle),
    /// Enqueue on an order-preserving serial queue.
    Serial(SerialQueue),
    /// Run synchronously iff the source promise is already settled when the
    /// callback is registered; otherwise defer to the inner context.
    NowOr(Arc<Context>),
    /// Dispatch through a user-supplied executor.
    Custom(Arc<dyn Fn(Job) + Send + Sync>),
}

impl Context {
    /// A `Spawn` context on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime, like [`Handle::current`].
    pub fn spawn() -> Self {
        Self::Spawn(Handle::current())
    }

    /// A fresh serial queue whose worker runs on the given runtime.
    pub fn serial(handle: &Handle) -> Self {
        Self::Serial(SerialQueue::new(handle))
    }

    /// Wrap a context in registration-time now-or-defer selection.
    pub fn now_or(inner: Context) -> Self {
        Self::NowOr(Arc::new(inner))
    }

    /// A context that hands every job to `executor`. The executor decides
    /// where and when the job runs; asynchronous dispatch is assumed.
    pub fn custom<F>(executor: F) -> Self
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(executor))
    }

    /// Whether dispatch is synchronous on the invoking thread.
    ///
    /// `NowOr` reports its inner context's answer; whether a particular
    /// registration short-circuited is decided per registration, not here.
    pub fn is_immediate(&self) -> bool {
        match self {
            Self::Immediate => true,
            Self::Spawn(_) | Self::Serial(_) | Self::Custom(_) => false,
            Self::NowOr(inner) => inner.is_immediate(),
        }
    }

    /// Run `job` on this context.
    pub fn execute(&self, job: Job) {
        match self {
            Self::Immediate => job(),
            Self::Spawn(handle) => {
                let _ = handle.spawn(async move { job() });
            }
            Self::Serial(queue) => queue.enqueue(job),
            Self::NowOr(inner) => inner.execute(job),
            Self::Custom(executor) => executor(job),
        }
    }

    /// Resolve registration-time dispatch for a source that is (or is not)
    /// already settled.
    ///
    /// `NowOr` collapses to `Immediate` when the source is settled and to
    /// its inner context otherwise. Every other variant is returned as-is.
    pub(crate) fn bound_to(&self, source_settled: bool) -> Context {
        match self {
            Self::NowOr(inner) => {
                if source_settled {
                    Self::Immediate
                } else {
                    inner.bound_to(source_settled)
                }
            }
            other => other.clone(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("Context::Immediate"),
            Self::Spawn(_) => f.write_str("Context::Spawn"),
            Self::Serial(_) => f.write_str("Context::Serial"),
            Self::NowOr(inner) => write!(f, "Context::NowOr({inner:?})"),
            Self::Custom(_) => f.write_str("Context::Custom"),
        }
    }
}

// ---------------------------------------------------------------------------
// SerialQueue
// ---------------------------------------------------------------------------

/// An order-preserving queue: jobs run one at a time, in submission order,
/// on a dedicated worker task.
///
/// Dropping every clone of the queue closes the channel and the worker
/// drains what was already submitted, then exits.
#[derive(Clone)]
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Create a queue whose worker runs on `handle`.
    pub fn new(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let _ = handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { tx }
    }

    /// Submit a job. Jobs submitted after the worker has shut down are
    /// silently dropped.
    pub fn enqueue(&self, job: Job) {
        let _ = self.tx.send(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn immediate_runs_synchronously() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        Context::Immediate.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawn_runs_on_the_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        Context::spawn().execute(Box::new(move || {
            tx.send(42).unwrap();
        }));
        let value = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn serial_preserves_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let ctx = Context::serial(&Handle::current());
        let (tx, rx) = std::sync::mpsc::channel();

        for i in 0..8 {
            let order = order.clone();
            let tx = tx.clone();
            ctx.execute(Box::new(move || {
                order.lock().unwrap().push(i);
                if i == 7 {
                    tx.send(()).unwrap();
                }
            }));
        }

        tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn now_or_collapses_for_settled_sources() {
        let ctx = Context::now_or(Context::Immediate);
        assert!(matches!(ctx.bound_to(true), Context::Immediate));
        assert!(matches!(ctx.bound_to(false), Context::Immediate));
    }

    #[tokio::test]
    async fn now_or_defers_to_inner_for_pending_sources() {
        let ctx = Context::now_or(Context::spawn());
        assert!(matches!(ctx.bound_to(true), Context::Immediate));
        assert!(matches!(ctx.bound_to(false), Context::Spawn(_)));
    }

    #[test]
    fn is_immediate_looks_through_now_or() {
        assert!(Context::Immediate.is_immediate());
        assert!(Context::now_or(Context::Immediate).is_immediate());
    }

    #[test]
    fn custom_hands_jobs_to_the_executor() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        let ctx = Context::custom(move |job| {
            sink.fetch_add(1, Ordering::SeqCst);
            job();
        });
        assert!(!ctx.is_immediate());
        ctx.execute(Box::new(|| {}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
