//! The resolution cell: one lock-free state machine per promise.
//!
//! Every promise shares exactly one [`PromiseCell`] between its producer
//! (through the [`Resolver`](crate::resolver::Resolver)) and its observers
//! (through [`Promise`](crate::promise::Promise) handles and registered
//! callbacks).
//!
//! # State Machine
//!
//! ```text
//! Empty ──→ Resolving ──→ Resolved
//!   │            ↑
//!   └─→ Cancelling ──→ Cancelled
//! ```
//!
//! - `Empty` → nothing has happened yet
//! - `Resolving` → a writer won the race and is storing the outcome
//! - `Resolved` → a value or error is stored (terminal)
//! - `Cancelling` → cancellation was requested; the body may still deliver
//! - `Cancelled` → terminal, no stored outcome
//!
//! The stored outcome is written only by the thread that won the
//! `Empty|Cancelling → Resolving` transition and is published by the release
//! CAS to `Resolved`; readers must observe `Resolved` with an acquire load
//! before touching it.
//!
//! # List Discipline
//!
//! The two observer lists (completion callbacks and cancel-request handlers)
//! are intrusive lock-free stacks. Attach is a CAS-prepend with release.
//! Settling seizes a list by swapping in the sealed sentinel with acq-rel;
//! from then on the seizer owns every node and any later attach observes the
//! sentinel, issues an acquire fence, and executes immediately against the
//! stored outcome. Nodes are prepended, so a seized list is reversed before
//! invocation to preserve registration order.
//!
//! # Connections
//!
//! - `crate::resolver` drives `resolve` and the cancel-handler list.
//! - `crate::promise` drives attach, the handle count, and the upstream
//!   cancellation edge.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::trace;

use crate::context::Context;
use crate::outcome::Outcome;
use crate::resolver::Resolver;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

pub(crate) const EMPTY: u8 = 0;
pub(crate) const RESOLVING: u8 = 1;
pub(crate) const RESOLVED: u8 = 2;
pub(crate) const CANCELLING: u8 = 3;
pub(crate) const CANCELLED: u8 = 4;

fn state_name(state: u8) -> &'static str {
    match state {
        EMPTY => "empty",
        RESOLVING => "resolving",
        RESOLVED => "resolved",
        CANCELLING => "cancelling",
        CANCELLED => "cancelled",
        _ => "invalid",
    }
}

// ---------------------------------------------------------------------------
// Intrusive list primitives
// ---------------------------------------------------------------------------

/// Shared shape of both node types: a patchable `next` pointer.
trait IntrusiveNode {
    fn next_field(&mut self) -> &mut *mut Self;
}

/// The sealed sentinel. Tagged address 1 is never a legitimate `Box`
/// allocation, so it is distinguishable from every real node.
fn sealed<T>() -> *mut T {
    1usize as *mut T
}

/// CAS-prepend `node`, patching `node.next` to the observed head on every
/// attempt. Returns `false` without linking if the list is sealed; the
/// caller still owns the node and must execute or free it.
fn push_node<T: IntrusiveNode>(head: &AtomicPtr<T>, node: *mut T) -> bool {
    let mut observed = head.load(Ordering::Relaxed);
    loop {
        if observed == sealed::<T>() {
            // Pair with the acq-rel seal so the stored outcome is visible.
            fence(Ordering::Acquire);
            return false;
        }
        unsafe {
            *(*node).next_field() = observed;
        }
        match head.compare_exchange_weak(observed, node, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(current) => observed = current,
        }
    }
}

/// Seal the list and take every linked node. Returns null if the list was
/// already sealed; the nodes then belong to whoever sealed it first.
fn seize_list<T>(head: &AtomicPtr<T>) -> *mut T {
    let taken = head.swap(sealed::<T>(), Ordering::AcqRel);
    if taken == sealed::<T>() {
        ptr::null_mut()
    } else {
        taken
    }
}

/// Reverse a seized list in place, turning LIFO prepend order into FIFO
/// registration order.
fn reverse_list<T: IntrusiveNode>(mut head: *mut T) -> *mut T {
    let mut reversed: *mut T = ptr::null_mut();
    while !head.is_null() {
        unsafe {
            let next = *(*head).next_field();
            *(*head).next_field() = reversed;
            reversed = head;
            head = next;
        }
    }
    reversed
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A completion observer. Owned by the cell once linked.
struct CallbackNode<V, E> {
    next: *mut CallbackNode<V, E>,
    run: Box<dyn FnOnce(&Outcome<V, E>) + Send>,
}

impl<V, E> IntrusiveNode for CallbackNode<V, E> {
    fn next_field(&mut self) -> &mut *mut Self {
        &mut self.next
    }
}

/// A cancel-request handler with the context it runs on. Owned by the cell
/// once linked.
struct CancelNode<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    next: *mut CancelNode<V, E>,
    context: Context,
    run: Box<dyn FnOnce(Resolver<V, E>) + Send>,
}

impl<V, E> IntrusiveNode for CancelNode<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn next_field(&mut self) -> &mut *mut Self {
        &mut self.next
    }
}

/// The child→parent cancellation edge, taken exactly once: fired when the
/// cell receives a cancel request, dropped silently when it settles.
struct UpstreamEdge {
    fire: Box<dyn FnOnce() + Send>,
}

// ---------------------------------------------------------------------------
// Count packing
// ---------------------------------------------------------------------------

// External promise handles in the low half, propagating observers that have
// not yet requested cancel in the high half. One word makes the propagation
// decision a single RMW crossing: exactly one update observes the word
// reach zero.
const HANDLE_ONE: u64 = 1;
const OBSERVER_ONE: u64 = 1 << 32;

fn handles(word: u64) -> u32 {
    word as u32
}

fn observers(word: u64) -> u32 {
    (word >> 32) as u32
}

// ---------------------------------------------------------------------------
// PromiseCell
// ---------------------------------------------------------------------------

/// The shared, atomically resolvable cell behind a promise.
pub(crate) struct PromiseCell<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    state: AtomicU8,
    /// Written once in `Resolving`, frozen by the release CAS to `Resolved`.
    value: UnsafeCell<Option<Outcome<V, E>>>,
    callbacks: AtomicPtr<CallbackNode<V, E>>,
    cancel_requests: AtomicPtr<CancelNode<V, E>>,
    counts: AtomicU64,
    upstream: AtomicPtr<UpstreamEdge>,
    /// `ignoring_cancel` children drop cancel requests entirely.
    ignore_cancel_requests: bool,
    /// `propagating_cancellation` children propagate as soon as all of
    /// their observers request cancel, even while externally held.
    propagate_when_held: bool,
}

unsafe impl<V, E> Send for PromiseCell<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
}

unsafe impl<V, E> Sync for PromiseCell<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
}

impl<V, E> PromiseCell<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub(crate) fn new(ignore_cancel_requests: bool, propagate_when_held: bool) -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(None),
            callbacks: AtomicPtr::new(ptr::null_mut()),
            cancel_requests: AtomicPtr::new(ptr::null_mut()),
            counts: AtomicU64::new(0),
            upstream: AtomicPtr::new(ptr::null_mut()),
            ignore_cancel_requests,
            propagate_when_held,
        }
    }

    /// A cell born terminal, with both lists pre-sealed.
    pub(crate) fn settled(outcome: Outcome<V, E>) -> Self {
        let (state, value) = match outcome {
            Outcome::Cancelled => (CANCELLED, None),
            stored => (RESOLVED, Some(stored)),
        };
        Self {
            state: AtomicU8::new(state),
            value: UnsafeCell::new(value),
            callbacks: AtomicPtr::new(sealed()),
            cancel_requests: AtomicPtr::new(sealed()),
            counts: AtomicU64::new(0),
            upstream: AtomicPtr::new(ptr::null_mut()),
            ignore_cancel_requests: false,
            propagate_when_held: false,
        }
    }

    // -- State --

    /// Attempt a transition. The CAS publishing `Resolved` is release; every
    /// other successful CAS is relaxed.
    fn transition(&self, to: u8) -> bool {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let allowed = matches!(
                (current, to),
                (EMPTY, RESOLVING)
                    | (EMPTY, CANCELLING)
                    | (EMPTY, CANCELLED)
                    | (CANCELLING, RESOLVING)
                    | (CANCELLING, CANCELLED)
                    | (RESOLVING, RESOLVED)
            );
            if !allowed {
                return false;
            }
            let success_order = if to == RESOLVED {
                Ordering::Release
            } else {
                Ordering::Relaxed
            };
            match self
                .state
                .compare_exchange_weak(current, to, success_order, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), RESOLVED | CANCELLED)
    }

    pub(crate) fn has_requested_cancel(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), CANCELLING | CANCELLED)
    }

    pub(crate) fn state_label(&self) -> &'static str {
        state_name(self.state.load(Ordering::Acquire))
    }

    /// The stored outcome. Callers must have observed `Resolved` with
    /// acquire ordering.
    unsafe fn stored(&self) -> &Outcome<V, E> {
        (*self.value.get())
            .as_ref()
            .expect("resolved cell has no stored outcome")
    }

    pub(crate) fn settled_outcome(&self) -> Option<Outcome<V, E>>
    where
        V: Clone,
        E: Clone,
    {
        match self.state.load(Ordering::Acquire) {
            RESOLVED => Some(unsafe { self.stored() }.clone()),
            CANCELLED => Some(Outcome::Cancelled),
            _ => None,
        }
    }

    // -- Settling --

    /// Settle the cell. Exactly the first effective call wins; later calls
    /// are silent no-ops.
    pub(crate) fn resolve(&self, outcome: Outcome<V, E>) {
        match outcome {
            Outcome::Cancelled => {
                if !self.transition(CANCELLED) {
                    return;
                }
                trace!("promise cell settled: cancelled");
                self.discard_cancel_handlers();
                self.drop_upstream();
                self.drain_callbacks();
            }
            stored => {
                if !self.transition(RESOLVING) {
                    return;
                }
                unsafe {
                    *self.value.get() = Some(stored);
                }
                // Only this thread may leave Resolving.
                assert!(
                    self.transition(RESOLVED),
                    "a settling cell left the resolving state"
                );
                trace!("promise cell settled: resolved");
                self.discard_cancel_handlers();
                self.drop_upstream();
                self.drain_callbacks();
            }
        }
    }

    fn drain_callbacks(&self) {
        let mut node = reverse_list(seize_list(&self.callbacks));
        if node.is_null() {
            return;
        }
        let cancelled = Outcome::Cancelled;
        let outcome: &Outcome<V, E> = match self.state.load(Ordering::Acquire) {
            RESOLVED => unsafe { self.stored() },
            CANCELLED => &cancelled,
            other => unreachable!("callback drain in {} state", state_name(other)),
        };
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            let CallbackNode { next, run } = *boxed;
            node = next;
            run(outcome);
        }
    }

    fn discard_cancel_handlers(&self) {
        let mut node = seize_list(&self.cancel_requests);
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }

    // -- Cancel requests --

    /// Advisory cancellation: transition `Empty → Cancelling`, run the
    /// registered cancel handlers, and notify the upstream edge. Never
    /// forces settlement; the body may still deliver a value.
    pub(crate) fn request_cancel(this: &Arc<Self>) {
        if this.ignore_cancel_requests {
            return;
        }
        if this.transition(CANCELLING) {
            trace!("promise cell cancel requested");
            Self::run_cancel_handlers(this);
        }
        this.fire_upstream();
    }

    fn run_cancel_handlers(this: &Arc<Self>) {
        let mut node = reverse_list(seize_list(&this.cancel_requests));
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            let CancelNode { next, context, run } = *boxed;
            node = next;
            let resolver = Resolver::secondary(this.clone());
            context.execute(Box::new(move || run(resolver)));
        }
    }

    // -- Attach --

    /// Register a completion observer, or run it immediately against the
    /// stored outcome if the cell already settled.
    pub(crate) fn attach_callback(&self, run: Box<dyn FnOnce(&Outcome<V, E>) + Send>) {
        let node = Box::into_raw(Box::new(CallbackNode {
            next: ptr::null_mut(),
            run,
        }));
        if push_node(&self.callbacks, node) {
            return;
        }
        let boxed = unsafe { Box::from_raw(node) };
        let CallbackNode { run, .. } = *boxed;
        let cancelled = Outcome::Cancelled;
        let outcome: &Outcome<V, E> = match self.state.load(Ordering::Acquire) {
            RESOLVED => unsafe { self.stored() },
            CANCELLED => &cancelled,
            other => unreachable!("sealed callback list in {} state", state_name(other)),
        };
        run(outcome);
    }

    /// Register a cancel-request handler. If the request already happened
    /// the handler is scheduled on its context now; if the cell settled
    /// without a cancel request the handler is discarded.
    pub(crate) fn attach_cancel_handler(
        this: &Arc<Self>,
        on: &Context,
        run: Box<dyn FnOnce(Resolver<V, E>) + Send>,
    ) {
        let context = on.bound_to(this.state.load(Ordering::Acquire) != EMPTY);
        let node = Box::into_raw(Box::new(CancelNode {
            next: ptr::null_mut(),
            context,
            run,
        }));
        if push_node(&this.cancel_requests, node) {
            return;
        }
        let boxed = unsafe { Box::from_raw(node) };
        let CancelNode { context, run, .. } = *boxed;
        match this.state.load(Ordering::Acquire) {
            CANCELLING | CANCELLED => {
                let resolver = Resolver::secondary(this.clone());
                context.execute(Box::new(move || run(resolver)));
            }
            // Settled with a value or error: the handler is moot.
            _ => {}
        }
    }

    // -- Handle and observer accounting --

    pub(crate) fn retain_handle(&self) {
        self.counts.fetch_add(HANDLE_ONE, Ordering::Relaxed);
    }

    /// Drop one external handle. When the last handle goes away and no
    /// propagating observer still wants the result, the cell requests its
    /// own cancellation (advisory; the body may still deliver).
    pub(crate) fn release_handle(this: &Arc<Self>) {
        let previous = this.counts.fetch_sub(HANDLE_ONE, Ordering::AcqRel);
        debug_assert!(handles(previous) > 0, "handle count underflow");
        if previous - HANDLE_ONE == 0 {
            trace!("promise cell unreferenced, requesting cancel");
            Self::request_cancel(this);
        }
    }

    pub(crate) fn add_observer(&self) {
        self.counts.fetch_add(OBSERVER_ONE, Ordering::Relaxed);
    }

    /// One propagating observer requested cancel. When the last of them
    /// does, and the cell is weakly held (or was built to propagate while
    /// held), the cell requests its own cancellation.
    pub(crate) fn observer_requested_cancel(this: &Arc<Self>) {
        let previous = this.counts.fetch_sub(OBSERVER_ONE, Ordering::AcqRel);
        debug_assert!(observers(previous) > 0, "observer count underflow");
        let now = previous - OBSERVER_ONE;
        if observers(now) == 0 && (this.propagate_when_held || handles(now) == 0) {
            trace!("last observer requested cancel, propagating");
            Self::request_cancel(this);
        }
    }

    // -- Upstream edge --

    /// Install (or replace) the child→parent cancellation edge.
    pub(crate) fn set_upstream(&self, fire: Box<dyn FnOnce() + Send>) {
        let edge = Box::into_raw(Box::new(UpstreamEdge { fire }));
        let previous = self.upstream.swap(edge, Ordering::AcqRel);
        if !previous.is_null() {
            drop(unsafe { Box::from_raw(previous) });
        }
    }

    /// Take the upstream edge and fire it. At most one taker wins.
    pub(crate) fn fire_upstream(&self) {
        let edge = self.upstream.swap(ptr::null_mut(), Ordering::AcqRel);
        if !edge.is_null() {
            let boxed = unsafe { Box::from_raw(edge) };
            let UpstreamEdge { fire } = *boxed;
            fire();
        }
    }

    fn drop_upstream(&self) {
        let edge = self.upstream.swap(ptr::null_mut(), Ordering::AcqRel);
        if !edge.is_null() {
            drop(unsafe { Box::from_raw(edge) });
        }
    }
}

impl<V, E> Drop for PromiseCell<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Make any last writes from the settling thread visible.
        fence(Ordering::Acquire);

        // Leftover completion observers can never be delivered to; freeing
        // them drops any captured child resolvers, cancelling those children.
        let mut node = seize_list(&self.callbacks);
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }

        // Leftover cancel handlers still get their chance to release
        // external work. The resolver they see is already cancelled, and
        // they run on the tearing-down thread.
        let mut node = seize_list(&self.cancel_requests);
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            let CancelNode { next, run, .. } = *boxed;
            node = next;
            run(Resolver::detached_cancelled());
        }

        self.drop_upstream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn pending_cell() -> Arc<PromiseCell<i32, String>> {
        Arc::new(PromiseCell::new(false, false))
    }

    // ---------------------------------------------------------------
    // State machine
    // ---------------------------------------------------------------

    #[test]
    fn empty_moves_to_resolving_then_resolved() {
        let cell = pending_cell();
        assert!(cell.transition(RESOLVING));
        assert!(cell.transition(RESOLVED));
        assert!(cell.is_settled());
    }

    #[test]
    fn terminal_states_absorb() {
        let cell = pending_cell();
        cell.resolve(Outcome::Value(1));
        assert!(!cell.transition(CANCELLING));
        assert!(!cell.transition(CANCELLED));
        assert!(!cell.transition(RESOLVING));
        assert_eq!(cell.settled_outcome(), Some(Outcome::Value(1)));
    }

    #[test]
    fn cancelling_still_accepts_a_value() {
        let cell = pending_cell();
        PromiseCell::request_cancel(&cell);
        assert!(cell.has_requested_cancel());
        cell.resolve(Outcome::Value(9));
        assert_eq!(cell.settled_outcome(), Some(Outcome::Value(9)));
    }

    #[test]
    fn cancelled_holds_no_value() {
        let cell = pending_cell();
        cell.resolve(Outcome::Cancelled);
        assert_eq!(cell.settled_outcome(), Some(Outcome::Cancelled));
    }

    #[test]
    fn second_resolution_is_a_silent_no_op() {
        let cell = pending_cell();
        cell.resolve(Outcome::Value(1));
        cell.resolve(Outcome::Value(2));
        cell.resolve(Outcome::Error("x".into()));
        cell.resolve(Outcome::Cancelled);
        assert_eq!(cell.settled_outcome(), Some(Outcome::Value(1)));
    }

    // ---------------------------------------------------------------
    // Callback list
    // ---------------------------------------------------------------

    #[test]
    fn observers_attached_before_settling_run_once_in_order() {
        let cell = pending_cell();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            cell.attach_callback(Box::new(move |outcome| {
                assert_eq!(outcome, &Outcome::Value(7));
                order.lock().unwrap().push(i);
            }));
        }
        cell.resolve(Outcome::Value(7));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn observers_attached_after_settling_run_immediately() {
        let cell = pending_cell();
        cell.resolve(Outcome::Error("late".into()));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        cell.attach_callback(Box::new(move |outcome| {
            assert_eq!(outcome, &Outcome::Error("late".into()));
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_attach_and_resolve_delivers_every_observer_exactly_once() {
        for _ in 0..64 {
            let cell = pending_cell();
            let hits = Arc::new(AtomicUsize::new(0));

            let attachers: Vec<_> = (0..4)
                .map(|_| {
                    let cell = cell.clone();
                    let hits = hits.clone();
                    std::thread::spawn(move || {
                        for _ in 0..8 {
                            let hits = hits.clone();
                            cell.attach_callback(Box::new(move |_| {
                                hits.fetch_add(1, Ordering::SeqCst);
                            }));
                        }
                    })
                })
                .collect();

            let resolver_cell = cell.clone();
            let resolver = std::thread::spawn(move || {
                resolver_cell.resolve(Outcome::Value(1));
            });

            for handle in attachers {
                handle.join().unwrap();
            }
            resolver.join().unwrap();
            assert_eq!(hits.load(Ordering::SeqCst), 32);
        }
    }

    // ---------------------------------------------------------------
    // Cancel-request list
    // ---------------------------------------------------------------

    #[test]
    fn cancel_handlers_run_on_request_in_order() {
        let cell = pending_cell();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            PromiseCell::attach_cancel_handler(
                &cell,
                &Context::Immediate,
                Box::new(move |_resolver| {
                    order.lock().unwrap().push(i);
                }),
            );
        }
        PromiseCell::request_cancel(&cell);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cancel_handler_attached_after_request_runs_immediately() {
        let cell = pending_cell();
        PromiseCell::request_cancel(&cell);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        PromiseCell::attach_cancel_handler(
            &cell,
            &Context::Immediate,
            Box::new(move |resolver| {
                assert!(resolver.has_requested_cancel());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_handlers_are_discarded_once_settled() {
        let cell = pending_cell();
        cell.resolve(Outcome::Value(3));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        PromiseCell::attach_cancel_handler(
            &cell,
            &Context::Immediate,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        PromiseCell::request_cancel(&cell);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    // ---------------------------------------------------------------
    // Drop-time cleanup
    // ---------------------------------------------------------------

    #[test]
    fn dropping_a_cell_runs_cancel_handlers_with_a_cancelled_resolver() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let cell = pending_cell();
            let counter = ran.clone();
            PromiseCell::attach_cancel_handler(
                &cell,
                &Context::Immediate,
                Box::new(move |resolver| {
                    assert!(resolver.has_requested_cancel());
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_a_cell_discards_completion_observers_without_running_them() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let cell = pending_cell();
            let counter = ran.clone();
            cell.attach_callback(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    // ---------------------------------------------------------------
    // Propagation accounting
    // ---------------------------------------------------------------

    #[test]
    fn last_observer_cancel_propagates_only_when_weakly_held() {
        let cell = pending_cell();
        cell.retain_handle();
        cell.add_observer();

        // Still externally held: no self-cancel.
        PromiseCell::observer_requested_cancel(&cell);
        assert!(!cell.has_requested_cancel());

        cell.add_observer();
        PromiseCell::release_handle(&cell);
        assert!(!cell.has_requested_cancel());

        // Weakly held and the last observer gives up: self-cancel.
        PromiseCell::observer_requested_cancel(&cell);
        assert!(cell.has_requested_cancel());
    }

    #[test]
    fn propagate_when_held_ignores_the_handle_count() {
        let cell: Arc<PromiseCell<i32, String>> = Arc::new(PromiseCell::new(false, true));
        cell.retain_handle();
        cell.add_observer();
        PromiseCell::observer_requested_cancel(&cell);
        assert!(cell.has_requested_cancel());
    }

    #[test]
    fn ignore_cancel_requests_drops_the_request() {
        let cell: Arc<PromiseCell<i32, String>> = Arc::new(PromiseCell::new(true, false));
        PromiseCell::request_cancel(&cell);
        assert!(!cell.has_requested_cancel());
        cell.resolve(Outcome::Value(5));
        assert_eq!(cell.settled_outcome(), Some(Outcome::Value(5)));
    }

    #[test]
    fn upstream_edge_fires_at_most_once() {
        let cell = pending_cell();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        cell.set_upstream(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        PromiseCell::request_cancel(&cell);
        PromiseCell::request_cancel(&cell);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settling_drops_the_upstream_edge_without_firing() {
        let cell = pending_cell();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        cell.set_upstream(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        cell.resolve(Outcome::Value(1));
        PromiseCell::request_cancel(&cell);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
