//! Test support for promise-based code.
//!
//! Blocking settle helpers for tests that need to wait for a promise from
//! synchronous code. They observe through [`Promise::tap`], so waiting never
//! perturbs cancellation accounting: a settle helper neither keeps upstream
//! work wanted nor pushes a cancel request toward it.

use std::time::Duration;

use crate::context::Context;
use crate::outcome::Outcome;
use crate::promise::Promise;

/// Block the current thread until `promise` settles, for up to five
/// seconds.
///
/// # Panics
///
/// Panics if the promise does not settle within the timeout.
///
/// # Example
///
/// ```rust
/// use promissory_core::{Outcome, Promise, testing};
///
/// let (promise, resolver) = Promise::<i32, String>::pending();
/// std::thread::spawn(move || resolver.fulfill(7));
/// assert_eq!(testing::settle(&promise), Outcome::Value(7));
/// ```
pub fn settle<V, E>(promise: &Promise<V, E>) -> Outcome<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    settle_within(promise, Duration::from_secs(5))
}

/// Block the current thread until `promise` settles or `timeout` elapses.
///
/// # Panics
///
/// Panics on timeout.
pub fn settle_within<V, E>(promise: &Promise<V, E>, timeout: Duration) -> Outcome<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    let _ = promise.tap(&Context::Immediate, None, move |outcome| {
        let _ = tx.send(outcome);
    });
    rx.recv_timeout(timeout)
        .expect("promise did not settle within the timeout")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_returns_an_already_stored_outcome() {
        let promise = Promise::<i32, String>::fulfilled(3);
        assert_eq!(settle(&promise), Outcome::Value(3));
    }

    #[test]
    fn settle_waits_for_a_late_resolution() {
        let (promise, resolver) = Promise::<i32, String>::pending();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            resolver.reject("late".into());
        });
        assert_eq!(settle(&promise), Outcome::Error("late".into()));
        worker.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "did not settle")]
    fn settle_within_panics_on_timeout() {
        let (promise, _resolver) = Promise::<i32, String>::pending();
        let _ = settle_within(&promise, Duration::from_millis(10));
    }

    #[test]
    fn settling_does_not_disturb_cancellation_accounting() {
        let (promise, resolver) = Promise::<i32, String>::pending();
        let _watch = promise.tap(&Context::Immediate, None, |_| {});
        resolver.fulfill(1);
        assert_eq!(settle(&promise), Outcome::Value(1));
    }
}
