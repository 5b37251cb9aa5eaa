//! Panic isolation for user callbacks.
//!
//! Listeners, hooks, plugin inits and sampling predicates run through
//! [`call`] or [`poll`]. Besides catching the unwind, both mark the current
//! thread as isolating while the callback runs, so the panic hook installed
//! by [`NativeCapabilities`](crate::capture::NativeCapabilities) can tell a
//! contained callback panic from an application panic. A contained panic is
//! never reported as an error event: the report would reach the callback
//! that raised it again.

use std::cell::Cell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use futures::future::{self, FutureExt};

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the current thread as isolating until dropped.
struct Guard;

impl Guard {
    fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Guard
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Whether the current thread is running an isolated callback.
pub(crate) fn is_isolating() -> bool {
    DEPTH.with(|depth| depth.get() > 0)
}

/// Runs a callback, catching a panic.
pub(crate) fn call<R>(f: impl FnOnce() -> R) -> thread::Result<R> {
    let _guard = Guard::enter();
    panic::catch_unwind(AssertUnwindSafe(f))
}

/// Drives a future, catching a panic from any of its polls.
///
/// The thread-local mark is set per poll, so it follows the future across
/// worker threads.
pub(crate) fn poll<F>(fut: F) -> impl Future<Output = thread::Result<F::Output>>
where
    F: Future,
{
    let mut fut = Box::pin(AssertUnwindSafe(fut).catch_unwind());
    future::poll_fn(move |cx| {
        let _guard = Guard::enter();
        fut.as_mut().poll(cx)
    })
}
