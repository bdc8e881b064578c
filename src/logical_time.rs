//! Logical time per execution context
//!
//! Clocks do not share a single "now". Each thread carries its own logical
//! time base: the run loop pins it to the due time of the task it is
//! advancing, and any other thread can pin it with [`with_logical_time`].
//! A thread that never pinned one falls back to the clock's physical time.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static LOGICAL_TIME: Cell<Option<f64>> = const { Cell::new(None) };
}

/// The calling thread's pinned logical time, if any.
pub fn logical_time() -> Option<f64> {
    LOGICAL_TIME.with(|t| t.get())
}

/// Run `f` with the calling thread's logical time pinned to `time`.
/// The previous value is restored afterwards, also on unwind.
pub fn with_logical_time<R>(time: f64, f: impl FnOnce() -> R) -> R {
    let _guard = LogicalTimeGuard::enter(time);
    f()
}

/// Pins the thread's logical time until dropped.
pub(crate) struct LogicalTimeGuard {
    prev: Option<f64>,
    // Restores a thread-local, so it must stay on this thread.
    _local: PhantomData<*const ()>,
}

impl LogicalTimeGuard {
    pub(crate) fn enter(time: f64) -> Self {
        let prev = LOGICAL_TIME.with(|t| t.replace(Some(time)));
        Self {
            prev,
            _local: PhantomData,
        }
    }
}

impl Drop for LogicalTimeGuard {
    fn drop(&mut self) {
        LOGICAL_TIME.with(|t| t.set(self.prev));
    }
}
