//! Counted completion barrier.
//!
//! A [`Signal`] fans out N asynchronous branches and fans back in once
//! every branch has reported completion:
//!
//! - [`pending`](Signal::pending) is called before a branch starts
//! - [`done`](Signal::done) is called when it finishes
//! - when the count drops to zero every registered waiter runs exactly once
//! - a waiter registered while the count is zero runs immediately
//!
//! Waiters run on the thread that calls the final `done`, with no lock held.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

type Waiter = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SignalState {
    pending: usize,
    waiters: Vec<Waiter>,
}

/// A counted completion barrier. Clones share the same count.
#[derive(Clone)]
pub struct Signal {
    label: Arc<str>,
    state: Arc<Mutex<SignalState>>,
}

impl Signal {
    /// Creates a signal with no pending branches.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
            state: Arc::new(Mutex::new(SignalState::default())),
        }
    }

    /// Returns the label given at construction.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Registers one more pending branch.
    pub fn pending(&self) {
        self.state.lock().pending += 1;
    }

    /// Marks one branch as finished.
    pub fn done(&self) {
        let waiters = {
            let mut state = self.state.lock();
            if state.pending == 0 {
                warn!(signal = %self.label, "done called with nothing pending");
                return;
            }
            state.pending -= 1;
            if state.pending > 0 {
                return;
            }
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// Registers a pending branch and returns a callback that finishes it
    /// after running `f`.
    pub fn pending_callback<A, F>(&self, f: F) -> impl FnOnce(A) + Send + 'static
    where
        F: FnOnce(A) + Send + 'static,
    {
        self.pending();
        let signal = self.clone();
        move |arg| {
            f(arg);
            signal.done();
        }
    }

    /// Runs `f` once nothing is pending, immediately if that is already the case.
    pub fn wait_for_all(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.state.lock();
            if state.pending > 0 {
                state.waiters.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Returns true while branches are pending.
    pub fn is_active(&self) -> bool {
        self.state.lock().pending > 0
    }

    /// Returns the number of pending branches.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("label", &self.label)
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn waiter_runs_immediately_when_idle() {
        let signal = Signal::new("idle");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        signal.wait_for_all(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiters_fire_once_when_all_done() {
        let signal = Signal::new("fan-in");
        signal.pending();
        signal.pending();

        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let f = Arc::clone(&fired);
            signal.wait_for_all(move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }

        signal.done();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(signal.is_active());

        signal.done();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(!signal.is_active());

        // Extra done is ignored.
        signal.done();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pending_callback_runs_body_then_completes() {
        let signal = Signal::new("callback");
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let cb = signal.pending_callback(move |n: usize| {
            s.fetch_add(n, Ordering::SeqCst);
        });
        assert_eq!(signal.pending_count(), 1);

        let order = Arc::new(AtomicUsize::new(0));
        let (o, s) = (Arc::clone(&order), Arc::clone(&seen));
        signal.wait_for_all(move || {
            o.store(s.load(Ordering::SeqCst), Ordering::SeqCst);
        });

        cb(5);
        assert_eq!(order.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn waiter_may_reuse_the_signal() {
        let signal = Signal::new("reentrant");
        signal.pending();
        let inner = signal.clone();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        signal.wait_for_all(move || {
            inner.wait_for_all(move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
        });
        signal.done();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
