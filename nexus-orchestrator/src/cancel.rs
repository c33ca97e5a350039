//! Cancellation window shared by the orchestrator and one running operation.

use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Window {
    /// Before the approval phases; only disposal may cancel.
    Pending,
    /// Approval phases; the caller may cancel.
    Open,
    /// A transaction submission is in flight inside the approval phases.
    Held,
    /// The bridge transaction is about to be or has been broadcast.
    Sealed,
}

#[derive(Debug)]
struct GateState {
    window: Window,
    requested: bool,
}

/// Decides atomically whether a cancellation request lands before
/// broadcast.
#[derive(Debug)]
pub(crate) struct CancelGate {
    state: Mutex<GateState>,
    signal: watch::Sender<bool>,
}

impl CancelGate {
    pub(crate) fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            state: Mutex::new(GateState {
                window: Window::Pending,
                requested: false,
            }),
            signal,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allow caller cancellation from now on.
    pub(crate) fn open(&self) {
        let mut state = self.lock();
        if state.window == Window::Pending {
            state.window = Window::Open;
        }
    }

    /// Seal the window before broadcasting. Returns `true` if a cancellation
    /// was accepted first, in which case nothing may be broadcast.
    pub(crate) fn seal(&self) -> bool {
        let mut state = self.lock();
        state.window = Window::Sealed;
        state.requested
    }

    /// Caller cancellation; accepted only while the window is open.
    pub(crate) fn request(&self) -> bool {
        let mut state = self.lock();
        if state.window != Window::Open {
            return false;
        }
        state.requested = true;
        drop(state);
        self.signal.send_replace(true);
        true
    }

    /// Disposal cancellation; accepted any time before sealing. While a
    /// submission is held the cancellation takes effect once it returns.
    pub(crate) fn force(&self) -> bool {
        let mut state = self.lock();
        if state.window == Window::Sealed {
            return false;
        }
        state.requested = true;
        let deferred = state.window == Window::Held;
        drop(state);
        if !deferred {
            self.signal.send_replace(true);
        }
        true
    }

    /// Shut the window for the duration of one submission. Returns `None`
    /// if a cancellation already landed, in which case nothing may be sent.
    pub(crate) fn hold(&self) -> Option<HeldWindow<'_>> {
        let mut state = self.lock();
        if state.requested {
            return None;
        }
        let previous = state.window;
        if previous == Window::Open {
            state.window = Window::Held;
        }
        Some(HeldWindow {
            gate: self,
            previous,
        })
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.lock().requested
    }

    /// Resolves once a cancellation has been accepted.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

/// Restores the window shut by [`CancelGate::hold`].
pub(crate) struct HeldWindow<'a> {
    gate: &'a CancelGate,
    previous: Window,
}

impl Drop for HeldWindow<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        if state.window != Window::Held {
            return;
        }
        state.window = self.previous;
        let requested = state.requested;
        drop(state);
        if requested {
            self.gate.signal.send_replace(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn caller_requests_only_land_while_open() {
        let gate = CancelGate::new();
        assert!(!gate.request());

        gate.open();
        assert!(gate.request());
        assert!(gate.seal());
        assert!(!gate.request());
    }

    #[test]
    fn sealing_without_request_blocks_later_cancels() {
        let gate = CancelGate::new();
        gate.open();
        assert!(!gate.seal());
        assert!(!gate.request());
        assert!(!gate.force());
        assert!(!gate.is_requested());
    }

    #[test]
    fn force_works_before_the_window_opens() {
        let gate = CancelGate::new();
        assert!(gate.force());
        assert!(gate.is_requested());
    }

    #[test]
    fn held_window_refuses_callers_and_defers_disposal() {
        let gate = CancelGate::new();
        gate.open();

        let held = gate.hold().unwrap();
        assert!(!gate.request());
        assert!(gate.force());
        assert!(!*gate.signal.borrow());
        drop(held);

        assert!(*gate.signal.borrow());
        assert!(gate.hold().is_none());
    }

    #[test]
    fn held_window_reopens_for_callers() {
        let gate = CancelGate::new();
        gate.open();
        drop(gate.hold().unwrap());
        assert!(gate.request());
        assert!(gate.hold().is_none());
    }

    #[test]
    fn holding_a_sealed_gate_keeps_it_sealed() {
        let gate = CancelGate::new();
        gate.open();
        assert!(!gate.seal());
        drop(gate.hold().unwrap());
        assert!(!gate.request());
        assert!(!gate.force());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_request() {
        let gate = std::sync::Arc::new(CancelGate::new());
        gate.open();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(gate.request());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
