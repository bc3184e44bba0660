//! Single-fire completion signal
//!
//! The only synchronization primitive between a dispatching caller and the
//! executing thread. `fire` is an atomic compare-and-swap, so whichever side
//! reaches a terminal state first wins and every later call is a silent no-op.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-shot event with a guarded "already fired" flag.
#[derive(Debug, Default)]
pub struct Signal {
    fired: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns true for the single call that actually fired
    /// it; all subsequent calls return false and have no effect.
    pub fn fire(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    /// Non-blocking check.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        // Register interest before the flag check so a fire in between is
        // not lost.
        let mut notified = pin!(self.notify.notified());
        notified.as_mut().enable();

        if self.is_fired() {
            return;
        }

        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fires_exactly_once() {
        let signal = Signal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(signal.is_fired());

        for _ in 0..10 {
            assert!(!signal.fire());
        }
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_wait_after_fire_returns_immediately() {
        let signal = Signal::new();
        signal.fire();
        signal.wait().await;
    }

    #[tokio::test]
    async fn test_wait_observes_fire_from_another_task() {
        let signal = Arc::new(Signal::new());

        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.fire();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete after fire")
            .unwrap();
    }

    #[tokio::test]
    async fn test_fire_from_blocking_thread() {
        let signal = Arc::new(Signal::new());

        let fired = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || signal.fire())
        };

        signal.wait().await;
        assert!(fired.join().unwrap());
    }
}
