//! Leading + trailing throttle for directory pushes.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleState {
    /// No delivery in the current interval; the next trigger fires immediately.
    Idle,
    /// A delivery just happened; triggers until expiry are deferred.
    Cooling,
    /// Cooling, and at least one trigger arrived that still needs a delivery.
    Pending,
}

type Action = Arc<dyn Fn() + Send + Sync>;

/// Collapses bursts of triggers into at most one delivery per interval.
///
/// The first trigger fires at once. Triggers arriving while cooling are folded
/// into a single trailing delivery at interval expiry, which itself starts a new
/// cooling period. Dropping the throttle cancels a pending trailing delivery.
pub struct Throttle {
    interval: Duration,
    state: Arc<Mutex<ThrottleState>>,
    action: Action,
    cancel: CancellationToken,
}

impl Throttle {
    /// `cancel` aborts any pending delivery when cancelled.
    pub fn new<F>(interval: Duration, cancel: CancellationToken, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            interval,
            state: Arc::new(Mutex::new(ThrottleState::Idle)),
            action: Arc::new(action),
            cancel,
        }
    }

    pub fn state(&self) -> ThrottleState {
        *self.state.lock()
    }

    /// Must be called from within a tokio runtime.
    pub fn trigger(&self) {
        if self.cancel.is_cancelled() {
            return;
        }

        let fire_now = {
            let mut state = self.state.lock();
            match *state {
                ThrottleState::Idle => {
                    *state = ThrottleState::Cooling;
                    true
                }
                ThrottleState::Cooling => {
                    *state = ThrottleState::Pending;
                    false
                }
                ThrottleState::Pending => false,
            }
        };

        if fire_now {
            (self.action)();
            self.arm();
        }
    }

    fn arm(&self) {
        let interval = self.interval;
        let state = Arc::clone(&self.state);
        let action = Arc::clone(&self.action);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let fire = {
                    let mut state = state.lock();
                    if *state == ThrottleState::Pending {
                        *state = ThrottleState::Cooling;
                        true
                    } else {
                        *state = ThrottleState::Idle;
                        false
                    }
                };

                if !fire {
                    return;
                }
                action();
            }
        });
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
