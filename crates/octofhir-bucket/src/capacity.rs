//! Counting semaphore with a rescan threshold.
//!
//! `inflight` never exceeds `max_inflight`. Waiters are woken only when a
//! release brings `inflight` below `rescan_threshold`, so an allocator that
//! waits for headroom sees a batch of free units at once instead of waking for
//! every single release.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard, Notify};

#[derive(Debug)]
struct LimiterState {
    inflight: usize,
}

#[derive(Debug)]
pub struct CapacityLimiter {
    max_inflight: usize,
    rescan_threshold: usize,
    running: AtomicBool,
    state: Mutex<LimiterState>,
    notify: Notify,
}

/// Exclusive view of the limiter held while deciding how much to reserve.
///
/// Releases block until the guard is dropped.
pub struct Headroom<'a> {
    max_inflight: usize,
    state: MutexGuard<'a, LimiterState>,
}

impl Headroom<'_> {
    pub fn free(&self) -> usize {
        self.max_inflight.saturating_sub(self.state.inflight)
    }

    pub fn inflight(&self) -> usize {
        self.state.inflight
    }

    /// Reserves up to `units`, returning how many were reserved.
    pub fn reserve(&mut self, units: usize) -> usize {
        let granted = units.min(self.free());
        self.state.inflight += granted;
        granted
    }
}

impl CapacityLimiter {
    /// `rescan_threshold` defaults to half of `max_inflight` (at least 1) and
    /// is clamped to `1..=max_inflight`.
    pub fn new(max_inflight: usize, rescan_threshold: Option<usize>) -> Self {
        let max_inflight = max_inflight.max(1);
        let rescan_threshold = rescan_threshold
            .unwrap_or(max_inflight / 2)
            .clamp(1, max_inflight);
        Self {
            max_inflight,
            rescan_threshold,
            running: AtomicBool::new(true),
            state: Mutex::new(LimiterState { inflight: 0 }),
            notify: Notify::new(),
        }
    }

    /// A limiter whose waiters are woken on every release.
    pub fn without_hysteresis(max_inflight: usize) -> Self {
        Self::new(max_inflight, Some(max_inflight))
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    pub fn rescan_threshold(&self) -> usize {
        self.rescan_threshold
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn inflight(&self) -> usize {
        self.state.lock().await.inflight
    }

    /// Waits until `inflight` is below the rescan threshold and returns the
    /// locked state, or `None` once the limiter is stopped.
    pub async fn wait_for_headroom(&self) -> Option<Headroom<'_>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.state.lock().await;
            if !self.is_running() {
                return None;
            }
            if state.inflight < self.rescan_threshold {
                return Some(Headroom {
                    max_inflight: self.max_inflight,
                    state,
                });
            }
            drop(state);
            notified.await;
        }
    }

    /// Waits until `cost` units fit and reserves them.
    ///
    /// Returns `false` without reserving anything if the limiter is stopped
    /// while waiting. A cost above `max_inflight` is clamped to it.
    pub async fn acquire(&self, cost: usize) -> bool {
        let cost = cost.min(self.max_inflight);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut state = self.state.lock().await;
            if !self.is_running() {
                return false;
            }
            if state.inflight + cost <= self.max_inflight {
                state.inflight += cost;
                return true;
            }
            drop(state);
            notified.await;
        }
    }

    /// Reserves `cost` units if they fit right now.
    pub async fn try_acquire(&self, cost: usize) -> bool {
        let cost = cost.min(self.max_inflight);
        let mut state = self.state.lock().await;
        if !self.is_running() || state.inflight + cost > self.max_inflight {
            return false;
        }
        state.inflight += cost;
        true
    }

    /// Returns `cost` units; wakes waiters only below the rescan threshold.
    pub async fn release(&self, cost: usize) {
        let cost = cost.min(self.max_inflight);
        let mut state = self.state.lock().await;
        if cost > state.inflight {
            tracing::warn!(
                cost,
                inflight = state.inflight,
                "Capacity released more than was reserved"
            );
        }
        state.inflight = state.inflight.saturating_sub(cost);
        if state.inflight < self.rescan_threshold {
            self.notify.notify_waiters();
        }
    }

    /// Stops the limiter and wakes every waiter.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}
