//! Expiry scheduling.
//!
//! Two mechanisms release expired holds:
//!
//! 1. **Per-hold timers**: one Tokio task per hold, sleeping until expiry.
//!    Timers are indexed by [`HoldKey`] so cancelling one is a map removal plus
//!    an abort, never a scan.
//! 2. **Periodic sweep**: a single task that ticks on a fixed interval and lets
//!    the owner release everything past its expiry, whether or not its timer
//!    fired. Timers are the latency path; the sweep is the backstop for timers
//!    delayed by stalls or process suspension.
//!
//! Both paths funnel into the same idempotent release, so a timer and the
//! sweep racing for one hold converge on the same ledger state.

use crate::lock;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tickethold_core::types::{HoldId, HoldKey};
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug)]
struct ArmedTimer {
    hold_id: HoldId,
    handle: AbortHandle,
}

/// Cancellable expiry timers keyed by hold identity, plus the sweep task.
#[derive(Debug, Default)]
pub struct ExpiryScheduler {
    timers: Mutex<HashMap<HoldKey, ArmedTimer>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl ExpiryScheduler {
    /// Creates a scheduler with nothing armed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timer that runs `on_expiry` once after `delay`.
    ///
    /// An older timer armed for `key` is cancelled: it belonged to a hold this
    /// one supersedes. A newer one is kept and nothing is armed. Returns
    /// whether the timer was armed.
    pub fn arm<F>(
        &self,
        runtime: &Handle,
        key: HoldKey,
        hold_id: HoldId,
        delay: Duration,
        on_expiry: F,
    ) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        // Spawn under the map lock so the task cannot disarm itself before
        // its entry exists.
        let mut timers = lock(&self.timers);
        if timers.get(&key).is_some_and(|armed| armed.hold_id > hold_id) {
            return false;
        }
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            on_expiry();
        });
        let previous = timers.insert(
            key,
            ArmedTimer {
                hold_id,
                handle: task.abort_handle(),
            },
        );
        drop(timers);

        if let Some(previous) = previous {
            previous.handle.abort();
        }
        true
    }

    /// Cancels the timer at `key`.
    ///
    /// With `Some(hold_id)` only a timer armed for that hold is cancelled.
    /// Returns whether a timer was cancelled.
    pub fn cancel(&self, key: &HoldKey, hold_id: Option<HoldId>) -> bool {
        match self.take(key, hold_id) {
            Some(timer) => {
                timer.handle.abort();
                true
            },
            None => false,
        }
    }

    /// Forgets the timer for `hold_id` without aborting it.
    ///
    /// Called from inside the firing timer, which must not abort itself.
    pub fn disarm(&self, key: &HoldKey, hold_id: HoldId) {
        let _ = self.take(key, Some(hold_id));
    }

    fn take(&self, key: &HoldKey, hold_id: Option<HoldId>) -> Option<ArmedTimer> {
        let mut timers = lock(&self.timers);
        let matches = timers
            .get(key)
            .is_some_and(|timer| hold_id.is_none_or(|id| timer.hold_id == id));
        if matches { timers.remove(key) } else { None }
    }

    /// Whether a timer is armed for `key`
    #[must_use]
    pub fn is_armed(&self, key: &HoldKey) -> bool {
        lock(&self.timers).contains_key(key)
    }

    /// Number of armed timers
    #[must_use]
    pub fn armed_count(&self) -> usize {
        lock(&self.timers).len()
    }

    /// Starts the periodic sweep, replacing any sweep already running.
    ///
    /// `tick` runs every `period`, first after one full period. Returning
    /// `false` stops the sweep.
    pub fn start_sweep<F>(&self, runtime: &Handle, period: Duration, mut tick: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !tick() {
                    tracing::debug!("Expiry sweep stopped by owner");
                    break;
                }
            }
        });

        if let Some(previous) = lock(&self.sweep).replace(task) {
            previous.abort();
        }
    }

    /// Whether the sweep task is running
    #[must_use]
    pub fn is_sweeping(&self) -> bool {
        lock(&self.sweep).as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the sweep and cancels every armed timer.
    ///
    /// Returns the number of timers cancelled.
    pub fn shutdown(&self) -> usize {
        if let Some(sweep) = lock(&self.sweep).take() {
            sweep.abort();
        }

        let timers = std::mem::take(&mut *lock(&self.timers));
        let cancelled = timers.len();
        for timer in timers.into_values() {
            timer.handle.abort();
        }
        tracing::debug!(cancelled, "Expiry scheduler shut down");
        cancelled
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
