//! # Silence Timer
//!
//! A restartable countdown that signals "the caller stopped talking".
//!
//! ## Race-Free Cancellation:
//! Aborting a tokio task is not enough on its own: the countdown may already have
//! finished and its fire signal may be sitting in the session's inbox when a new frame
//! re-arms the timer. Every arm and every cancel therefore bumps a **generation**
//! counter. A fire carries the generation it was armed with, and the session only acts
//! on it if [`SilenceTimer::take_fire`] confirms it is still the current one. A stale
//! fire is suppressed even if it was delivered.
//!
//! ## Rust Concepts:
//! - **Arc<Mutex<T>>**: The registry keeps a clone of the timer so it can cancel it on
//!   disconnect while the session task owns the other clone
//! - **JoinHandle::abort**: Stops a pending countdown before it sleeps out
//! - **FnOnce**: The fire callback can run at most once

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct TimerSlot {
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

/// One session's silence countdown. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct SilenceTimer {
    slot: Arc<Mutex<TimerSlot>>,
}

impl SilenceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, TimerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start (or restart) the countdown.
    ///
    /// Any previously armed countdown is cancelled first. `on_fire` receives the
    /// generation of this arming once `duration` has elapsed without another
    /// `arm`/`cancel`. Returns that generation.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F>(&self, duration: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let mut slot = self.slot();
        if let Some(previous) = slot.pending.take() {
            previous.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;

        slot.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_fire(generation);
        }));
        generation
    }

    /// Disarm the timer. Returns `true` if a countdown was pending.
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot();
        slot.generation += 1;
        match slot.pending.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Claim a fire signal.
    ///
    /// Returns `true` exactly once for the current arming, `false` for any fire that
    /// was superseded by a later `arm` or `cancel`.
    pub fn take_fire(&self, generation: u64) -> bool {
        let mut slot = self.slot();
        if slot.generation == generation && slot.pending.is_some() {
            slot.pending = None;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.slot().pending.is_some()
    }
}
