//! Single-threaded reactor handle.
//!
//! All state transitions, callbacks and timer ticks run on one tokio
//! current-thread runtime. [`EventLoop`] is a cheap handle onto it.
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | [`EventLoop::defer`] | Run a closure on the next loop iteration |
//! | [`EventLoop::after`] | Run a closure once after a delay |
//! | [`EventLoop::periodic`] | Run a closure at a fixed period |
//!
//! On a current-thread runtime, clearing a timer from the loop thread
//! guarantees that no further tick runs.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at, sleep};

use crate::error::{Error, Result};

// ============================================================================
// EventLoop
// ============================================================================

/// Handle onto the reactor.
#[derive(Clone)]
pub struct EventLoop {
    handle: Handle,
}

// ============================================================================
// EventLoop - Public API
// ============================================================================

impl EventLoop {
    /// Returns the event loop of the calling runtime.
    ///
    /// # Errors
    ///
    /// [`Error::EventLoopUnavailable`] if called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|_| Error::EventLoopUnavailable)
    }

    /// Wraps an explicit runtime handle.
    #[inline]
    #[must_use]
    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    /// Returns the underlying runtime handle.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `f` on a later loop iteration.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { f() });
    }

    /// Runs `f` once after `delay`.
    ///
    /// Dropping or clearing the returned timer cancels it.
    #[must_use = "dropping the timer cancels it"]
    pub fn after<F>(&self, delay: Duration, f: F) -> OneShotTimer
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.handle.spawn(async move {
            sleep(delay).await;
            f();
        });
        OneShotTimer { task: Some(task) }
    }

    /// Runs `tick` every `period`, first after one full period.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `period` is zero.
    pub fn periodic<F>(&self, period: Duration, mut tick: F) -> Result<PeriodicTimer>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(Error::invalid_argument("timer period must be non-zero"));
        }

        let start = tokio::time::Instant::now() + period;
        let task = self.handle.spawn(async move {
            let mut interval = interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick();
            }
        });

        Ok(PeriodicTimer {
            period,
            task: Some(task),
        })
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("runtime", &self.handle.runtime_flavor())
            .finish()
    }
}

// ============================================================================
// PeriodicTimer
// ============================================================================

/// A running periodic timer. Aborted on [`clear`](Self::clear) or drop.
pub struct PeriodicTimer {
    period: Duration,
    task: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    /// Returns the tick period.
    #[inline]
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns `true` until the timer is cleared.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Stops the timer.
    pub fn clear(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for PeriodicTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTimer")
            .field("period", &self.period)
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// OneShotTimer
// ============================================================================

/// A pending one-shot timer. Aborted on [`clear`](Self::clear) or drop.
#[derive(Debug)]
pub struct OneShotTimer {
    task: Option<JoinHandle<()>>,
}

impl OneShotTimer {
    /// Cancels the timer if it has not fired yet.
    pub fn clear(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
