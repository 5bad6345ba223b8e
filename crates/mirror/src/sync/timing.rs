//! Time sources and interruptible sleeping
//!
//! The sync engine never calls `Utc::now()` or `thread::sleep` directly so
//! that backoff and expiry logic can be tested without real delays.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// How a sleep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slept {
    /// The full duration elapsed
    Elapsed,
    /// Shutdown was requested before the duration elapsed
    Interrupted,
}

/// Blocking sleep used between retries
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> Slept;
}

/// Process-wide shutdown flag that wakes sleeping syncs
///
/// Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every sleeper
    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        let mut requested = flag.lock().unwrap_or_else(|e| e.into_inner());
        *requested = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait up to `duration`, returning early if shutdown is requested
    pub fn wait(&self, duration: Duration) -> Slept {
        let (flag, cvar) = &*self.inner;
        let mut requested = flag.lock().unwrap_or_else(|e| e.into_inner());

        // Too far out to represent: only a trigger ends the wait
        let Some(deadline) = Instant::now().checked_add(duration) else {
            while !*requested {
                requested = cvar.wait(requested).unwrap_or_else(|e| e.into_inner());
            }
            return Slept::Interrupted;
        };

        while !*requested {
            let now = Instant::now();
            if now >= deadline {
                return Slept::Elapsed;
            }
            requested = match cvar.wait_timeout(requested, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        Slept::Interrupted
    }
}

/// Sleeps on the calling thread, interruptible through a [`ShutdownSignal`]
#[derive(Debug, Clone, Default)]
pub struct ThreadSleeper {
    shutdown: ShutdownSignal,
}

impl ThreadSleeper {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self { shutdown }
    }
}

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) -> Slept {
        self.shutdown.wait(duration)
    }
}
