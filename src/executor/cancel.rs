//! Cooperative cancellation handle for cancellation-aware tasks.

use crate::error::TaskError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared abort signal with an optional deadline.
///
/// The pool never interrupts a running operation: the operation is expected
/// to call [`check`](CancelToken::check) between steps, or to block through
/// [`sleep`](CancelToken::sleep), which wakes up early on cancellation.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    lock: Mutex<()>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    /// A timeout too large to represent as an `Instant` means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Instant::now().checked_add(timeout))
    }

    fn build(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline,
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Signal abort to every holder of this token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        // take the lock so a sleeper between its check and its wait sees the notify
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err(Cancelled)` after [`cancel`](CancelToken::cancel), `Err(DeadlineExceeded)`
    /// once the deadline has passed, `Ok(())` otherwise.
    pub fn check(&self) -> Result<(), TaskError> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(TaskError::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(TaskError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Block for `duration`, returning early with the cancellation error if
    /// the token is cancelled or its deadline passes first. `Duration::MAX`
    /// sleeps until one of those happens.
    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        let wake_at = Instant::now().checked_add(duration);
        let mut guard = self.inner.lock.lock();

        loop {
            self.check()?;
            if wake_at.map_or(false, |w| Instant::now() >= w) {
                return Ok(());
            }
            let until = match (self.inner.deadline, wake_at) {
                (Some(deadline), Some(w)) => Some(deadline.min(w)),
                (deadline, w) => deadline.or(w),
            };
            match until {
                Some(until) => {
                    self.inner.cond.wait_until(&mut guard, until);
                }
                None => self.inner.cond.wait(&mut guard),
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.inner.cancelled.load(Ordering::Relaxed))
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
