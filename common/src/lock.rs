use std::{
    sync::{Mutex, MutexGuard, TryLockError},
    thread,
    time::{Duration, Instant},
};

const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Mutex whose only acquisition path is a bounded wait.
///
/// Callers get `None` when the deadline passes; there is no blocking `lock()`
/// so a stalled holder can never wedge the request path.
#[derive(Debug, Default)]
pub struct BoundedLock<T> {
    inner: Mutex<T>,
}

impl<T> BoundedLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock_within(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Some(guard),
                // A panicked holder only ever left plain field copies behind.
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(RETRY_INTERVAL.min(deadline - now));
        }
    }
}
