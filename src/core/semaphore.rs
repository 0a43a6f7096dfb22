use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A counting semaphore built on a mutex and a condition variable.
///
/// This is the OS-level blocking primitive used by the render-thread handshake.
/// `acquire()` blocks until the count is positive and then decrements it;
/// `release()` increments the count and wakes one waiter.
///
/// # Examples
///
/// ```
/// use frame_engine::core::Semaphore;
///
/// let semaphore = Semaphore::new(1);
/// semaphore.acquire();
/// assert!(!semaphore.try_acquire());
/// semaphore.release();
/// assert!(semaphore.try_acquire());
/// ```
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with `initial` permits.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Blocks until a permit is available and takes it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Takes a permit if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Waits at most `timeout` for a permit. Returns `true` if one was taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.available.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Returns a permit and wakes one waiter.
    pub fn release(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }

    /// Current number of available permits.
    pub fn permits(&self) -> usize {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn release_wakes_blocked_acquirer() {
        let semaphore = Arc::new(Semaphore::new(0));
        let waiter = {
            let semaphore = semaphore.clone();
            std::thread::spawn(move || semaphore.acquire())
        };
        std::thread::sleep(Duration::from_millis(10));
        semaphore.release();
        waiter.join().unwrap();
        assert_eq!(semaphore.permits(), 0);
    }

    #[test]
    fn acquire_timeout_expires_without_permit() {
        let semaphore = Semaphore::new(0);
        assert!(!semaphore.acquire_timeout(Duration::from_millis(5)));
        semaphore.release();
        assert!(semaphore.acquire_timeout(Duration::from_millis(5)));
    }
}
