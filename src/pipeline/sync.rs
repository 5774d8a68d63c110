//! Blocking wait primitives used by the orchestrator.
//!
//! Each wait point is a mutex + condition variable pair with a timeout. The
//! outcome is a `Result<Ready, TimedOut>` so that callers handle "timed out"
//! separately from hard failures.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// The awaited condition became true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready;

/// The wait gave up before the condition became true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut {
    pub waited: Duration,
}

pub type WaitOutcome = Result<Ready, TimedOut>;

/// Lock a mutex, recovering the data if a previous holder panicked.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State guarded by a mutex with an attached condition variable.
#[derive(Debug, Default)]
pub struct WaitCell<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> WaitCell<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        lock(&self.state)
    }

    /// Mutate the state and wake every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        let result = f(&mut guard);
        drop(guard);
        self.cond.notify_all();
        result
    }

    /// Wake every waiter so it re-checks state that lives outside the cell.
    /// Taking the lock first closes the window between a waiter's check and its sleep.
    pub fn notify_all(&self) {
        drop(self.lock());
        self.cond.notify_all();
    }

    /// Block while `blocked` returns true, for at most `timeout`.
    ///
    /// `blocked` runs with the lock held, both before sleeping and after every wakeup.
    pub fn wait_while(
        &self,
        timeout: Duration,
        mut blocked: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<'_, T>, WaitOutcome) {
        let start = Instant::now();
        let mut guard = self.lock();

        loop {
            if !blocked(&mut guard) {
                return (guard, Ok(Ready));
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return (guard, Err(TimedOut { waited: elapsed }));
            }

            let (next, _) = self
                .cond
                .wait_timeout(guard, timeout - elapsed)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_ready_immediately() {
        let cell = WaitCell::new(3u32);
        let (guard, outcome) = cell.wait_while(Duration::from_millis(10), |v| *v < 3);
        assert_eq!(outcome, Ok(Ready));
        assert_eq!(*guard, 3);
    }

    #[test]
    fn test_wait_times_out() {
        let cell = WaitCell::new(false);
        let (_guard, outcome) = cell.wait_while(Duration::from_millis(20), |ready| !*ready);
        let timed_out = outcome.unwrap_err();
        assert!(timed_out.waited >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_woken_by_update() {
        let cell = Arc::new(WaitCell::new(0u32));
        let writer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for _ in 0..5 {
                    thread::sleep(Duration::from_millis(2));
                    cell.update(|v| *v += 1);
                }
            })
        };

        let (guard, outcome) = cell.wait_while(Duration::from_secs(5), |v| *v < 5);
        assert_eq!(outcome, Ok(Ready));
        assert_eq!(*guard, 5);
        drop(guard);
        writer.join().unwrap();
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        assert_eq!(*lock(&mutex), 1);
    }
}
