//! Timeline semaphores.
//!
//! A semaphore is device-agnostic: it holds no reference to any device. Device
//! queues that wait on it register a weak [`TimepointWaker`] so that signalling
//! can nudge their schedulers without creating a reference cycle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use super::error::{HalError, HalResult};

static NEXT_SEMAPHORE_ID: AtomicU64 = AtomicU64::new(1);

/// Callback interface for schedulers blocked on a semaphore value.
pub trait TimepointWaker: Send + Sync {
    fn wake(&self);
}

struct Timepoint {
    value: u64,
    waker: Weak<dyn TimepointWaker>,
}

struct SemaphoreState {
    value: u64,
    timepoints: Vec<Timepoint>,
}

struct SemaphoreInner {
    id: u64,
    state: Mutex<SemaphoreState>,
    reached: Condvar,
}

/// Monotonically increasing 64-bit timeline.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    pub fn new(initial_value: u64) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                id: NEXT_SEMAPHORE_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(SemaphoreState {
                    value: initial_value,
                    timepoints: Vec::new(),
                }),
                reached: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    fn state(&self) -> MutexGuard<'_, SemaphoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn query(&self) -> u64 {
        self.state().value
    }

    pub fn is_reached(&self, value: u64) -> bool {
        self.query() >= value
    }

    /// Advances the payload. The new value must be strictly greater than the current one.
    pub fn signal(&self, value: u64) -> HalResult<()> {
        let wakers = {
            let mut state = self.state();
            if value <= state.value {
                return Err(HalError::invalid_argument(format!(
                    "semaphore {} signal to {value} does not advance current value {}",
                    self.inner.id, state.value
                )));
            }
            state.value = value;
            let mut fired = Vec::new();
            state.timepoints.retain(|timepoint| {
                if timepoint.value <= value {
                    fired.push(timepoint.waker.clone());
                    false
                } else {
                    timepoint.waker.strong_count() > 0
                }
            });
            fired
        };
        self.inner.reached.notify_all();
        for waker in wakers {
            if let Some(waker) = waker.upgrade() {
                waker.wake();
            }
        }
        Ok(())
    }

    /// Blocks until the payload reaches `value`. `None` waits without a deadline.
    pub fn wait(&self, value: u64, timeout: Option<Duration>) -> HalResult<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state();
        while state.value < value {
            state = match deadline {
                None => self
                    .inner
                    .reached
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HalError::deadline_exceeded(format!(
                            "semaphore {} stayed at {} waiting for {value}",
                            self.inner.id, state.value
                        )));
                    }
                    self.inner
                        .reached
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
        Ok(())
    }

    /// Arranges for `waker` to be woken once the payload reaches `value`.
    ///
    /// Returns `true` when the value is already reached; the waker is not stored then.
    pub fn register_timepoint(&self, value: u64, waker: Weak<dyn TimepointWaker>) -> bool {
        let mut state = self.state();
        if state.value >= value {
            return true;
        }
        state.timepoints.push(Timepoint { value, waker });
        false
    }

    pub fn ptr_eq(&self, other: &Semaphore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakSemaphore {
        WeakSemaphore {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning semaphore reference, used for bookkeeping of live semaphores.
#[derive(Clone)]
pub struct WeakSemaphore {
    inner: Weak<SemaphoreInner>,
}

impl WeakSemaphore {
    pub fn upgrade(&self) -> Option<Semaphore> {
        self.inner.upgrade().map(|inner| Semaphore { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("id", &self.inner.id)
            .field("value", &self.query())
            .finish()
    }
}

/// A semaphore paired with a target payload.
#[derive(Clone, Debug)]
pub struct SemaphoreValue {
    pub semaphore: Semaphore,
    pub value: u64,
}

impl SemaphoreValue {
    pub fn new(semaphore: &Semaphore, value: u64) -> Self {
        Self {
            semaphore: semaphore.clone(),
            value,
        }
    }

    pub fn is_reached(&self) -> bool {
        self.semaphore.is_reached(self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn signal_must_advance() {
        let semaphore = Semaphore::new(3);
        assert!(matches!(
            semaphore.signal(3),
            Err(HalError::InvalidArgument(_))
        ));
        semaphore.signal(5).unwrap();
        assert_eq!(semaphore.query(), 5);
        assert!(semaphore.signal(4).is_err());
    }

    #[test]
    fn wait_times_out_without_signal() {
        let semaphore = Semaphore::new(0);
        let err = semaphore
            .wait(1, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, HalError::DeadlineExceeded(_)));
    }

    #[test]
    fn many_waiters_released_by_one_signal() {
        let semaphore = Semaphore::new(0);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let semaphore = semaphore.clone();
                thread::spawn(move || semaphore.wait(2, Some(Duration::from_secs(5))))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        semaphore.signal(2).unwrap();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    struct CountingWaker(AtomicUsize);

    impl TimepointWaker for CountingWaker {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn timepoints_fire_once_when_reached() {
        let semaphore = Semaphore::new(0);
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let weak: Weak<dyn TimepointWaker> = Arc::downgrade(&(waker.clone() as Arc<dyn TimepointWaker>));
        assert!(!semaphore.register_timepoint(2, weak.clone()));
        semaphore.signal(1).unwrap();
        assert_eq!(waker.0.load(Ordering::SeqCst), 0);
        semaphore.signal(2).unwrap();
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);
        semaphore.signal(3).unwrap();
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);
        assert!(semaphore.register_timepoint(3, weak));
    }
}
