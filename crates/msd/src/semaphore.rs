//! TEAM_521: Client-visible signalable semaphores.
//!
//! Soft atoms set, reset and wait on these. The device thread never blocks
//! on a semaphore; it registers a one-shot callback that posts a request
//! back to its own queue when the semaphore is signalled.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

type Waiter = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SemaphoreState {
    signaled: bool,
    waiters: Vec<Waiter>,
}

pub struct Semaphore {
    id: u64,
    state: Mutex<SemaphoreState>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SemaphoreState::default()),
            cond: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Signal and run every pending async waiter.
    pub fn signal(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.signaled = true;
            std::mem::take(&mut state.waiters)
        };
        self.cond.notify_all();
        // Callbacks may post to other queues; never run them under our lock.
        for waiter in waiters {
            waiter();
        }
    }

    pub fn reset(&self) {
        self.state.lock().signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Block until signalled. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.signaled {
            self.cond
                .wait_while_for(&mut state, |state| !state.signaled, timeout);
        }
        state.signaled
    }

    /// Run `callback` once the semaphore is signalled; immediately if it
    /// already is.
    pub fn wait_async(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if state.signaled {
            drop(state);
            callback();
        } else {
            state.waiters.push(Box::new(callback));
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("id", &self.id)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_signal_and_reset() {
        let sem = Semaphore::new();
        assert!(!sem.is_signaled());
        sem.signal();
        assert!(sem.is_signaled());
        sem.reset();
        assert!(!sem.is_signaled());
    }

    #[test]
    fn test_wait_timeout() {
        let sem = Semaphore::new();
        assert!(!sem.wait_timeout(Duration::from_millis(5)));

        let signaler = {
            let sem = sem.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                sem.signal();
            })
        };
        assert!(sem.wait_timeout(Duration::from_secs(5)));
        signaler.join().unwrap();
    }

    #[test]
    fn test_async_waiters_fire_once() {
        let sem = Semaphore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            sem.wait_async(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sem.signal();
        sem.signal();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Already signalled: runs inline.
        let fired_now = fired.clone();
        sem.wait_async(move || {
            fired_now.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
