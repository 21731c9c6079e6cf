//! A recursive mutex: the same thread may re-acquire it without deadlocking.
//!
//! Grounded on the kernel's scheduler-aware recursive mutex, re-expressed
//! over `std::sync::{Mutex, Condvar}` and `std::thread::ThreadId` now that
//! acquisition blocks a real OS thread instead of a cooperatively scheduled
//! task. Used for the SDIO TX ring and the mux session's output path, both
//! of which recurse through several call layers while holding the lock.

use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

struct State {
    owner: Option<ThreadId>,
    count: usize,
}

pub struct RecursiveMutex {
    state: Mutex<State>,
    available: Condvar,
}

impl RecursiveMutex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                owner: None,
                count: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Acquires the mutex, blocking indefinitely if another thread holds it.
    pub fn acquire(&self) {
        let tid = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                Some(owner) if owner == tid => {
                    state.count += 1;
                    return;
                }
                None => {
                    state.owner = Some(tid);
                    state.count = 1;
                    return;
                }
                _ => {
                    state = self.available.wait(state).unwrap();
                }
            }
        }
    }

    /// Acquires the mutex, giving up after `timeout` and returning `false`.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let tid = std::thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                Some(owner) if owner == tid => {
                    state.count += 1;
                    return true;
                }
                None => {
                    state.owner = Some(tid);
                    state.count = 1;
                    return true;
                }
                _ => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, result) =
                        self.available.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                    if result.timed_out() && state.owner.is_some() {
                        return false;
                    }
                }
            }
        }
    }

    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.owner, Some(std::thread::current().id()));
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            drop(state);
            self.available.notify_one();
        }
    }
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn same_thread_reacquires_without_blocking() {
        let m = RecursiveMutex::new();
        m.acquire();
        m.acquire();
        m.release();
        m.release();
    }

    #[test]
    fn other_thread_blocks_until_release() {
        let m = Arc::new(RecursiveMutex::new());
        m.acquire();
        let m2 = Arc::clone(&m);
        let handle = std::thread::spawn(move || {
            m2.acquire();
            m2.release();
        });
        std::thread::sleep(Duration::from_millis(20));
        m.release();
        handle.join().unwrap();
    }

    #[test]
    fn acquire_timeout_fails_when_held() {
        let m = Arc::new(RecursiveMutex::new());
        m.acquire();
        let m2 = Arc::clone(&m);
        let ok = std::thread::spawn(move || m2.acquire_timeout(Duration::from_millis(30)))
            .join()
            .unwrap();
        assert!(!ok);
        m.release();
    }
}
