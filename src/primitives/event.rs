//! A simple "auto reset event" (e.g a binary semaphore) as described in the excellent
//! [preshing blog](http://preshing.com/20150316/semaphores-are-surprisingly-versatile/) post.
//! This construct can typically be used to wake a thread up when work is done. An additional
//! guard is also provided to signal the event when the guard drops (very handy to wait for a
//! group of threads to complete work).
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

struct Flag {
    set: Mutex<bool>,
    cv: Condvar,
}

impl Flag {
    fn signal(&self) -> () {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        *set = true;
        self.cv.notify_one();
    }
}

/// Auto-reset event, signals are capped at 1 and consumed by a single waiter.
pub struct Event {
    flag: Arc<Flag>,
}

/// Shallow guard owning a clone of the event's flag and signaling it upon dropping. Share it via
/// its `Arc` to get signaled once every clone is gone.
pub struct Guard(Arc<Flag>);

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    #[inline]
    pub fn new() -> Self {
        Event {
            flag: Arc::new(Flag {
                set: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    #[inline]
    pub fn signal(&self) -> () {
        self.flag.signal();
    }

    #[inline]
    pub fn wait(&self) -> () {
        let mut set = self.flag.set.lock().unwrap_or_else(PoisonError::into_inner);
        while !*set {
            set = self.flag.cv.wait(set).unwrap_or_else(PoisonError::into_inner);
        }
        *set = false;
    }

    /// Same as wait() but gives up after the specified duration. Returns true if signaled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.flag.set.lock().unwrap_or_else(PoisonError::into_inner);
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            set = self
                .flag
                .cv
                .wait_timeout(set, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *set = false;
        true
    }

    #[inline]
    pub fn guard(&self) -> Arc<Guard> {
        Arc::new(Guard(self.flag.clone()))
    }
}

impl Drop for Guard {
    fn drop(&mut self) -> () {
        self.0.signal();
    }
}
