//! A reentrant gate letting any number of threads run concurrently inside a region ("entered")
//! while supporting an exclusive mode ("closed"). Closing first waits for exclusivity against
//! other closers, then waits for every foreign entry to drain. Once closed, fresh entries from
//! other threads park until the gate opens again.
//!
//! Both holds are reentrant and tracked per thread. The closer may freely enter/exit and may
//! close again, its own entries never block its drain. A thread already entered may always nest
//! further entries, even while another thread is draining (it would otherwise deadlock against
//! that closer).
//!
//! All the state lives under a single mutex. Parked enterers and exclusivity waiters share the
//! `opened` condvar while the unique draining closer waits on `drained`. Every wait re-checks its
//! condition in a loop against a deadline computed once per call, so a timed out enter() or
//! close() leaves the gate exactly as it found it.
use serde_derive::Serialize;
use slog::{Discard, Logger};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Misused operation, e.g a release without its matching acquisition on the calling thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Usage {
    Exit,
    Open,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Errors {
    UsageViolation(Usage),
    InvalidArgument(i64),
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Errors::UsageViolation(Usage::Exit) => write!(f, "exit() without a matching enter()"),
            Errors::UsageViolation(Usage::Open) => write!(f, "open() without a matching close()"),
            Errors::InvalidArgument(ms) => write!(f, "invalid timeout {}ms (must be >= -1)", ms),
        }
    }
}

impl Error for Errors {}

/// How long enter()/close() may park. `Millis(0)` is a single non-blocking attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    Millis(u64),
}

impl Timeout {
    /// Maps the conventional millisecond argument: -1 waits forever, 0 tries once, > 0 is a budget.
    pub fn from_millis(ms: i64) -> Result<Self, Errors> {
        match ms {
            -1 => Ok(Timeout::Infinite),
            ms if ms >= 0 => Ok(Timeout::Millis(ms as u64)),
            ms => Err(Errors::InvalidArgument(ms)),
        }
    }

    #[inline]
    fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Infinite => None,
            Timeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        let ms = d.as_secs()
            .saturating_mul(1000)
            .saturating_add(u64::from(d.subsec_millis()));
        Timeout::Millis(ms)
    }
}

/// Point in time view of the gate counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub entered: usize,
    pub closed: usize,
    pub holders: usize,
    pub closing: bool,
}

#[derive(Default)]
struct State {
    entered: usize,
    closed: usize,
    closer: Option<ThreadId>,
    depths: HashMap<ThreadId, usize>,
}

impl State {
    #[inline]
    fn depth(&self, id: ThreadId) -> usize {
        self.depths.get(&id).cloned().unwrap_or(0)
    }

    #[inline]
    fn is_closer(&self, id: ThreadId) -> bool {
        self.closed > 0 && self.closer == Some(id)
    }

    /// Entries held by threads other than the closer.
    #[inline]
    fn foreign(&self) -> usize {
        match self.closer {
            Some(id) => self.entered - self.depth(id),
            None => self.entered,
        }
    }

    #[inline]
    fn incr(&mut self, id: ThreadId) -> () {
        self.entered += 1;
        *self.depths.entry(id).or_insert(0) += 1;
    }
}

/// Reentrant enter/exit vs close/open gate. The gate starts open with all counters at zero.
pub struct Gate {
    state: Mutex<State>,
    opened: Condvar,
    drained: Condvar,
    log: Logger,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    #[inline]
    pub fn new() -> Self {
        Gate::with(Logger::root(Discard, o!()))
    }

    #[inline]
    pub fn with(log: Logger) -> Self {
        Gate {
            state: Mutex::new(State::default()),
            opened: Condvar::new(),
            drained: Condvar::new(),
            log,
        }
    }

    /// Total number of outstanding entries, reentrant ones included.
    #[inline]
    pub fn entries(&self) -> usize {
        self.lock().entered
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.lock().closed > 0
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            entered: state.entered,
            closed: state.closed,
            holders: state.depths.len(),
            closing: state.closer.is_some(),
        }
    }

    #[inline]
    pub fn is_entered_by_current_thread(&self) -> bool {
        self.lock().depth(thread::current().id()) > 0
    }

    #[inline]
    pub fn is_closed_by_current_thread(&self) -> bool {
        self.lock().is_closer(thread::current().id())
    }

    pub fn enter(&self, ms: i64) -> Result<bool, Errors> {
        Ok(self.enter_for(Timeout::from_millis(ms)?))
    }

    pub fn enter_for(&self, timeout: Timeout) -> bool {
        let id = thread::current().id();
        let mut state = self.lock();

        //
        // - the closer and threads already inside go through right away
        // - a fresh entry parks as long as another thread holds the close
        //
        if !state.is_closer(id) && state.depth(id) == 0 && state.closer.is_some() {
            let (guard, ok) = self.wait(&self.opened, state, timeout.deadline(), |s| {
                s.closer.is_none()
            });
            state = guard;
            if !ok {
                debug!(&self.log, "enter() timed out"; "timeout" => format!("{:?}", timeout));
                return false;
            }
        }

        state.incr(id);
        true
    }

    pub fn exit(&self) -> Result<(), Errors> {
        let id = thread::current().id();
        let mut state = self.lock();
        let depth = state.depth(id);
        if depth == 0 {
            warn!(&self.log, "unbalanced exit()"; "thread" => format!("{:?}", id));
            return Err(Errors::UsageViolation(Usage::Exit));
        }

        state.entered -= 1;
        if depth == 1 {
            state.depths.remove(&id);
        } else {
            state.depths.insert(id, depth - 1);
        }

        //
        // - a closer may be draining, wake it up once the last foreign entry left
        // - the closer exiting its own entries never needs to signal itself
        //
        if state.closer.is_some() && state.closer != Some(id) && state.foreign() == 0 {
            self.drained.notify_all();
        }
        Ok(())
    }

    pub fn close(&self, ms: i64) -> Result<bool, Errors> {
        Ok(self.close_for(Timeout::from_millis(ms)?))
    }

    pub fn close_for(&self, timeout: Timeout) -> bool {
        let id = thread::current().id();
        let mut state = self.lock();
        if state.is_closer(id) {
            state.closed += 1;
            debug!(&self.log, "close() nested"; "depth" => state.closed);
            return true;
        }

        //
        // - one deadline spans both phases
        // - phase 1: wait for any other closer to open
        //
        let deadline = timeout.deadline();
        let (guard, ok) = self.wait(&self.opened, state, deadline, |s| s.closer.is_none());
        state = guard;
        if !ok {
            debug!(&self.log, "close() timed out waiting for exclusivity");
            return false;
        }

        //
        // - claim exclusivity, fresh foreign entries now park
        // - phase 2: wait for the foreign entries to drain
        //
        state.closer = Some(id);
        state.closed = 1;
        let (guard, ok) = self.wait(&self.drained, state, deadline, |s| s.foreign() == 0);
        state = guard;
        if !ok {
            //
            // - roll back the claim and let everybody parked on us retry
            //
            state.closer = None;
            state.closed = 0;
            self.opened.notify_all();
            debug!(&self.log, "close() timed out draining, rolled back"; "pending" => state.foreign());
            return false;
        }

        debug!(&self.log, "closed"; "own" => state.depth(id));
        true
    }

    pub fn open(&self) -> Result<(), Errors> {
        let id = thread::current().id();
        let mut state = self.lock();
        if !state.is_closer(id) {
            warn!(&self.log, "unbalanced open()"; "thread" => format!("{:?}", id));
            return Err(Errors::UsageViolation(Usage::Open));
        }

        state.closed -= 1;
        if state.closed == 0 {
            state.closer = None;
            self.opened.notify_all();
            debug!(&self.log, "opened");
        }
        Ok(())
    }

    /// Enters and returns a guard invoking exit() when dropped, or None upon timeout.
    pub fn entered(&self, timeout: Timeout) -> Option<Entered<'_>> {
        if self.enter_for(timeout) {
            Some(Entered {
                gate: self,
                _local: PhantomData,
            })
        } else {
            None
        }
    }

    /// Closes and returns a guard invoking open() when dropped, or None upon timeout.
    pub fn closed(&self, timeout: Timeout) -> Option<Closed<'_>> {
        if self.close_for(timeout) {
            Some(Closed {
                gate: self,
                _local: PhantomData,
            })
        } else {
            None
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parks on the condvar until the predicate holds or the deadline elapses. The predicate is
    /// always checked before giving up, so a zero budget still makes one attempt.
    fn wait<'a, F>(
        &self,
        cv: &Condvar,
        mut state: MutexGuard<'a, State>,
        deadline: Option<Instant>,
        ready: F,
    ) -> (MutexGuard<'a, State>, bool)
    where
        F: Fn(&State) -> bool,
    {
        loop {
            if ready(&state) {
                return (state, true);
            }
            match deadline {
                None => {
                    state = cv.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return (state, false);
                    }
                    let (guard, _) = cv.wait_timeout(state, deadline - now).unwrap_or_else(
                        PoisonError::into_inner,
                    );
                    state = guard;
                }
            }
        }
    }
}

/// RAII entry, the gate is exited when this drops. Bound to the entering thread.
pub struct Entered<'a> {
    gate: &'a Gate,
    _local: PhantomData<*const ()>,
}

impl<'a> Drop for Entered<'a> {
    fn drop(&mut self) -> () {
        let released = self.gate.exit();
        debug_assert!(released.is_ok(), "entry guard dropped after a manual exit()");
    }
}

/// RAII close, the gate is opened when this drops. Bound to the closing thread.
pub struct Closed<'a> {
    gate: &'a Gate,
    _local: PhantomData<*const ()>,
}

impl<'a> Drop for Closed<'a> {
    fn drop(&mut self) -> () {
        let released = self.gate.open();
        debug_assert!(released.is_ok(), "close guard dropped after a manual open()");
    }
}
