//! # Write Gate
//!
//! Draining barrier between frame writes on the device delivery thread and the
//! stop path that is about to close the recording files.
//!
//! Admission (`receiving`) and the in-flight marker (`writing`) live under a
//! single lock so a write can never be admitted after the stop path has seen
//! the gate idle. A write that has already started always runs to completion.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct GateState {
    receiving: bool,
    writing: bool,
}

#[derive(Debug)]
pub struct WriteGate {
    state: Mutex<GateState>,
    idle: Condvar,
    poll_interval: Duration,
}

/// Marks one write as in flight. Dropping it clears the marker, including
/// when the write failed.
#[must_use = "the write is only protected while the guard is alive"]
pub struct WriteGuard<'a> {
    gate: &'a WriteGate,
}

impl WriteGate {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            idle: Condvar::new(),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // A panic inside a guarded section leaves two booleans behind; both stay meaningful.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start admitting writes
    pub fn open(&self) {
        self.lock().receiving = true;
    }

    pub fn is_receiving(&self) -> bool {
        self.lock().receiving
    }

    pub fn is_writing(&self) -> bool {
        self.lock().writing
    }

    /// Admit one write, or `None` if the gate is closed.
    pub fn begin_write(&self) -> Option<WriteGuard<'_>> {
        let mut state = self.lock();
        if !state.receiving {
            return None;
        }
        state.writing = true;
        Some(WriteGuard { gate: self })
    }

    /// Stop admitting writes without waiting for the current one
    pub fn halt(&self) {
        self.lock().receiving = false;
    }

    /// Stop admitting writes and block until no write is in flight.
    ///
    /// Waits on the condition variable but re-checks at least every poll
    /// interval.
    pub fn close_and_drain(&self) {
        let mut state = self.lock();
        state.receiving = false;
        while state.writing {
            log::debug!("Waiting for in-flight write to finish");
            state = match self.idle.wait_timeout(state, self.poll_interval) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn end_write(&self) {
        self.lock().writing = false;
        self.idle.notify_all();
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.gate.end_write();
    }
}
