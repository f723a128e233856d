//! Cancellation signals and single-assignment promises.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SpanError};
use crate::worker::WorkerId;

/// A one-shot pulse observable from any thread. Cloning yields another handle
/// to the same signal.
#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    pulsed: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pulse(&self) {
        if !self.inner.pulsed.swap(true, Ordering::SeqCst) {
            let _guard = self.inner.lock.lock();
            self.inner.cond.notify_all();
        }
    }

    pub fn is_pulsed(&self) -> bool {
        self.inner.pulsed.load(Ordering::SeqCst)
    }

    /// Blocks until the signal is pulsed.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock();
        while !self.is_pulsed() {
            self.inner.cond.wait(&mut guard);
        }
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("pulsed", &self.is_pulsed())
            .finish()
    }
}

/// A caller's interruptor mirrored onto another worker for the duration of one
/// shard call. The handle carries the target worker so the shard side can
/// assert it observes the pulse from its home worker.
#[derive(Debug, Clone)]
pub struct CrossWorkerSignal {
    mirrored: Signal,
    worker: WorkerId,
}

impl CrossWorkerSignal {
    pub fn new(source: &Signal, worker: WorkerId) -> Self {
        Self {
            mirrored: source.clone(),
            worker,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// The signal handle to hand to the shard-side operation.
    pub fn handle(&self) -> &Signal {
        &self.mirrored
    }
}

/// A single-assignment value: pulsed once, read by any number of waiters.
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PromiseInner<T> {
    state: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                state: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Assigns the value. Panics on a second assignment.
    pub fn pulse(&self, value: T) {
        let mut state = self.inner.state.lock();
        assert!(state.is_none(), "promise pulsed twice");
        *state = Some(value);
        self.inner.cond.notify_all();
    }

    pub fn is_pulsed(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// Blocks until the value is assigned.
    pub fn wait(&self) -> T {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.as_ref() {
                return value.clone();
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Blocks until the value is assigned or any of `interruptors` pulses.
    /// Re-checks the interruptors at least every `wait_slice`.
    pub fn wait_interruptible(&self, interruptors: &[&Signal], wait_slice: Duration) -> Result<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.as_ref() {
                return Ok(value.clone());
            }
            if interruptors.iter().any(|s| s.is_pulsed()) {
                return Err(SpanError::Interrupted);
            }
            self.inner.cond.wait_for(&mut state, wait_slice);
        }
    }
}
