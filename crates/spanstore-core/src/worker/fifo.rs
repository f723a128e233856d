//! Mint-ordered admission into a store's critical section.
//!
//! A [`FifoQueue`] mints single-use read and write tokens carrying sequence
//! numbers; tokens are admitted strictly in mint order, one at a time. A
//! token is consumed exactly once on every path: by entering the critical
//! section ([`FifoQueue::enter_read`] / [`FifoQueue::enter_write`]), by an
//! explicit release, by an interrupted wait, or by being dropped. A released
//! or dropped sequence number is skipped over so later tokens never stall.
//!
//! Admission may be split from entry: [`ReadToken::admit`] waits for the
//! token's turn on the calling task's thread, and a later `enter_*` on the
//! admitted token is immediate. The aggregator admits before hopping to a
//! store's home worker so an out-of-order arrival blocks only the task that
//! brought it, never the worker's mailbox.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SpanError};
use crate::worker::signal::Signal;

#[derive(Clone)]
pub struct FifoQueue {
    inner: Arc<FifoInner>,
}

struct FifoInner {
    state: Mutex<FifoState>,
    cond: Condvar,
    wait_slice: Duration,
}

struct FifoState {
    next_mint: u64,
    next_admit: u64,
    abandoned: BTreeSet<u64>,
}

impl FifoQueue {
    pub fn new(wait_slice: Duration) -> Self {
        Self {
            inner: Arc::new(FifoInner {
                state: Mutex::new(FifoState {
                    next_mint: 0,
                    next_admit: 0,
                    abandoned: BTreeSet::new(),
                }),
                cond: Condvar::new(),
                wait_slice,
            }),
        }
    }

    pub fn read_token(&self) -> ReadToken {
        ReadToken(self.mint())
    }

    pub fn write_token(&self) -> WriteToken {
        WriteToken(self.mint())
    }

    /// Consumes the token and holds the critical section until the guard
    /// drops. Waits for the token's turn unless it was already admitted.
    pub fn enter_read(&self, token: ReadToken, interruptor: &Signal) -> Result<FifoGuard> {
        self.enter(token.0, interruptor)
    }

    pub fn enter_write(&self, token: WriteToken, interruptor: &Signal) -> Result<FifoGuard> {
        self.enter(token.0, interruptor)
    }

    fn mint(&self) -> FifoToken {
        let mut state = self.inner.state.lock();
        let seq = state.next_mint;
        state.next_mint += 1;
        FifoToken {
            seq,
            admitted: false,
            queue: Some(self.clone()),
        }
    }

    fn enter(&self, mut token: FifoToken, interruptor: &Signal) -> Result<FifoGuard> {
        let queue = token
            .queue
            .take()
            .expect("fifo token consumed twice");
        debug_assert!(
            Arc::ptr_eq(&queue.inner, &self.inner),
            "fifo token entered on a foreign queue"
        );
        if token.admitted {
            return Ok(FifoGuard {
                queue: self.clone(),
            });
        }
        self.wait_turn(token.seq, interruptor)?;
        Ok(FifoGuard {
            queue: self.clone(),
        })
    }

    /// Blocks until `seq` is next in line. An interrupted wait abandons the
    /// sequence number so later tokens are not stalled.
    fn wait_turn(&self, seq: u64, interruptor: &Signal) -> Result<()> {
        let mut state = self.inner.state.lock();
        loop {
            if state.next_admit == seq {
                return Ok(());
            }
            if interruptor.is_pulsed() {
                state.abandoned.insert(seq);
                Self::drain_abandoned(&mut state);
                self.inner.cond.notify_all();
                return Err(SpanError::Interrupted);
            }
            self.inner
                .cond
                .wait_for(&mut state, self.inner.wait_slice);
        }
    }

    /// Ends the admitted token's critical section.
    fn exit(&self) {
        let mut state = self.inner.state.lock();
        state.next_admit += 1;
        Self::drain_abandoned(&mut state);
        self.inner.cond.notify_all();
    }

    /// Marks an unadmitted sequence number consumed-without-entry.
    fn abandon(&self, seq: u64) {
        let mut state = self.inner.state.lock();
        state.abandoned.insert(seq);
        Self::drain_abandoned(&mut state);
        self.inner.cond.notify_all();
    }

    fn drain_abandoned(state: &mut FifoState) {
        while state.abandoned.remove(&state.next_admit) {
            state.next_admit += 1;
        }
    }

    /// Sequence number next in line; everything below it has been consumed.
    #[cfg(test)]
    pub(crate) fn admitted_up_to(&self) -> u64 {
        self.inner.state.lock().next_admit
    }
}

struct FifoToken {
    seq: u64,
    admitted: bool,
    queue: Option<FifoQueue>,
}

impl FifoToken {
    fn admit(mut self, interruptor: &Signal) -> Result<Self> {
        if self.admitted {
            return Ok(self);
        }
        let queue = self.queue.take().expect("fifo token consumed twice");
        queue.wait_turn(self.seq, interruptor)?;
        Ok(Self {
            seq: self.seq,
            admitted: true,
            queue: Some(queue),
        })
    }
}

impl Drop for FifoToken {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            if self.admitted {
                queue.exit();
            } else {
                queue.abandon(self.seq);
            }
        }
    }
}

/// Single-use admission ticket for a read critical section.
pub struct ReadToken(FifoToken);

/// Single-use admission ticket for a write critical section.
pub struct WriteToken(FifoToken);

impl ReadToken {
    /// Waits for this token's turn without entering the critical section; the
    /// following `enter_read` is then immediate. An interrupted wait consumes
    /// the token.
    pub fn admit(self, interruptor: &Signal) -> Result<ReadToken> {
        Ok(ReadToken(self.0.admit(interruptor)?))
    }

    /// Consumes the token without running an operation. Dropping has the same
    /// effect; the name marks the deliberate paths.
    pub fn release(self) {}
}

impl WriteToken {
    pub fn admit(self, interruptor: &Signal) -> Result<WriteToken> {
        Ok(WriteToken(self.0.admit(interruptor)?))
    }

    pub fn release(self) {}
}

/// Holds the critical section; dropping admits the next token in mint order.
pub struct FifoGuard {
    queue: FifoQueue,
}

impl Drop for FifoGuard {
    fn drop(&mut self) {
        self.queue.exit();
    }
}
