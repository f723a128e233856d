//! The exactly-once backfill decision rendezvous.
//!
//! N shards each deliver a per-shard metainfo, but the caller's
//! `should_backfill` must be consulted exactly once for the whole aggregator.
//! Every shard's offer merges its metainfo into the combined map and
//! decrements a countdown; the offer that reaches zero takes the decision
//! closure, invokes it on the combined map, and pulses the shared promise.
//! Every offer then waits on the promise and returns the one decision to its
//! store.
//!
//! The merge runs under the mutex and does not suspend; the wait is
//! interruptible and also unblocks when a sibling shard fails before
//! offering, so a partial fan-out can never strand the waiters.

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::protocol::{Blob, Metainfo};
use crate::region::{Region, RegionMap};
use crate::worker::signal::{Promise, Signal};

/// The caller's decision function; taken exactly once.
pub(crate) type DecisionFn = Box<dyn FnOnce(&Metainfo) -> bool + Send>;

pub(crate) struct BackfillRendezvous {
    state: Mutex<RendezvousState>,
    result: Promise<bool>,
    /// Pulsed when a shard fails before offering its metainfo; releases the
    /// waiters so the fan-out can join and surface the failure.
    abandoned: Signal,
    wait_slice: Duration,
}

struct RendezvousState {
    countdown: usize,
    start_domain: Region,
    combined: Metainfo,
    decide: Option<DecisionFn>,
}

impl BackfillRendezvous {
    pub(crate) fn new(
        num_shards: usize,
        start_domain: Region,
        decide: DecisionFn,
        wait_slice: Duration,
    ) -> Self {
        assert!(num_shards > 0, "backfill rendezvous needs at least one shard");
        let combined = RegionMap::with_default(&start_domain, Blob::new());
        Self {
            state: Mutex::new(RendezvousState {
                countdown: num_shards,
                start_domain,
                combined,
                decide: Some(decide),
            }),
            result: Promise::new(),
            abandoned: Signal::new(),
            wait_slice,
        }
    }

    /// Delivers one shard's metainfo and blocks until the combined decision
    /// is available. Returns `Interrupted` if the caller's interruptor pulses
    /// or a sibling abandons the rendezvous first.
    pub(crate) fn offer(&self, shard_metainfo: Metainfo, interruptor: &Signal) -> Result<bool> {
        let verdict = {
            let mut state = self.state.lock();
            let clipped = shard_metainfo.mask(&state.start_domain);
            state.combined.update(clipped);
            assert!(state.countdown > 0, "backfill rendezvous overran its shard count");
            state.countdown -= 1;
            if state.countdown == 0 {
                let decide = state.decide.take().expect("backfill decision already taken");
                Some(decide(&state.combined))
            } else {
                None
            }
        };
        if let Some(verdict) = verdict {
            self.result.pulse(verdict);
        }
        self.result
            .wait_interruptible(&[interruptor, &self.abandoned], self.wait_slice)
    }

    /// Called by a shard that fails before offering; unblocks the waiters.
    pub(crate) fn abandon(&self) {
        self.abandoned.pulse();
    }

    /// The decision after a clean join. Panics if the rendezvous never
    /// completed; callers check interruption and shard failures first.
    pub(crate) fn verdict(&self) -> bool {
        assert!(
            self.result.is_pulsed(),
            "backfill rendezvous joined without a decision"
        );
        self.result.wait()
    }
}
