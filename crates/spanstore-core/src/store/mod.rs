//! The single-shard store contract the aggregator consumes.
//!
//! A [`StoreView`] owns one shard of the key space. It is pinned to a home
//! worker and must only be invoked from there; FIFO tokens minted from it
//! serialize entry into its read/write critical sections in mint order. The
//! aggregator never sees past this trait: [`crate::store::StoreSubview`]
//! restricts a store to a sub-region, and [`crate::store::MemStore`] is the
//! in-memory engine backing the key-value protocol.

pub mod memory;
pub mod subview;

pub use memory::MemStore;
pub use subview::StoreSubview;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::protocol::{
    Metainfo, MetainfoChecker, OrderToken, Protocol, ReadResponseOf, StateTimestamp,
    WriteResponseOf,
};
use crate::region::{Region, RegionMap};
use crate::worker::fifo::{ReadToken, WriteToken};
use crate::worker::signal::Signal;
use crate::worker::WorkerId;

/// Decides, from the combined metainfo, whether a backfill should stream.
/// Called exactly once per `send_backfill`.
pub type ShouldBackfillFn<'a> = dyn Fn(&Metainfo) -> Result<bool> + Sync + 'a;

/// Receives streamed backfill chunks; may be invoked many times.
pub type ChunkFn<'a, P> = dyn Fn(<P as Protocol>::BackfillChunk) -> Result<()> + Sync + 'a;

pub trait StoreView<P: Protocol>: Send + Sync {
    /// The only worker this store may be invoked from. Immutable.
    fn home_worker(&self) -> WorkerId;

    /// The sub-region this store covers.
    fn region(&self) -> Region;

    /// Mints the next read admission token. Home worker only.
    fn new_read_token(&self) -> ReadToken;

    /// Mints the next write admission token. Home worker only.
    fn new_write_token(&self) -> WriteToken;

    fn metainfo(
        &self,
        order: OrderToken,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<Metainfo>;

    fn set_metainfo(
        &self,
        new_metainfo: Metainfo,
        order: OrderToken,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<()>;

    fn read(
        &self,
        checker: &MetainfoChecker,
        read: P::Read,
        order: OrderToken,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<ReadResponseOf<P>>;

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        checker: &MetainfoChecker,
        new_metainfo: Metainfo,
        write: P::Write,
        timestamp: StateTimestamp,
        order: OrderToken,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<WriteResponseOf<P>>;

    /// Streams the changes since `start_point` as backfill chunks.
    /// `should_backfill` is consulted exactly once before any chunk is sent;
    /// the return value equals its decision.
    fn send_backfill(
        &self,
        start_point: RegionMap<StateTimestamp>,
        should_backfill: &ShouldBackfillFn<'_>,
        chunk_fun: &ChunkFn<'_, P>,
        progress: &BackfillProgress,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<bool>;

    fn receive_backfill(
        &self,
        chunk: P::BackfillChunk,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<()>;

    /// Drops the data in `subregion` and installs `new_metainfo`.
    fn reset_data(
        &self,
        subregion: Region,
        new_metainfo: Metainfo,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<()>;
}

/// Streaming counters for one backfill send.
#[derive(Debug, Default)]
pub struct BackfillProgress {
    chunks_delivered: AtomicU64,
    entries_streamed: AtomicU64,
}

impl BackfillProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&self, entries: usize) {
        self.chunks_delivered.fetch_add(1, Ordering::Relaxed);
        self.entries_streamed
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn chunks_delivered(&self) -> u64 {
        self.chunks_delivered.load(Ordering::Relaxed)
    }

    pub fn entries_streamed(&self) -> u64 {
        self.entries_streamed.load(Ordering::Relaxed)
    }
}
