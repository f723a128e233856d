//! spanstore: sharded store aggregation.
//!
//! One logical view over N per-shard stores covering a key-space region.
//! Each store is pinned to a home worker and only ever touched from there;
//! the aggregator fans every operation out to the relevant shards in
//! parallel, preserves per-shard FIFO token order, folds the per-shard
//! results into one response, and propagates interruption deterministically.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Multistore<P>                                │
//! │   ├─ StoreSubview per shard (region-clipped)  │
//! │   ├─ BackfillRendezvous (exactly-once decide) │
//! │   └─ pmap fan-out + post-join interrupt check │
//! ├───────────────────────────────────────────────┤
//! │  WorkerPool (home-worker dispatch)            │
//! │  FifoQueue  (mint-ordered admission tokens)   │
//! │  Signal / CrossWorkerSignal / Promise         │
//! ├───────────────────────────────────────────────┤
//! │  StoreView<P> (per-shard store contract)      │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The aggregator is generic over a [`protocol::Protocol`]; the key-value
//! instantiation lives in [`protocol::kv`], and [`store::MemStore`] is the
//! in-memory engine backing it.

pub mod config;
pub mod error;
pub mod multistore;
pub mod protocol;
pub mod region;
pub mod store;
pub mod worker;

pub use crate::config::Config;
pub use crate::error::{Result, SpanError};
pub use crate::multistore::Multistore;
pub use crate::protocol::{
    Blob, BranchId, Metainfo, MetainfoChecker, OrderSource, OrderToken, Protocol, StateTimestamp,
    Version, VersionRange,
};
pub use crate::region::{cpu_sharding_subspace, Region, RegionMap, Span};
pub use crate::store::{BackfillProgress, MemStore, StoreSubview, StoreView};
pub use crate::worker::fifo::{FifoQueue, ReadToken, WriteToken};
pub use crate::worker::signal::{CrossWorkerSignal, Promise, Signal};
pub use crate::worker::{current_worker, WorkerId, WorkerPool};
