//! In-memory store engine backing the key-value protocol.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Result, SpanError};
use crate::protocol::kv::{KvChunk, KvEntry, KvProtocol, KvRead, KvReadResponse, KvWrite, KvWriteResponse};
use crate::protocol::{
    Metainfo, MetainfoChecker, OrderToken, StateTimestamp, Version, VersionRange,
};
use crate::region::{Region, RegionMap};
use crate::store::{BackfillProgress, ChunkFn, ShouldBackfillFn, StoreView};
use crate::worker::fifo::{FifoQueue, ReadToken, WriteToken};
use crate::worker::signal::Signal;
use crate::worker::{current_worker, WorkerId};

/// A worker-pinned shard store holding versioned entries in a `BTreeMap`.
///
/// Every operation asserts it runs on the home worker and passes through the
/// FIFO queue, so calls are serialized in token mint order. Metainfo starts
/// as the coherent zero version over the whole covered region.
pub struct MemStore {
    home: WorkerId,
    region: Region,
    fifo: FifoQueue,
    backfill_chunk_entries: usize,
    state: Mutex<MemState>,
    stats: StatCounters,
}

struct MemState {
    data: BTreeMap<u64, (Vec<u8>, StateTimestamp)>,
    metainfo: Metainfo,
}

#[derive(Default)]
struct StatCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    backfills_sent: AtomicU64,
    chunks_received: AtomicU64,
}

/// Point-in-time copy of a store's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStoreStats {
    pub reads: u64,
    pub writes: u64,
    pub backfills_sent: u64,
    pub chunks_received: u64,
}

impl MemStore {
    pub fn new(home: WorkerId, region: Region, config: &Config) -> Arc<Self> {
        let metainfo =
            Metainfo::with_default(&region, VersionRange::coherent(Version::zero()).to_blob());
        Arc::new(Self {
            home,
            region,
            fifo: FifoQueue::new(config.wait_slice()),
            backfill_chunk_entries: config.backfill_chunk_entries,
            state: Mutex::new(MemState {
                data: BTreeMap::new(),
                metainfo,
            }),
            stats: StatCounters::default(),
        })
    }

    pub fn stats(&self) -> MemStoreStats {
        MemStoreStats {
            reads: self.stats.reads.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            backfills_sent: self.stats.backfills_sent.load(Ordering::Relaxed),
            chunks_received: self.stats.chunks_received.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn fifo_queue(&self) -> &FifoQueue {
        &self.fifo
    }

    fn assert_home(&self) {
        debug_assert_eq!(
            current_worker(),
            Some(self.home),
            "store touched off its home worker"
        );
    }
}

impl StoreView<KvProtocol> for MemStore {
    fn home_worker(&self) -> WorkerId {
        self.home
    }

    fn region(&self) -> Region {
        self.region.clone()
    }

    fn new_read_token(&self) -> ReadToken {
        self.assert_home();
        self.fifo.read_token()
    }

    fn new_write_token(&self) -> WriteToken {
        self.assert_home();
        self.fifo.write_token()
    }

    fn metainfo(
        &self,
        _order: OrderToken,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<Metainfo> {
        self.assert_home();
        let _guard = self.fifo.enter_read(token, interruptor)?;
        Ok(self.state.lock().metainfo.clone())
    }

    fn set_metainfo(
        &self,
        new_metainfo: Metainfo,
        _order: OrderToken,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<()> {
        self.assert_home();
        let _guard = self.fifo.enter_write(token, interruptor)?;
        self.state.lock().metainfo.update(new_metainfo);
        Ok(())
    }

    fn read(
        &self,
        checker: &MetainfoChecker,
        read: KvRead,
        _order: OrderToken,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<KvReadResponse> {
        self.assert_home();
        let _guard = self.fifo.enter_read(token, interruptor)?;
        let state = self.state.lock();
        checker.check(&state.metainfo)?;
        let mut entries = Vec::new();
        for span in read.region.spans() {
            for (&key, (value, timestamp)) in state.data.range(span.lo..span.hi) {
                entries.push(KvEntry::new(key, value.clone(), *timestamp));
            }
        }
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(KvReadResponse { entries })
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        checker: &MetainfoChecker,
        new_metainfo: Metainfo,
        write: KvWrite,
        timestamp: StateTimestamp,
        _order: OrderToken,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<KvWriteResponse> {
        self.assert_home();
        let _guard = self.fifo.enter_write(token, interruptor)?;
        let mut state = self.state.lock();
        checker.check(&state.metainfo)?;
        debug_assert!(
            self.region.is_superset(&write.region),
            "write region escapes the store's region"
        );
        let written = write.entries.len();
        for (key, value) in write.entries {
            state.data.insert(key, (value, timestamp));
        }
        state.metainfo.update(new_metainfo);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(KvWriteResponse { written })
    }

    fn send_backfill(
        &self,
        start_point: RegionMap<StateTimestamp>,
        should_backfill: &ShouldBackfillFn<'_>,
        chunk_fun: &ChunkFn<'_, KvProtocol>,
        progress: &BackfillProgress,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<bool> {
        self.assert_home();
        let _guard = self.fifo.enter_read(token, interruptor)?;
        debug_assert!(
            self.region.is_superset(&start_point.get_domain()),
            "backfill start point escapes the store's region"
        );

        // Snapshot under the lock; the decision callback below may block on
        // the aggregator's rendezvous.
        let (metainfo, pending) = {
            let state = self.state.lock();
            let mut pending = Vec::new();
            for (span, since) in start_point.iter() {
                let newer: Vec<KvEntry> = state
                    .data
                    .range(span.lo..span.hi)
                    .filter(|(_, (_, ts))| ts > since)
                    .map(|(&key, (value, ts))| KvEntry::new(key, value.clone(), *ts))
                    .collect();
                if !newer.is_empty() {
                    pending.push((span, newer));
                }
            }
            (state.metainfo.clone(), pending)
        };

        if !should_backfill(&metainfo)? {
            return Ok(false);
        }

        self.stats.backfills_sent.fetch_add(1, Ordering::Relaxed);
        for (span, entries) in pending {
            for batch in entries.chunks(self.backfill_chunk_entries) {
                if interruptor.is_pulsed() {
                    return Err(SpanError::Interrupted);
                }
                chunk_fun(KvChunk {
                    region: Region::range(span.lo, span.hi),
                    entries: batch.to_vec(),
                })?;
                progress.record_chunk(batch.len());
            }
        }
        Ok(true)
    }

    fn receive_backfill(
        &self,
        chunk: KvChunk,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<()> {
        self.assert_home();
        let _guard = self.fifo.enter_write(token, interruptor)?;
        let mut state = self.state.lock();
        for entry in chunk.entries {
            // A newer local version wins over the incoming one.
            let keep_existing = state
                .data
                .get(&entry.key)
                .is_some_and(|(_, existing)| *existing >= entry.timestamp);
            if !keep_existing {
                state.data.insert(entry.key, (entry.value, entry.timestamp));
            }
        }
        self.stats.chunks_received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reset_data(
        &self,
        subregion: Region,
        new_metainfo: Metainfo,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<()> {
        self.assert_home();
        let _guard = self.fifo.enter_write(token, interruptor)?;
        let mut state = self.state.lock();
        state.data.retain(|key, _| !subregion.contains_key(*key));
        state.metainfo.update(new_metainfo);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerPool;

    fn fixture() -> (Arc<WorkerPool>, Arc<MemStore>, Config) {
        let config = Config {
            workers: 1,
            backfill_chunk_entries: 2,
            ..Config::default()
        };
        let pool = Arc::new(WorkerPool::new(config.clone()).unwrap());
        let store = MemStore::new(WorkerId(0), Region::range(0, 1000), &config);
        (pool, store, config)
    }

    fn on_home<R: Send + 'static>(
        pool: &WorkerPool,
        f: impl FnOnce() -> Result<R> + Send + 'static,
    ) -> R {
        pool.run_on(WorkerId(0), f).unwrap().unwrap()
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (pool, store, _) = fixture();
        let s = store.clone();
        let keys = on_home(&pool, move || {
            let never = Signal::new();
            let wtok = s.new_write_token();
            let resp = s.write(
                &MetainfoChecker::empty(),
                Metainfo::new(),
                KvWrite::over(
                    Region::range(0, 100),
                    vec![(5, b"a".to_vec()), (7, b"b".to_vec())],
                ),
                StateTimestamp(1),
                OrderToken::ignore(),
                wtok,
                &never,
            )?;
            assert_eq!(resp.written, 2);
            let rtok = s.new_read_token();
            let read = s.read(
                &MetainfoChecker::empty(),
                KvRead::over(Region::range(0, 1000)),
                OrderToken::ignore(),
                rtok,
                &never,
            )?;
            Ok(read.entries.into_iter().map(|e| e.key).collect::<Vec<_>>())
        });
        assert_eq!(keys, vec![5, 7]);
        assert_eq!(store.stats().writes, 1);
        assert_eq!(store.stats().reads, 1);
    }

    #[test]
    fn test_metainfo_set_then_get() {
        let (pool, store, _) = fixture();
        let s = store.clone();
        let fetched = on_home(&pool, move || {
            let never = Signal::new();
            let wtok = s.new_write_token();
            let installed = Metainfo::over_range(
                0,
                1000,
                VersionRange::coherent(Version {
                    branch: crate::protocol::BranchId(9),
                    timestamp: StateTimestamp(4),
                })
                .to_blob(),
            );
            s.set_metainfo(installed.clone(), OrderToken::ignore(), wtok, &never)?;
            let rtok = s.new_read_token();
            let fetched = s.metainfo(OrderToken::ignore(), rtok, &never)?;
            Ok((installed, fetched))
        });
        assert_eq!(fetched.0, fetched.1);
    }

    #[test]
    fn test_checker_mismatch_rejected() {
        let (pool, store, _) = fixture();
        let s = store.clone();
        let err = pool
            .run_on(WorkerId(0), move || {
                let never = Signal::new();
                let rtok = s.new_read_token();
                let checker = MetainfoChecker::new(Metainfo::over_range(0, 10, b"wrong".to_vec()));
                s.read(
                    &checker,
                    KvRead::over(Region::range(0, 10)),
                    OrderToken::ignore(),
                    rtok,
                    &never,
                )
            })
            .unwrap();
        assert!(matches!(err, Err(SpanError::MetainfoMismatch(_))));
    }

    #[test]
    fn test_backfill_streams_only_newer_entries() {
        let (pool, store, _) = fixture();
        let s = store.clone();
        let chunks = on_home(&pool, move || {
            let never = Signal::new();
            let wtok = s.new_write_token();
            s.receive_backfill(
                KvChunk {
                    region: Region::range(0, 1000),
                    entries: vec![
                        KvEntry::new(1, "old", StateTimestamp(1)),
                        KvEntry::new(2, "new", StateTimestamp(5)),
                        KvEntry::new(3, "new", StateTimestamp(6)),
                        KvEntry::new(4, "new", StateTimestamp(7)),
                    ],
                },
                wtok,
                &never,
            )?;
            let rtok = s.new_read_token();
            let start = RegionMap::over_range(0, 1000, StateTimestamp(2));
            let collected = Mutex::new(Vec::new());
            let progress = BackfillProgress::new();
            let sent = s.send_backfill(
                start,
                &|_meta| Ok(true),
                &|chunk: KvChunk| {
                    collected.lock().extend(chunk.entries);
                    Ok(())
                },
                &progress,
                rtok,
                &never,
            )?;
            assert!(sent);
            // Entries 2..4 pass the since-filter; chunk size 2 gives 2 chunks.
            assert_eq!(progress.chunks_delivered(), 2);
            assert_eq!(progress.entries_streamed(), 3);
            Ok(collected.into_inner())
        });
        let keys: Vec<u64> = chunks.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![2, 3, 4]);
    }

    #[test]
    fn test_backfill_declined_sends_no_chunks() {
        let (pool, store, _) = fixture();
        let s = store.clone();
        let sent = on_home(&pool, move || {
            let never = Signal::new();
            let rtok = s.new_read_token();
            s.send_backfill(
                RegionMap::over_range(0, 1000, StateTimestamp::ZERO),
                &|_meta| Ok(false),
                &|_chunk: KvChunk| panic!("no chunks expected after a declined backfill"),
                &BackfillProgress::new(),
                rtok,
                &never,
            )
        });
        assert!(!sent);
    }

    #[test]
    fn test_receive_backfill_keeps_newer_local_entry() {
        let (pool, store, _) = fixture();
        let s = store.clone();
        let value = on_home(&pool, move || {
            let never = Signal::new();
            let wtok = s.new_write_token();
            s.receive_backfill(
                KvChunk {
                    region: Region::range(0, 10),
                    entries: vec![KvEntry::new(1, "newer", StateTimestamp(9))],
                },
                wtok,
                &never,
            )?;
            let wtok = s.new_write_token();
            s.receive_backfill(
                KvChunk {
                    region: Region::range(0, 10),
                    entries: vec![KvEntry::new(1, "stale", StateTimestamp(3))],
                },
                wtok,
                &never,
            )?;
            let rtok = s.new_read_token();
            let resp = s.read(
                &MetainfoChecker::empty(),
                KvRead::over(Region::range(0, 10)),
                OrderToken::ignore(),
                rtok,
                &never,
            )?;
            Ok(resp.entries[0].value.clone())
        });
        assert_eq!(value, b"newer");
    }

    #[test]
    fn test_reset_data_clears_subregion() {
        let (pool, store, _) = fixture();
        let s = store.clone();
        let keys = on_home(&pool, move || {
            let never = Signal::new();
            let wtok = s.new_write_token();
            s.write(
                &MetainfoChecker::empty(),
                Metainfo::new(),
                KvWrite::over(
                    Region::range(0, 1000),
                    vec![(10, b"x".to_vec()), (500, b"y".to_vec())],
                ),
                StateTimestamp(1),
                OrderToken::ignore(),
                wtok,
                &never,
            )?;
            let wtok = s.new_write_token();
            s.reset_data(Region::range(0, 100), Metainfo::new(), wtok, &never)?;
            let rtok = s.new_read_token();
            let resp = s.read(
                &MetainfoChecker::empty(),
                KvRead::over(Region::range(0, 1000)),
                OrderToken::ignore(),
                rtok,
                &never,
            )?;
            Ok(resp.entries.into_iter().map(|e| e.key).collect::<Vec<_>>())
        });
        assert_eq!(keys, vec![500]);
    }

    #[test]
    fn test_interrupted_admission_surfaces() {
        let (pool, store, _) = fixture();
        let s = store.clone();
        let err = pool
            .run_on(WorkerId(0), move || {
                let pulsed = Signal::new();
                // An outstanding earlier token forces tok2 to wait, and the
                // pulsed interruptor cancels that wait.
                let _tok1 = s.new_read_token();
                let tok2 = s.new_read_token();
                pulsed.pulse();
                s.metainfo(OrderToken::ignore(), tok2, &pulsed)
            })
            .unwrap();
        assert!(matches!(err, Err(SpanError::Interrupted)));
    }
}
