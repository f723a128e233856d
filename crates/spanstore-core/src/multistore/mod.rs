//! The multistore aggregator: one logical view over N worker-pinned shards.
//!
//! A [`Multistore`] owns one [`StoreSubview`] per shard, each clipped to
//! `region ∩ cpu_sharding_subspace(i, n)`. Every operation fans out to the
//! relevant shards in parallel, hops to each shard's home worker, preserves
//! per-shard FIFO token order, folds the per-shard responses back into one
//! logical response, and propagates interruption deterministically: per-shard
//! interruption is swallowed so the fan-out always reaches a clean join, and
//! the caller's own interruptor is checked once after it.
//!
//! Shards that committed their portion before a cancellation stay committed;
//! recovering from such partial commits is the caller's concern.

mod backfill;

use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, SpanError};
use crate::protocol::{
    Metainfo, MetainfoChecker, OrderToken, Protocol, ReadRequest, ReadResponseOf, Sharded,
    StateTimestamp, VersionRange, WriteRequest, WriteResponseOf,
};
use crate::region::{cpu_sharding_subspace, Region, RegionMap};
use crate::store::{BackfillProgress, StoreSubview, StoreView};
use crate::worker::fifo::{ReadToken, WriteToken};
use crate::worker::pmap::pmap;
use crate::worker::signal::{CrossWorkerSignal, Signal};
use crate::worker::WorkerPool;

use backfill::BackfillRendezvous;

pub struct Multistore<P: Protocol> {
    pool: Arc<WorkerPool>,
    region: Region,
    subviews: Vec<StoreSubview<P>>,
}

impl<P: Protocol> Multistore<P> {
    /// Builds the aggregator over `stores`, covering `region`. Each subview
    /// is constructed in parallel on its store's home worker.
    ///
    /// `region` must lie inside the join of the store regions, and store `i`
    /// must cover `region ∩ cpu_sharding_subspace(i, n)`.
    pub fn new(
        pool: Arc<WorkerPool>,
        stores: Vec<Arc<dyn StoreView<P>>>,
        region: Region,
    ) -> Result<Self> {
        assert!(!stores.is_empty(), "multistore needs at least one store");
        let joined = stores
            .iter()
            .fold(Region::empty(), |acc, store| acc.join(&store.region()));
        assert!(
            joined.is_superset(&region),
            "multistore region must lie inside the joined store regions"
        );

        let n = stores.len();
        debug!(shards = n, "building multistore");
        let slots: Vec<Mutex<Option<StoreSubview<P>>>> = (0..n).map(|_| Mutex::new(None)).collect();
        let failure = Mutex::new(None);
        pmap(n, |i| {
            let store = stores[i].clone();
            let dest = store.home_worker();
            let mask = region.intersect(&store.region());
            match pool.run_on(dest, move || StoreSubview::new(store, mask)) {
                Ok(subview) => *slots[i].lock() = Some(subview),
                Err(err) => record_failure(&failure, err),
            }
        });
        if let Some(err) = failure.into_inner() {
            // Tear down whatever was already built before surfacing.
            destroy_subviews(&pool, &slots);
            return Err(err);
        }

        let subviews: Vec<StoreSubview<P>> = slots
            .into_iter()
            .map(|slot| slot.into_inner().expect("every subview constructed"))
            .collect();
        let multistore = Self {
            pool,
            region,
            subviews,
        };
        multistore.debug_assert_shard_partition();
        Ok(multistore)
    }

    /// A new aggregator over a sub-region of this one, with an independent
    /// lifetime. `region` must lie inside this aggregator's region.
    pub fn narrow(&self, region: Region) -> Result<Self> {
        assert!(
            self.region.is_superset(&region),
            "narrowed region must lie inside the aggregator's region"
        );
        let stores: Vec<Arc<dyn StoreView<P>>> = self
            .subviews
            .iter()
            .map(|subview| Arc::new(subview.clone()) as Arc<dyn StoreView<P>>)
            .collect();
        Self::new(self.pool.clone(), stores, region)
    }

    pub fn num_stores(&self) -> usize {
        self.subviews.len()
    }

    /// The joined region the aggregator covers.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// The sub-region shard `i` is responsible for:
    /// `region ∩ cpu_sharding_subspace(i, n)`.
    pub fn shard_region(&self, i: usize) -> Region {
        assert!(i < self.num_stores(), "shard index out of range");
        self.region
            .intersect(&cpu_sharding_subspace(i, self.num_stores()))
    }

    /// Fans `op` out across all shards, one item per shard, and joins. The
    /// shared completion policy lives here: per-shard interruption is
    /// swallowed so every task reaches the join, the caller's interruptor is
    /// checked once after it, and the first real shard failure surfaces.
    /// Results come back in shard-index order; shards that contribute
    /// nothing return `None` and are skipped.
    fn fan_out<T, R>(
        &self,
        items: Vec<T>,
        interruptor: &Signal,
        op: impl Fn(usize, T) -> Result<Option<R>> + Sync,
    ) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
    {
        assert_eq!(
            items.len(),
            self.num_stores(),
            "per-shard items must match the shard count"
        );
        let results = Mutex::new(Vec::new());
        let failure = Mutex::new(None);
        let slots = into_slots(items);
        pmap(slots.len(), |i| {
            match op(i, take_slot(&slots, i)) {
                Ok(Some(result)) => results.lock().push((i, result)),
                Ok(None) => {}
                Err(err) => record_failure(&failure, err),
            }
        });
        if interruptor.is_pulsed() {
            return Err(SpanError::Interrupted);
        }
        if let Some(err) = failure.into_inner() {
            return Err(err);
        }
        let mut results = results.into_inner();
        results.sort_by_key(|(i, _)| *i);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }

    /// Mints one read token per shard, each on its store's home worker.
    /// Slot order is shard order, not mint wall-clock order; callers that
    /// need cross-shard ordering mint all tokens of one logical operation in
    /// a single call.
    pub fn new_read_tokens(&self) -> Result<Vec<ReadToken>> {
        self.fan_out(vec![(); self.num_stores()], &Signal::new(), |i, ()| {
            let subview = self.subviews[i].clone();
            let dest = subview.home_worker();
            Ok(Some(self.pool.run_on(dest, move || subview.new_read_token())?))
        })
    }

    pub fn new_write_tokens(&self) -> Result<Vec<WriteToken>> {
        self.fan_out(vec![(); self.num_stores()], &Signal::new(), |i, ()| {
            let subview = self.subviews[i].clone();
            let dest = subview.home_worker();
            Ok(Some(self.pool.run_on(dest, move || subview.new_write_token())?))
        })
    }

    /// Fetches every shard's metainfo, decodes the blobs into version
    /// ranges, and merges them into one map whose domain is the whole
    /// region.
    pub fn get_all_metainfos(
        &self,
        order: OrderToken,
        read_tokens: Vec<ReadToken>,
        interruptor: &Signal,
    ) -> Result<RegionMap<VersionRange>> {
        let shard_maps = self.fan_out(read_tokens, interruptor, |i, token| {
            self.fetch_one_metainfo(i, order, token, interruptor)
        })?;
        let mut combined = RegionMap::new();
        for shard_map in shard_maps {
            combined.update(shard_map);
        }
        debug_assert_eq!(
            combined.get_domain(),
            self.region,
            "combined metainfo must cover the whole region"
        );
        Ok(combined)
    }

    fn fetch_one_metainfo(
        &self,
        i: usize,
        order: OrderToken,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<Option<RegionMap<VersionRange>>> {
        let subview = self.subviews[i].clone();
        let dest = subview.home_worker();
        let token = token.admit(interruptor)?;
        let mirrored = CrossWorkerSignal::new(interruptor, dest);
        let metainfo = self
            .pool
            .run_on(dest, move || {
                subview.metainfo(order, token, mirrored.handle())
            })??;
        let transformed = metainfo
            .mask(&self.shard_region(i))
            .try_transform(VersionRange::from_blob)?;
        Ok(Some(transformed))
    }

    /// Installs `new_metainfo` on every shard, each clipped to its region.
    pub fn set_all_metainfos(
        &self,
        new_metainfo: &Metainfo,
        order: OrderToken,
        write_tokens: Vec<WriteToken>,
        interruptor: &Signal,
    ) -> Result<()> {
        self.fan_out(write_tokens, interruptor, |i, token| {
            self.set_one_metainfo(i, new_metainfo, order, token, interruptor)
        })
        .map(|_: Vec<()>| ())
    }

    fn set_one_metainfo(
        &self,
        i: usize,
        new_metainfo: &Metainfo,
        order: OrderToken,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<Option<()>> {
        let subview = self.subviews[i].clone();
        let dest = subview.home_worker();
        let token = token.admit(interruptor)?;
        let mirrored = CrossWorkerSignal::new(interruptor, dest);
        let shard_metainfo = new_metainfo.mask(&self.shard_region(i));
        self.pool.run_on(dest, move || {
            subview.set_metainfo(shard_metainfo, order, token, mirrored.handle())
        })??;
        Ok(None)
    }

    /// Fans the read out to every shard it intersects and folds the per-shard
    /// responses with the protocol's `unshard`. Shards with an empty
    /// intersection still consume their token.
    pub fn read(
        &self,
        checker: &MetainfoChecker,
        read: P::Read,
        order: OrderToken,
        read_tokens: Vec<ReadToken>,
        interruptor: &Signal,
    ) -> Result<ReadResponseOf<P>> {
        let responses = self.fan_out(read_tokens, interruptor, |i, token| {
            self.shard_read(i, checker, &read, order, token, interruptor)
        })?;
        let mut cache = <P::Read as ReadRequest>::Cache::default();
        Ok(read.unshard(responses, &mut cache))
    }

    fn shard_read(
        &self,
        i: usize,
        checker: &MetainfoChecker,
        read: &P::Read,
        order: OrderToken,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<Option<ReadResponseOf<P>>> {
        let shard_region = self.shard_region(i);
        let intersection = shard_region.intersect(&read.region());
        let subview = self.subviews[i].clone();
        let dest = subview.home_worker();
        if intersection.is_empty() {
            // Single-use token: still consumed, on the shard's home worker.
            self.pool.run_on(dest, move || token.release())?;
            return Ok(None);
        }
        let token = token.admit(interruptor)?;
        let mirrored = CrossWorkerSignal::new(interruptor, dest);
        let shard_checker = checker.mask(&shard_region);
        let shard_read = read.shard(&intersection);
        let response = self
            .pool
            .run_on(dest, move || {
                subview.read(&shard_checker, shard_read, order, token, mirrored.handle())
            })??;
        Ok(Some(response))
    }

    /// Fans the write out to every shard it intersects, installing the
    /// clipped `new_metainfo` atomically with each shard's payload.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        checker: &MetainfoChecker,
        new_metainfo: &Metainfo,
        write: P::Write,
        timestamp: StateTimestamp,
        order: OrderToken,
        write_tokens: Vec<WriteToken>,
        interruptor: &Signal,
    ) -> Result<WriteResponseOf<P>> {
        let responses = self.fan_out(write_tokens, interruptor, |i, token| {
            self.shard_write(
                i,
                checker,
                new_metainfo,
                &write,
                timestamp,
                order,
                token,
                interruptor,
            )
        })?;
        let mut cache = <P::Write as WriteRequest>::Cache::default();
        Ok(write.unshard(responses, &mut cache))
    }

    #[allow(clippy::too_many_arguments)]
    fn shard_write(
        &self,
        i: usize,
        checker: &MetainfoChecker,
        new_metainfo: &Metainfo,
        write: &P::Write,
        timestamp: StateTimestamp,
        order: OrderToken,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<Option<WriteResponseOf<P>>> {
        let shard_region = self.shard_region(i);
        let intersection = shard_region.intersect(&write.region());
        let subview = self.subviews[i].clone();
        let dest = subview.home_worker();
        if intersection.is_empty() {
            self.pool.run_on(dest, move || token.release())?;
            return Ok(None);
        }
        let token = token.admit(interruptor)?;
        let mirrored = CrossWorkerSignal::new(interruptor, dest);
        let shard_checker = checker.mask(&shard_region);
        let shard_metainfo = new_metainfo.mask(&shard_region);
        let shard_write = write.shard(&intersection);
        let response = self
            .pool
            .run_on(dest, move || {
                subview.write(
                    &shard_checker,
                    shard_metainfo,
                    shard_write,
                    timestamp,
                    order,
                    token,
                    mirrored.handle(),
                )
            })??;
        Ok(Some(response))
    }

    /// Streams the changes since `start_point` from every shard.
    ///
    /// `should_backfill` is consulted exactly once for the whole aggregator,
    /// on the metainfos of all shards merged over the start point's domain;
    /// the return value equals its decision. Chunks are clipped to their
    /// shard's region and handed to `chunk_fun` serially on the calling
    /// task's own thread.
    pub fn send_backfill<F, C>(
        &self,
        start_point: &RegionMap<StateTimestamp>,
        should_backfill: F,
        mut chunk_fun: C,
        _progress: &BackfillProgress,
        read_tokens: Vec<ReadToken>,
        interruptor: &Signal,
    ) -> Result<bool>
    where
        F: FnOnce(&Metainfo) -> bool + Send + 'static,
        C: FnMut(P::BackfillChunk),
    {
        let n = self.num_stores();
        assert_eq!(read_tokens.len(), n, "one read token per shard");
        assert!(
            self.region.is_superset(&start_point.get_domain()),
            "backfill start point must lie inside the region"
        );
        debug!(shards = n, "starting multistore backfill send");

        let rendezvous = Arc::new(BackfillRendezvous::new(
            n,
            start_point.get_domain(),
            Box::new(should_backfill),
            self.pool.config().wait_slice(),
        ));
        let failure = Mutex::new(None);
        let slots = into_slots(read_tokens);
        let (chunk_tx, chunk_rx) = crossbeam_channel::unbounded::<P::BackfillChunk>();

        std::thread::scope(|s| {
            for i in 0..n {
                let rendezvous = rendezvous.clone();
                let chunk_tx = chunk_tx.clone();
                let failure = &failure;
                let slots = &slots;
                s.spawn(move || {
                    let token = take_slot(slots, i);
                    let result = self.shard_send_backfill(
                        i,
                        start_point,
                        &rendezvous,
                        chunk_tx,
                        token,
                        interruptor,
                    );
                    if let Err(err) = result {
                        // A shard that fails before offering its metainfo
                        // would otherwise strand its siblings in the
                        // rendezvous.
                        rendezvous.abandon();
                        record_failure(failure, err);
                    }
                });
            }
            drop(chunk_tx);
            // Chunk delivery happens here, on the calling task's own thread,
            // one chunk at a time.
            // TODO(backfill): the channel is unbounded, so producers never
            // see backpressure from a slow consumer; decide whether they
            // should.
            for chunk in chunk_rx.iter() {
                chunk_fun(chunk);
            }
        });

        if interruptor.is_pulsed() {
            return Err(SpanError::Interrupted);
        }
        if let Some(err) = failure.into_inner() {
            return Err(err);
        }
        Ok(rendezvous.verdict())
    }

    fn shard_send_backfill(
        &self,
        i: usize,
        start_point: &RegionMap<StateTimestamp>,
        rendezvous: &Arc<BackfillRendezvous>,
        chunk_tx: Sender<P::BackfillChunk>,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<()> {
        let subview = self.subviews[i].clone();
        let dest = subview.home_worker();
        let token = token.admit(interruptor)?;
        let mirrored = CrossWorkerSignal::new(interruptor, dest);
        let shard_start = start_point.mask(&self.shard_region(i));
        let rendezvous = rendezvous.clone();
        let offer_interruptor = interruptor.clone();
        self.pool.run_on(dest, move || {
            let should = move |metainfo: &Metainfo| {
                rendezvous.offer(metainfo.clone(), &offer_interruptor)
            };
            let sink = move |chunk: P::BackfillChunk| {
                chunk_tx.send(chunk).map_err(|_| SpanError::ChannelClosed)
            };
            // TODO(backfill): aggregate this into the caller's progress
            // object instead of throwing it away.
            let local_progress = BackfillProgress::new();
            subview.send_backfill(
                shard_start,
                &should,
                &sink,
                &local_progress,
                token,
                mirrored.handle(),
            )
        })??;
        Ok(())
    }

    /// Applies a received backfill chunk to every shard it intersects.
    pub fn receive_backfill(
        &self,
        chunk: &P::BackfillChunk,
        write_tokens: Vec<WriteToken>,
        interruptor: &Signal,
    ) -> Result<()> {
        assert!(
            self.region.is_superset(&chunk.region()),
            "backfill chunk must lie inside the region"
        );
        self.fan_out(write_tokens, interruptor, |i, token| {
            self.shard_receive_backfill(i, chunk, token, interruptor)
        })
        .map(|_: Vec<()>| ())
    }

    fn shard_receive_backfill(
        &self,
        i: usize,
        chunk: &P::BackfillChunk,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<Option<()>> {
        let shard_region = self.shard_region(i);
        let intersection = shard_region.intersect(&chunk.region());
        let subview = self.subviews[i].clone();
        let dest = subview.home_worker();
        if intersection.is_empty() {
            self.pool.run_on(dest, move || token.release())?;
            return Ok(None);
        }
        let token = token.admit(interruptor)?;
        let mirrored = CrossWorkerSignal::new(interruptor, dest);
        let shard_chunk = chunk.shard(&intersection);
        self.pool.run_on(dest, move || {
            subview.receive_backfill(shard_chunk, token, mirrored.handle())
        })??;
        Ok(None)
    }

    /// Drops the data in `subregion` on every overlapping shard and installs
    /// the clipped `new_metainfo` there.
    pub fn reset_data(
        &self,
        subregion: &Region,
        new_metainfo: &Metainfo,
        write_tokens: Vec<WriteToken>,
        interruptor: &Signal,
    ) -> Result<()> {
        self.fan_out(write_tokens, interruptor, |i, token| {
            self.shard_reset_data(i, subregion, new_metainfo, token, interruptor)
        })
        .map(|_: Vec<()>| ())
    }

    fn shard_reset_data(
        &self,
        i: usize,
        subregion: &Region,
        new_metainfo: &Metainfo,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<Option<()>> {
        let shard_region = self.shard_region(i);
        let subview = self.subviews[i].clone();
        let dest = subview.home_worker();
        if !shard_region.overlaps(subregion) {
            self.pool.run_on(dest, move || token.release())?;
            return Ok(None);
        }
        let token = token.admit(interruptor)?;
        let mirrored = CrossWorkerSignal::new(interruptor, dest);
        let shard_subregion = subregion.intersect(&shard_region);
        let shard_metainfo = new_metainfo.mask(&shard_region);
        self.pool.run_on(dest, move || {
            subview.reset_data(shard_subregion, shard_metainfo, token, mirrored.handle())
        })??;
        Ok(None)
    }

    fn debug_assert_shard_partition(&self) {
        #[cfg(debug_assertions)]
        {
            let mut union = Region::empty();
            for (i, subview) in self.subviews.iter().enumerate() {
                debug_assert_eq!(
                    subview.mask(),
                    &self.shard_region(i),
                    "shard {i} mask must equal its sharding slice"
                );
                debug_assert!(
                    !union.overlaps(subview.mask()),
                    "shard masks must be pairwise disjoint"
                );
                union = union.join(subview.mask());
            }
            debug_assert_eq!(union, self.region, "shard masks must partition the region");
        }
    }
}

impl<P: Protocol> Drop for Multistore<P> {
    fn drop(&mut self) {
        let subviews = std::mem::take(&mut self.subviews);
        let slots = into_slots(subviews);
        destroy_subviews(&self.pool, &slots);
    }
}

/// Wraps per-shard values so `pmap` tasks can each take exactly one.
fn into_slots<T>(items: Vec<T>) -> Vec<Mutex<Option<T>>> {
    items.into_iter().map(|item| Mutex::new(Some(item))).collect()
}

fn take_slot<T>(slots: &[Mutex<Option<T>>], i: usize) -> T {
    slots[i].lock().take().expect("per-shard slot taken once")
}

/// Records the first real failure; per-shard interruption is swallowed so the
/// fan-out reaches a clean join and the caller's own signal decides.
fn record_failure(failure: &Mutex<Option<SpanError>>, err: SpanError) {
    if err.is_interruption() {
        return;
    }
    let mut slot = failure.lock();
    if slot.is_none() {
        *slot = Some(err);
    }
}

/// Destroys each remaining subview in parallel on its home worker.
fn destroy_subviews<P: Protocol>(pool: &WorkerPool, slots: &[Mutex<Option<StoreSubview<P>>>]) {
    pmap(slots.len(), |i| {
        if let Some(subview) = slots[i].lock().take() {
            let dest = subview.home_worker();
            // Teardown ignores a closed pool; the threads are gone anyway.
            let _ = pool.run_on(dest, move || drop(subview));
        }
    });
}
