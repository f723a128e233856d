//! A store restricted to a sub-region of its coverage.

use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{
    Metainfo, MetainfoChecker, OrderToken, Protocol, ReadResponseOf, Sharded, StateTimestamp,
    WriteResponseOf,
};
use crate::region::{Region, RegionMap};
use crate::store::{BackfillProgress, ChunkFn, ShouldBackfillFn, StoreView};
use crate::worker::fifo::{ReadToken, WriteToken};
use crate::worker::signal::Signal;
use crate::worker::WorkerId;

/// A [`StoreView`] paired with an immutable `mask ⊆ store.region()`. Every
/// forwarded operation is first clipped to the mask, so the underlying store
/// never observes a region outside it. Create and destroy on the store's home
/// worker.
pub struct StoreSubview<P: Protocol> {
    store: Arc<dyn StoreView<P>>,
    mask: Region,
}

impl<P: Protocol> StoreSubview<P> {
    pub fn new(store: Arc<dyn StoreView<P>>, mask: Region) -> Self {
        assert!(
            store.region().is_superset(&mask),
            "subview mask must lie inside the store's region"
        );
        Self { store, mask }
    }

    pub fn mask(&self) -> &Region {
        &self.mask
    }

    pub fn store(&self) -> &Arc<dyn StoreView<P>> {
        &self.store
    }
}

impl<P: Protocol> Clone for StoreSubview<P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            mask: self.mask.clone(),
        }
    }
}

impl<P: Protocol> StoreView<P> for StoreSubview<P> {
    fn home_worker(&self) -> WorkerId {
        self.store.home_worker()
    }

    fn region(&self) -> Region {
        self.mask.clone()
    }

    fn new_read_token(&self) -> ReadToken {
        self.store.new_read_token()
    }

    fn new_write_token(&self) -> WriteToken {
        self.store.new_write_token()
    }

    fn metainfo(
        &self,
        order: OrderToken,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<Metainfo> {
        Ok(self.store.metainfo(order, token, interruptor)?.mask(&self.mask))
    }

    fn set_metainfo(
        &self,
        new_metainfo: Metainfo,
        order: OrderToken,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<()> {
        self.store
            .set_metainfo(new_metainfo.mask(&self.mask), order, token, interruptor)
    }

    fn read(
        &self,
        checker: &MetainfoChecker,
        read: P::Read,
        order: OrderToken,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<ReadResponseOf<P>> {
        self.store.read(
            &checker.mask(&self.mask),
            read.shard(&self.mask),
            order,
            token,
            interruptor,
        )
    }

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
    ) -> Result<WriteResponseOf<P>> {
        self.store.write(
            &checker.mask(&self.mask),
            new_metainfo.mask(&self.mask),
            write.shard(&self.mask),
            timestamp,
            order,
            token,
            interruptor,
        )
    }

    fn send_backfill(
        &self,
        start_point: RegionMap<StateTimestamp>,
        should_backfill: &ShouldBackfillFn<'_>,
        chunk_fun: &ChunkFn<'_, P>,
        progress: &BackfillProgress,
        token: ReadToken,
        interruptor: &Signal,
    ) -> Result<bool> {
        let mask = &self.mask;
        let masked_should = move |metainfo: &Metainfo| should_backfill(&metainfo.mask(mask));
        let masked_chunks =
            move |chunk: <P as Protocol>::BackfillChunk| chunk_fun(chunk.shard(mask));
        self.store.send_backfill(
            start_point.mask(mask),
            &masked_should,
            &masked_chunks,
            progress,
            token,
            interruptor,
        )
    }

    fn receive_backfill(
        &self,
        chunk: P::BackfillChunk,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<()> {
        self.store
            .receive_backfill(chunk.shard(&self.mask), token, interruptor)
    }

    fn reset_data(
        &self,
        subregion: Region,
        new_metainfo: Metainfo,
        token: WriteToken,
        interruptor: &Signal,
    ) -> Result<()> {
        self.store.reset_data(
            subregion.intersect(&self.mask),
            new_metainfo.mask(&self.mask),
            token,
            interruptor,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::kv::{KvProtocol, KvRead};
    use crate::store::MemStore;
    use crate::worker::WorkerPool;

    fn fixture() -> (Arc<WorkerPool>, Arc<MemStore>) {
        let config = Config {
            workers: 1,
            ..Config::default()
        };
        let pool = Arc::new(WorkerPool::new(config.clone()).unwrap());
        let store = MemStore::new(WorkerId(0), Region::range(0, 1000), &config);
        (pool, store)
    }

    #[test]
    fn test_region_is_the_mask() {
        let (_pool, store) = fixture();
        let sub = StoreSubview::<KvProtocol>::new(store, Region::range(100, 200));
        assert_eq!(sub.region(), Region::range(100, 200));
    }

    #[test]
    #[should_panic(expected = "subview mask must lie inside the store's region")]
    fn test_mask_outside_store_region_rejected() {
        let (_pool, store) = fixture();
        let _ = StoreSubview::<KvProtocol>::new(store, Region::range(500, 2000));
    }

    #[test]
    fn test_read_is_clipped_to_mask() {
        let (pool, store) = fixture();
        let sub = StoreSubview::<KvProtocol>::new(store.clone(), Region::range(100, 200));
        let keys = pool
            .run_on(WorkerId(0), move || -> crate::error::Result<Vec<u64>> {
                let never = Signal::new();
                let wtok = store.new_write_token();
                store.receive_backfill(
                    crate::protocol::kv::KvChunk {
                        region: Region::range(0, 1000),
                        entries: vec![
                            crate::protocol::kv::KvEntry::new(50, "a", StateTimestamp(1)),
                            crate::protocol::kv::KvEntry::new(150, "b", StateTimestamp(1)),
                        ],
                    },
                    wtok,
                    &never,
                )?;
                let rtok = sub.new_read_token();
                let resp = sub.read(
                    &MetainfoChecker::empty(),
                    KvRead::over(Region::range(0, 1000)),
                    OrderToken::ignore(),
                    rtok,
                    &never,
                )?;
                Ok(resp.entries.into_iter().map(|e| e.key).collect())
            })
            .unwrap()
            .unwrap();
        // The entry at key 50 is outside the mask and must not be visible.
        assert_eq!(keys, vec![150]);
    }

    #[test]
    fn test_metainfo_is_masked() {
        let (pool, store) = fixture();
        let sub = StoreSubview::<KvProtocol>::new(store, Region::range(100, 200));
        let domain = pool
            .run_on(WorkerId(0), move || -> crate::error::Result<Region> {
                let never = Signal::new();
                let rtok = sub.new_read_token();
                Ok(sub
                    .metainfo(OrderToken::ignore(), rtok, &never)?
                    .get_domain())
            })
            .unwrap()
            .unwrap();
        assert_eq!(domain, Region::range(100, 200));
    }
}
