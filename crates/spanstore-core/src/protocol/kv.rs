//! The key-value protocol: region reads, entry-batch writes, versioned
//! backfill chunks.

use serde::{Deserialize, Serialize};

use crate::protocol::{Protocol, ReadRequest, Sharded, StateTimestamp, WriteRequest};
use crate::region::Region;

pub struct KvProtocol;

impl Protocol for KvProtocol {
    type Read = KvRead;
    type Write = KvWrite;
    type BackfillChunk = KvChunk;
}

/// One versioned key-value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: u64,
    pub value: Vec<u8>,
    pub timestamp: StateTimestamp,
}

impl KvEntry {
    pub fn new(key: u64, value: impl Into<Vec<u8>>, timestamp: StateTimestamp) -> Self {
        Self {
            key,
            value: value.into(),
            timestamp,
        }
    }
}

/// Read every live entry inside a region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvRead {
    pub region: Region,
}

impl KvRead {
    pub fn over(region: Region) -> Self {
        Self { region }
    }
}

impl Sharded for KvRead {
    fn region(&self) -> Region {
        self.region.clone()
    }

    fn shard(&self, region: &Region) -> Self {
        Self {
            region: self.region.intersect(region),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KvReadResponse {
    /// Key-ordered entries.
    pub entries: Vec<KvEntry>,
}

impl ReadRequest for KvRead {
    type Response = KvReadResponse;
    type Cache = KvCache;

    fn unshard(&self, responses: Vec<KvReadResponse>, _cache: &mut KvCache) -> KvReadResponse {
        let mut entries: Vec<KvEntry> = responses.into_iter().flat_map(|r| r.entries).collect();
        entries.sort_by_key(|e| e.key);
        KvReadResponse { entries }
    }
}

/// Upsert a batch of keys inside a region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvWrite {
    pub region: Region,
    pub entries: Vec<(u64, Vec<u8>)>,
}

impl KvWrite {
    pub fn over(region: Region, entries: Vec<(u64, Vec<u8>)>) -> Self {
        debug_assert!(
            entries.iter().all(|(k, _)| region.contains_key(*k)),
            "write entries must lie inside the write region"
        );
        Self { region, entries }
    }
}

impl Sharded for KvWrite {
    fn region(&self) -> Region {
        self.region.clone()
    }

    fn shard(&self, region: &Region) -> Self {
        Self {
            region: self.region.intersect(region),
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| region.contains_key(*k))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KvWriteResponse {
    pub written: usize,
}

impl WriteRequest for KvWrite {
    type Response = KvWriteResponse;
    type Cache = KvCache;

    fn unshard(&self, responses: Vec<KvWriteResponse>, _cache: &mut KvCache) -> KvWriteResponse {
        KvWriteResponse {
            written: responses.iter().map(|r| r.written).sum(),
        }
    }
}

/// A backfill chunk: versioned entries from one sub-region of the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvChunk {
    pub region: Region,
    pub entries: Vec<KvEntry>,
}

impl Sharded for KvChunk {
    fn region(&self) -> Region {
        self.region.clone()
    }

    fn shard(&self, region: &Region) -> Self {
        Self {
            region: self.region.intersect(region),
            entries: self
                .entries
                .iter()
                .filter(|e| region.contains_key(e.key))
                .cloned()
                .collect(),
        }
    }
}

/// Per-call scratch for `unshard`. The merges above need none, but the slot
/// keeps the protocol surface uniform for callers that do.
#[derive(Default)]
pub struct KvCache;
