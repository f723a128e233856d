//! Protocol capability traits and the shared metainfo types.
//!
//! The aggregator is generic over a [`Protocol`]: the set of request,
//! response, and backfill-chunk types together with their region algebra
//! (`region`/`shard`) and the `unshard` merge that folds per-shard responses
//! back into one logical response. [`kv`] is the concrete key-value
//! instantiation.

pub mod kv;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::region::{Region, RegionMap};

/// Opaque per-region metadata payload as stores persist it.
pub type Blob = Vec<u8>;

/// Per-region metadata of a store: which blob describes each sub-region.
pub type Metainfo = RegionMap<Blob>;

/// A value that covers a region and can be clipped to a sub-region.
pub trait Sharded: Clone + Send + Sync + 'static {
    fn region(&self) -> Region;

    /// The restriction of this value to `region`.
    fn shard(&self, region: &Region) -> Self;
}

/// A read request: shardable, and able to merge per-shard responses.
pub trait ReadRequest: Sharded {
    type Response: Send + 'static;
    /// Scratch state for `unshard`; one per logical call.
    type Cache: Default;

    /// Folds per-shard responses into one logical response. Must be
    /// commutative over shard index.
    fn unshard(&self, responses: Vec<Self::Response>, cache: &mut Self::Cache) -> Self::Response;
}

/// A write request: shardable, and able to merge per-shard responses.
pub trait WriteRequest: Sharded {
    type Response: Send + 'static;
    type Cache: Default;

    fn unshard(&self, responses: Vec<Self::Response>, cache: &mut Self::Cache) -> Self::Response;
}

/// The full capability set the aggregator needs from a protocol.
pub trait Protocol: Send + Sync + 'static {
    type Read: ReadRequest;
    type Write: WriteRequest;
    type BackfillChunk: Sharded;
}

pub type ReadResponseOf<P: Protocol> = <<P as Protocol>::Read as ReadRequest>::Response;
pub type WriteResponseOf<P: Protocol> = <<P as Protocol>::Write as WriteRequest>::Response;

/// Logical time of a store's state; writes move it forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct StateTimestamp(pub u64);

impl StateTimestamp {
    pub const ZERO: StateTimestamp = StateTimestamp(0);

    pub fn next(self) -> Self {
        StateTimestamp(self.0 + 1)
    }
}

/// Identity of a replication branch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BranchId(pub u64);

/// A point in replication history: a branch and a position on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: StateTimestamp,
}

impl Version {
    pub fn zero() -> Self {
        Self {
            branch: BranchId(0),
            timestamp: StateTimestamp::ZERO,
        }
    }
}

/// The range of versions a sub-region may hold: `earliest` is known durable,
/// `latest` is the furthest possibly-applied write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub earliest: Version,
    pub latest: Version,
}

impl VersionRange {
    /// The range of a region whose state is exactly known.
    pub fn coherent(version: Version) -> Self {
        Self {
            earliest: version,
            latest: version,
        }
    }

    pub fn is_coherent(&self) -> bool {
        self.earliest == self.latest
    }

    pub fn to_blob(&self) -> Blob {
        serde_json::to_vec(self).expect("version range always serializes")
    }

    pub fn from_blob(blob: &Blob) -> Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }
}

/// Mints causally ordered [`OrderToken`]s from one named source.
pub struct OrderSource {
    name: &'static str,
    counter: AtomicU64,
}

impl OrderSource {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            counter: AtomicU64::new(0),
        }
    }

    pub fn check_in(&self) -> OrderToken {
        OrderToken {
            source: self.name,
            value: self.counter.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// An upper-layer causal tag, forwarded opaquely to every shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderToken {
    source: &'static str,
    value: u64,
}

impl OrderToken {
    /// The token of callers that impose no ordering of their own.
    pub fn ignore() -> Self {
        Self {
            source: "ignore",
            value: 0,
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// Read-time-equality assertion on a store's existing metainfo: the store's
/// metainfo restricted to the checker's domain must equal the expectation.
#[derive(Debug, Clone)]
pub struct MetainfoChecker {
    expected: Metainfo,
}

impl MetainfoChecker {
    pub fn new(expected: Metainfo) -> Self {
        Self { expected }
    }

    /// A checker that asserts nothing.
    pub fn empty() -> Self {
        Self {
            expected: Metainfo::new(),
        }
    }

    pub fn domain(&self) -> Region {
        self.expected.get_domain()
    }

    pub fn mask(&self, region: &Region) -> Self {
        Self {
            expected: self.expected.mask(region),
        }
    }

    pub fn check(&self, actual: &Metainfo) -> Result<()> {
        let clipped = actual.mask(&self.domain());
        if clipped == self.expected {
            Ok(())
        } else {
            Err(crate::error::SpanError::MetainfoMismatch(format!(
                "store metainfo over {:?} does not match the expectation",
                self.domain()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;

    #[test]
    fn test_version_range_blob_roundtrip() {
        let range = VersionRange {
            earliest: Version {
                branch: BranchId(3),
                timestamp: StateTimestamp(10),
            },
            latest: Version {
                branch: BranchId(3),
                timestamp: StateTimestamp(12),
            },
        };
        let decoded = VersionRange::from_blob(&range.to_blob()).unwrap();
        assert_eq!(decoded, range);
        assert!(!decoded.is_coherent());
        assert!(VersionRange::coherent(Version::zero()).is_coherent());
    }

    #[test]
    fn test_bad_blob_fails_to_decode() {
        assert!(VersionRange::from_blob(&b"not json".to_vec()).is_err());
    }

    #[test]
    fn test_order_source_mints_distinct_tokens() {
        let source = OrderSource::new("test");
        let a = source.check_in();
        let b = source.check_in();
        assert_ne!(a, b);
        assert_eq!(a.source(), "test");
    }

    #[test]
    fn test_metainfo_checker() {
        let expected = Metainfo::over_range(0, 100, b"m".to_vec());
        let checker = MetainfoChecker::new(expected.clone());

        // Exact match and wider-actual both pass.
        assert!(checker.check(&expected).is_ok());
        let wider = Metainfo::over_range(0, 200, b"m".to_vec());
        assert!(checker.check(&wider).is_ok());

        // Differing payload fails.
        let other = Metainfo::over_range(0, 100, b"x".to_vec());
        assert!(checker.check(&other).is_err());

        // Masking narrows the assertion.
        let narrowed = checker.mask(&Region::range(0, 50));
        assert_eq!(narrowed.domain(), Region::range(0, 50));
        let half = Metainfo::over_range(0, 50, b"m".to_vec());
        assert!(narrowed.check(&half).is_ok());
    }
}
