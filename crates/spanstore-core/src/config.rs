use std::time::Duration;

use crate::error::{Result, SpanError};

#[derive(Clone, Debug)]
pub struct Config {
    /// Number of worker threads in the pool. Each store is homed on one of them.
    pub workers: usize,
    /// Upper bound on how long an interruptible wait sleeps before re-checking
    /// its interruptor.
    pub wait_slice_ms: u64,
    /// Maximum number of entries per streamed backfill chunk.
    pub backfill_chunk_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            wait_slice_ms: 5,
            backfill_chunk_entries: 64,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SpanError::Config("workers must be > 0".to_string()));
        }
        if self.wait_slice_ms == 0 {
            return Err(SpanError::Config("wait_slice_ms must be > 0".to_string()));
        }
        if self.backfill_chunk_entries == 0 {
            return Err(SpanError::Config(
                "backfill_chunk_entries must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms)
    }
}
