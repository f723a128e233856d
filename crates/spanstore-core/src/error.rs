use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpanError {
    /// The caller's interruptor was pulsed before the operation finished.
    #[error("operation interrupted")]
    Interrupted,
    #[error("worker channel closed")]
    ChannelClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("metainfo blob decode error: {0}")]
    BlobDecode(#[from] serde_json::Error),
    #[error("metainfo mismatch: {0}")]
    MetainfoMismatch(String),
    #[error("store error: {0}")]
    Store(String),
}

impl SpanError {
    /// True for the cancellation marker, false for every real failure.
    pub fn is_interruption(&self) -> bool {
        matches!(self, SpanError::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, SpanError>;
