use thiserror::Error;

/// Failure of a single generation request.
///
/// Errors are local to one stream: no variant is ever allowed to leave a worker
/// checked out of its pool or returned to it twice.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was shut down before or while the request was being served.
    #[error("engine closed")]
    Closed,

    /// No live worker could take the request, or the assigned worker's channel broke.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The model raised an error while generating.
    #[error("worker failed: {0}")]
    Worker(String),

    #[cfg(feature = "remote")]
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(u16),

    /// An upstream frame did not match the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[cfg(feature = "process")]
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[cfg(feature = "process")]
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A message was larger than the process channel's frame cap and was not sent.
    #[cfg(feature = "process")]
    #[error("message of {len} bytes exceeds the {max} byte frame limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the failure happened before anything was written to a process
    /// channel, leaving the channel in sync.
    #[cfg(feature = "process")]
    pub(crate) fn is_unsent(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. } | Self::Encode(_))
    }
}

/// Failure to load or validate an [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to start engine: {0}")]
    Engine(#[from] EngineError),
}
