//! Error types for the tab refresh scheduler.

/// Top-level error type for the refresh scheduler.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Persistent key-value store error.
    #[error("store error: {0}")]
    Store(String),

    /// Tab directory call failed (tab gone, host refused, call dropped).
    #[error("tab error: {0}")]
    Tab(String),

    /// Timer facility error.
    #[error("timer error: {0}")]
    Timer(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Malformed command envelope or payload.
    #[error("contract error: {0}")]
    Contract(String),

    /// Interval bounds violate `0 < min <= max`.
    #[error("invalid interval: min {min_ms}ms, max {max_ms}ms")]
    InvalidInterval {
        /// Requested lower bound in milliseconds.
        min_ms: u64,
        /// Requested upper bound in milliseconds.
        max_ms: u64,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, RefreshError>;
