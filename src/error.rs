//! Error handling for the streaming engine.
//!
//! Control-path failures (stream setup, clock retuning) surface as
//! [`Error`] values. Data-path anomalies — short transfers, counter jumps,
//! FIFO pressure — never abort a running loop; they are counted on the
//! affected [`StreamChannel`](crate::channel::StreamChannel) and visible
//! through its statistics.

use thiserror::Error;

/// Result type for streaming-engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by control paths.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid stream or retune configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Buffer allocation failed at loop startup.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// A register, SPI or PLL operation failed.
    #[error("hardware access failed: {0}")]
    Hardware(#[from] rs_lms::Error),

    /// The transport rejected a request outright.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl Error {
    /// Create a configuration error with a custom message.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }
}
