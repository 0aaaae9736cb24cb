//! Error types for rs-lms operations.

use thiserror::Error;

/// Result type for rs-lms operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the board.
#[derive(Debug, Error)]
pub enum Error {
    /// USB operation failed.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Character-device or pipe I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation did not complete within its deadline.
    #[error("device timeout")]
    Timeout,

    /// Control transfer failed.
    #[error("control transfer failed: {0}")]
    ControlTransferFailed(String),

    /// The device answered with something unexpected.
    #[error("invalid device response: {0}")]
    InvalidResponse(String),

    /// Streaming/bulk transfer error.
    #[error("streaming error: {0}")]
    StreamingError(String),

    /// No stream pipe configured for the requested endpoint index.
    #[error("no stream pipe for endpoint {0}")]
    InvalidEndpoint(usize),

    /// PLL configuration rejected by the gateware support layer.
    #[error("PLL configuration failed: {0}")]
    PllFailed(String),
}
