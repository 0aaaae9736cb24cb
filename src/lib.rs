#![doc = include_str!("../readme.md")]

mod boards;
pub mod channel;
mod clocks;
pub mod device;
pub mod error;
pub mod fifo;
pub mod packet;
pub mod rx;
pub mod streamer;
pub mod tx;

pub use channel::{ChannelStats, LinkFormat, StreamChannel, StreamConfig};
pub use device::SdrDevice;
pub use error::{Error, Result};
pub use fifo::{END_BURST, Metadata, OVERWRITE_OLD, RingFifo, SYNC_TIMESTAMP};
pub use streamer::{StreamBoard, Streamer};

// The board-access vocabulary callers need to open and describe hardware.
pub use rs_lms::{BoardKind, CharDevPort, DeviceInfo, PllBackend, PllClock, UsbPort};

/// Complex baseband sample as carried on the link: signed 16-bit I and Q.
pub type Complex16 = num_complex::Complex<i16>;
