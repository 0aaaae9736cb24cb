//! Per-channel stream state: configuration, FIFO and counters.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::fifo::{Metadata, RingFifo};
use crate::Complex16;

/// Sample format on the link between FPGA and host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFormat {
    /// 12-bit packed components.
    I12,
    /// 16-bit components.
    I16,
}

impl LinkFormat {
    /// Whether this format uses the packed wire layout.
    pub fn packed(self) -> bool {
        matches!(self, LinkFormat::I12)
    }
}

/// Immutable configuration of one stream channel.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Hardware channel index (0 or 1).
    pub channel: u8,
    /// Transmit direction when `true`, receive otherwise.
    pub is_tx: bool,
    /// Sample format on the link.
    pub link_format: LinkFormat,
    /// FIFO capacity in samples.
    pub fifo_size: usize,
    /// 0.0 favors latency, 1.0 favors throughput; scales the transfer
    /// batch size.
    pub performance_latency: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            is_tx: false,
            link_format: LinkFormat::I16,
            fifo_size: 1 << 16,
            performance_latency: 0.5,
        }
    }
}

impl StreamConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.channel > 1 {
            return Err(Error::config(format!(
                "channel index {} out of range (0..=1)",
                self.channel
            )));
        }
        if self.fifo_size == 0 {
            return Err(Error::config("FIFO size must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.performance_latency) {
            return Err(Error::config(format!(
                "performance latency {} out of range (0.0..=1.0)",
                self.performance_latency
            )));
        }
        Ok(())
    }
}

/// Counter snapshot of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Transfers that came up short of data.
    pub underflow: u32,
    /// Samples or transfers dropped for lack of room.
    pub overflow: u32,
    /// Packets lost on the link.
    pub pkt_lost: u32,
    /// Samples currently buffered in the FIFO.
    pub fifo_filled: usize,
    /// FIFO capacity in samples.
    pub fifo_size: usize,
}

/// One direction of one hardware channel.
///
/// Owns the ring FIFO between user code and the packet loop and the
/// counters both sides update. The data path never errors: anomalies end up
/// in [`ChannelStats`].
pub struct StreamChannel {
    config: StreamConfig,
    fifo: RingFifo,
    active: AtomicBool,
    pub(crate) underflow: AtomicU32,
    pub(crate) overflow: AtomicU32,
    pub(crate) pkt_lost: AtomicU32,
}

impl StreamChannel {
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fifo: RingFifo::new(config.fifo_size),
            config,
            active: AtomicBool::new(false),
            underflow: AtomicU32::new(0),
            overflow: AtomicU32::new(0),
            pkt_lost: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Push samples toward the board (TX) or pull them from user code's
    /// perspective; delegates to the FIFO.
    pub fn write(&self, samples: &[Complex16], meta: Metadata, timeout_ms: u32) -> usize {
        self.fifo.write(samples, meta, timeout_ms)
    }

    /// Pop samples; delegates to the FIFO.
    pub fn read(&self, dst: &mut [Complex16], meta: &mut Metadata, timeout_ms: u32) -> usize {
        self.fifo.read(dst, meta, timeout_ms)
    }

    /// Mark the channel as part of the active streaming set.
    pub(crate) fn start(&self) {
        self.fifo.clear();
        self.reset_counters();
        self.active.store(true, Ordering::Release);
    }

    /// Remove the channel from the active streaming set.
    pub(crate) fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            underflow: self.underflow.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
            pkt_lost: self.pkt_lost.load(Ordering::Relaxed),
            fifo_filled: self.fifo.len(),
            fifo_size: self.fifo.capacity(),
        }
    }

    pub(crate) fn reset_counters(&self) {
        self.underflow.store(0, Ordering::Relaxed);
        self.overflow.store(0, Ordering::Relaxed);
        self.pkt_lost.store(0, Ordering::Relaxed);
    }

    pub(crate) fn add_underflow(&self, n: u32) {
        self.underflow.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_overflow(&self, n: u32) {
        self.overflow.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_pkt_lost(&self, n: u32) {
        self.pkt_lost.fetch_add(n, Ordering::Relaxed);
    }
}
