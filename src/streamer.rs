//! Per-board streaming context and thread lifecycle.
//!
//! One [`Streamer`] exists per board link. It owns up to two RX and two TX
//! [`StreamChannel`]s, the terminate flags and telemetry the packet loops
//! publish, and the RX/TX thread handles. Threads are spawned only for
//! directions with at least one active channel and joined when the last
//! channel of a direction stops.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rs_lms::{BoardPort, FpgaRegisters, regs};

use crate::channel::{StreamChannel, StreamConfig};
use crate::error::{Error, Result};

/// Hardware channels per link.
pub const MAX_CHANNELS: usize = 2;

/// A board transport the streaming engine can drive.
///
/// The supertrait carries registers, RF SPI and PLL access; this trait
/// binds the transport to its packet-loop flavor (synchronous pipes run the
/// plain loops, pipelined transports the queued ones) and to the raw
/// diagnostic read.
pub trait StreamBoard: BoardPort + 'static {
    /// Body of the receive thread. Returns when the streamer's RX
    /// terminate flag is set.
    fn run_rx_loop(self: Arc<Self>, stream: Arc<Streamer>);

    /// Body of the transmit thread.
    fn run_tx_loop(self: Arc<Self>, stream: Arc<Streamer>);

    /// One bounded read on the stream pipe, for the raw diagnostic path.
    fn read_raw(&self, buf: &mut [u8], ep: usize, timeout_ms: u32) -> Result<usize>;

    /// Drop whatever the transport buffered on the endpoint.
    fn reset_stream_buffers(&self, ep: usize) -> Result<()>;

    /// Cancel an in-flight raw read, if the transport queues them.
    fn abort_raw_read(&self, ep: usize);
}

#[derive(Default)]
struct ChannelSet {
    rx: [Option<Arc<StreamChannel>>; MAX_CHANNELS],
    tx: [Option<Arc<StreamChannel>>; MAX_CHANNELS],
}

#[derive(Default)]
struct Threads {
    rx: Option<JoinHandle<()>>,
    tx: Option<JoinHandle<()>>,
}

/// Streaming context of one board link.
pub struct Streamer {
    board: Arc<dyn StreamBoard>,
    chip_id: usize,
    channels: Mutex<ChannelSet>,
    threads: Mutex<Threads>,
    pub(crate) terminate_rx: AtomicBool,
    pub(crate) terminate_tx: AtomicBool,
    pub(crate) rx_running: AtomicBool,
    pub(crate) tx_running: AtomicBool,
    pub(crate) rx_last_timestamp: AtomicU64,
    pub(crate) tx_last_late_time: AtomicU64,
    pub(crate) rx_data_rate_bps: AtomicU32,
    pub(crate) tx_data_rate_bps: AtomicU32,
    pub(crate) buffer_failures: AtomicU32,
    pub(crate) rx_batch_size: AtomicU32,
    pub(crate) tx_batch_size: AtomicU32,
}

impl Streamer {
    /// Create the streaming context for `chip_id` (the stream endpoint
    /// index on multi-link boards).
    pub fn new(board: Arc<dyn StreamBoard>, chip_id: usize) -> Arc<Self> {
        Arc::new(Self {
            board,
            chip_id,
            channels: Mutex::new(ChannelSet::default()),
            threads: Mutex::new(Threads::default()),
            terminate_rx: AtomicBool::new(false),
            terminate_tx: AtomicBool::new(false),
            rx_running: AtomicBool::new(false),
            tx_running: AtomicBool::new(false),
            rx_last_timestamp: AtomicU64::new(0),
            tx_last_late_time: AtomicU64::new(0),
            rx_data_rate_bps: AtomicU32::new(0),
            tx_data_rate_bps: AtomicU32::new(0),
            buffer_failures: AtomicU32::new(0),
            rx_batch_size: AtomicU32::new(4),
            tx_batch_size: AtomicU32::new(4),
        })
    }

    /// Allocate the channel described by `config`. Fails if that slot is
    /// already set up.
    pub fn setup_stream(&self, config: StreamConfig) -> Result<Arc<StreamChannel>> {
        config.validate()?;
        let mut set = self.channels.lock().unwrap();
        let slot = if config.is_tx {
            &mut set.tx[config.channel as usize]
        } else {
            &mut set.rx[config.channel as usize]
        };
        if slot.is_some() {
            return Err(Error::config(format!(
                "{} channel {} already set up",
                if config.is_tx { "TX" } else { "RX" },
                config.channel
            )));
        }
        let channel = Arc::new(StreamChannel::new(config)?);
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Release a channel. Stops it first if it is still streaming.
    pub fn destroy_stream(self: &Arc<Self>, channel: &Arc<StreamChannel>) -> Result<()> {
        if channel.is_active() {
            self.stop_stream(channel)?;
        }
        let mut set = self.channels.lock().unwrap();
        let ChannelSet { rx, tx } = &mut *set;
        for slot in rx.iter_mut().chain(tx.iter_mut()) {
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, channel)) {
                *slot = None;
                return Ok(());
            }
        }
        Err(Error::config("channel does not belong to this streamer"))
    }

    /// Add the channel to the active set and bring up the threads it
    /// needs.
    pub fn start_stream(self: &Arc<Self>, channel: &Arc<StreamChannel>) -> Result<()> {
        channel.start();
        self.update_threads()
    }

    /// Remove the channel from the active set, tearing down threads whose
    /// direction went idle.
    pub fn stop_stream(self: &Arc<Self>, channel: &Arc<StreamChannel>) -> Result<()> {
        channel.stop();
        self.update_threads()
    }

    pub fn is_rx_running(&self) -> bool {
        self.rx_running.load(Ordering::Acquire)
    }

    pub fn is_tx_running(&self) -> bool {
        self.tx_running.load(Ordering::Acquire)
    }

    /// Counter of the most recent packet seen by the RX loop.
    pub fn rx_last_timestamp(&self) -> u64 {
        self.rx_last_timestamp.load(Ordering::Relaxed)
    }

    /// Counter of the packet that last reported a late TX condition.
    pub fn tx_last_late_time(&self) -> u64 {
        self.tx_last_late_time.load(Ordering::Relaxed)
    }

    /// Receive throughput, bytes per second, refreshed once a second.
    pub fn rx_data_rate_bps(&self) -> u32 {
        self.rx_data_rate_bps.load(Ordering::Relaxed)
    }

    /// Transmit throughput, bytes per second, refreshed once a second.
    pub fn tx_data_rate_bps(&self) -> u32 {
        self.tx_data_rate_bps.load(Ordering::Relaxed)
    }

    /// Transfers that failed or came back short on pipelined transports.
    pub fn buffer_failures(&self) -> u32 {
        self.buffer_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn chip_id(&self) -> usize {
        self.chip_id
    }

    pub(crate) fn rx_batch_size(&self) -> usize {
        self.rx_batch_size.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn tx_batch_size(&self) -> usize {
        self.tx_batch_size.load(Ordering::Relaxed) as usize
    }

    /// Channels the RX loop services, in hardware order. Membership is
    /// fixed at setup; `start`/`stop` only drive thread lifecycle.
    pub(crate) fn rx_channels(&self) -> Vec<Arc<StreamChannel>> {
        let set = self.channels.lock().unwrap();
        set.rx.iter().flatten().cloned().collect()
    }

    /// Channels the TX loop services, in hardware order.
    pub(crate) fn tx_channels(&self) -> Vec<Arc<StreamChannel>> {
        let set = self.channels.lock().unwrap();
        set.tx.iter().flatten().cloned().collect()
    }

    /// Reconcile running threads with the active channel set.
    fn update_threads(self: &Arc<Self>) -> Result<()> {
        let rx_all = self.rx_channels();
        let tx_all = self.tx_channels();
        let need_rx = rx_all.iter().any(|c| c.is_active());
        let need_tx = tx_all.iter().any(|c| c.is_active());

        let mut threads = self.threads.lock().unwrap();

        // Join threads whose direction went idle, including loops that
        // already terminated on their own.
        if !need_rx && threads.rx.is_some() {
            self.terminate_rx.store(true, Ordering::Release);
            if let Some(handle) = threads.rx.take() {
                let _ = handle.join();
            }
        }
        if !need_tx && threads.tx.is_some() {
            self.terminate_tx.store(true, Ordering::Release);
            if let Some(handle) = threads.tx.take() {
                let _ = handle.join();
            }
        }

        let start_rx = need_rx && !self.rx_running.load(Ordering::Acquire);
        let start_tx = need_tx && !self.tx_running.load(Ordering::Acquire);

        if start_rx || start_tx {
            // Program the FPGA before the first thread comes up.
            if !self.rx_running.load(Ordering::Acquire) && !self.tx_running.load(Ordering::Acquire)
            {
                let mut mask = 0u16;
                let mut packed = None;
                for ch in rx_all.iter().chain(tx_all.iter()) {
                    mask |= 1 << ch.config().channel;
                    packed.get_or_insert(ch.config().link_format.packed());
                }
                let mode = regs::MODE_LINK_ENABLE
                    | if packed.unwrap_or(false) {
                        regs::MODE_SAMPLE_12BIT
                    } else {
                        0
                    };
                self.board.write_register(regs::CHANNEL_ENABLE, mask)?;
                self.board.write_register(regs::STREAM_MODE, mode)?;
                start_streaming(self.board.as_ref())?;
            }

            if start_rx {
                // A loop that exited on its own leaves a finished handle.
                if let Some(old) = threads.rx.take() {
                    let _ = old.join();
                }
                self.rx_batch_size
                    .store(batch_size(&rx_all), Ordering::Relaxed);
                self.terminate_rx.store(false, Ordering::Release);
                self.rx_running.store(true, Ordering::Release);
                let board = self.board.clone();
                let stream = self.clone();
                let handle = std::thread::Builder::new()
                    .name("limelink-rx".into())
                    .spawn(move || board.run_rx_loop(stream))
                    .map_err(|e| {
                        self.rx_running.store(false, Ordering::Release);
                        Error::Allocation(format!("spawning RX thread: {e}"))
                    })?;
                threads.rx = Some(handle);
            }
            if start_tx {
                if let Some(old) = threads.tx.take() {
                    let _ = old.join();
                }
                self.tx_batch_size
                    .store(batch_size(&tx_all), Ordering::Relaxed);
                self.terminate_tx.store(false, Ordering::Release);
                self.tx_running.store(true, Ordering::Release);
                let board = self.board.clone();
                let stream = self.clone();
                let handle = std::thread::Builder::new()
                    .name("limelink-tx".into())
                    .spawn(move || board.run_tx_loop(stream))
                    .map_err(|e| {
                        self.tx_running.store(false, Ordering::Release);
                        Error::Allocation(format!("spawning TX thread: {e}"))
                    })?;
                threads.tx = Some(handle);
            }
        }

        if !need_rx && !need_tx && threads.rx.is_none() && threads.tx.is_none() {
            stop_streaming(self.board.as_ref())?;
        }
        Ok(())
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.terminate_rx.store(true, Ordering::Release);
        self.terminate_tx.store(true, Ordering::Release);
        let mut threads = self.threads.lock().unwrap();
        if let Some(handle) = threads.rx.take() {
            let _ = handle.join();
        }
        if let Some(handle) = threads.tx.take() {
            let _ = handle.join();
        }
        let _ = stop_streaming(self.board.as_ref());
    }
}

/// Transfer batch size (packets per transfer is twice this), scaled from
/// the channels' latency preference.
pub(crate) fn batch_size(channels: &[Arc<StreamChannel>]) -> u32 {
    let latency: f32 = channels
        .iter()
        .map(|c| c.config().performance_latency)
        .sum::<f32>()
        / channels.len().max(1) as f32;
    1 << ((latency * 4.0 + 0.5) as u32).min(3)
}

/// Raise the stream-enable bit.
pub(crate) fn start_streaming<B: FpgaRegisters + ?Sized>(board: &B) -> Result<()> {
    let ctrl = board.read_register(regs::INTERFACE_CTRL)?;
    board.write_register(regs::INTERFACE_CTRL, ctrl | regs::STREAM_ENABLE)?;
    Ok(())
}

/// Clear the stream-enable bit.
pub(crate) fn stop_streaming<B: FpgaRegisters + ?Sized>(board: &B) -> Result<()> {
    let ctrl = board.read_register(regs::INTERFACE_CTRL)?;
    board.write_register(regs::INTERFACE_CTRL, ctrl & !regs::STREAM_ENABLE)?;
    Ok(())
}
