//! Receive path: packet loops and the late-TX resetter.
//!
//! Two loop flavors exist, one per transport family. The synchronous loop
//! ([`receive_packets_loop`]) pulls full batches with one blocking read per
//! iteration; the queued loop ([`receive_packets_loop_queued`]) keeps
//! [`QUEUE_DEPTH`] transfers in flight and collects them round-robin. Both
//! share the packet parser: TX-late detection, loss accounting by counter
//! delta, and the per-channel FIFO pushes.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, bounded};
use rs_lms::{BoardPort, QUEUE_DEPTH, QueuedPipe, SyncPipe, TransferHandle, regs};

use crate::Complex16;
use crate::channel::StreamChannel;
use crate::fifo::{Metadata, OVERWRITE_OLD};
use crate::packet::{self, PACKET_SIZE};
use crate::streamer::Streamer;

/// Transport read deadline. A batch is expected to fill within this.
const RECEIVE_TIMEOUT_MS: u32 = 1000;
/// Deadline for pushing one frame into a channel FIFO.
const FIFO_PUSH_TIMEOUT_MS: u32 = 100;
/// Late-TX reports to swallow before the first reset pulse; the FPGA flag
/// stays latched across packets, so early reports pile up while TX ramps.
const INITIAL_RESET_DELAY: u32 = 128;

/// Helper thread pulsing the board's latched TX-late flag.
///
/// Wake-ups arrive on a bounded(1) channel: a pending token coalesces
/// repeated requests, and dropping the sender is the final signal that
/// terminates the thread — the RX loop guarantees that drop after its own
/// loop ends.
pub(crate) struct LateTxResetter {
    signal: Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

impl LateTxResetter {
    pub(crate) fn spawn<B: BoardPort + 'static>(board: Arc<B>) -> Self {
        let (signal, wakeups) = bounded::<()>(1);
        let handle = std::thread::spawn(move || {
            let reg9 = match board.read_register(regs::TX_LATE_RESET) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("reading TX-late reset register: {e}");
                    0
                }
            };
            let pulse = [
                (regs::TX_LATE_RESET, reg9 | regs::TX_LATE_RESET_PULSE),
                (regs::TX_LATE_RESET, reg9 & !regs::TX_LATE_RESET_PULSE),
            ];
            while wakeups.recv().is_ok() {
                if let Err(e) = board.write_registers(&pulse) {
                    tracing::warn!("pulsing TX-late reset: {e}");
                }
            }
        });
        Self { signal, handle }
    }

    /// Request a reset pulse; coalesces with one already pending.
    pub(crate) fn notify(&self) {
        let _ = self.signal.try_send(());
    }

    /// Send the final signal (channel disconnect) and join.
    pub(crate) fn shutdown(self) {
        let Self { signal, handle } = self;
        drop(signal);
        let _ = handle.join();
    }
}

struct RxContext<'a> {
    stream: &'a Streamer,
    rx_channels: &'a [Arc<StreamChannel>],
    tx_channels: &'a [Arc<StreamChannel>],
    resetter: &'a LateTxResetter,
    samples_in_packet: u64,
    packed: bool,
    /// Cooldown restart value after a pulse was issued.
    reset_interval: u32,
}

struct RxState {
    prev_ts: u64,
    reset_flags_delay: u32,
}

/// Parse one received transfer: flag handling, loss accounting and FIFO
/// pushes. `scratch` holds one pre-sized frame per channel.
fn process_buffer(
    ctx: &RxContext<'_>,
    state: &mut RxState,
    buf: &[u8],
    scratch: &mut [Vec<Complex16>],
) {
    let mut tx_late_seen = false;
    for pkt in packet::packets(buf) {
        let counter = pkt.counter();

        // Report a late TX at most once per batch.
        if pkt.flags() & packet::TX_LATE != 0 && !tx_late_seen {
            tx_late_seen = true;
            if state.reset_flags_delay > 0 {
                state.reset_flags_delay -= 1;
            } else {
                tracing::debug!(counter, "late TX reported by the board");
                ctx.resetter.notify();
                state.reset_flags_delay = ctx.reset_interval;
                ctx.stream
                    .tx_last_late_time
                    .store(counter, Ordering::Relaxed);
                for ch in ctx.tx_channels {
                    ch.add_pkt_lost(1);
                }
            }
        }

        let delta = counter.wrapping_sub(state.prev_ts);
        if delta != ctx.samples_in_packet && delta != 0 {
            let lost = (delta / ctx.samples_in_packet) as i64 - 1;
            if lost > 0 {
                tracing::debug!(delta, lost, "RX packet loss");
                for ch in ctx.rx_channels {
                    ch.add_pkt_lost(lost as u32);
                }
            }
        }
        state.prev_ts = counter;
        ctx.stream
            .rx_last_timestamp
            .store(counter, Ordering::Relaxed);

        let count = packet::payload_to_samples(pkt.payload(), ctx.packed, scratch);
        let meta = Metadata {
            timestamp: counter,
            flags: OVERWRITE_OLD,
        };
        for (ch, frame) in ctx.rx_channels.iter().zip(scratch.iter()) {
            let pushed = ch.write(&frame[..count], meta, FIFO_PUSH_TIMEOUT_MS);
            if pushed != count {
                ch.add_overflow(1);
            }
        }
    }
}

fn publish_rate(total_bytes: &mut u64, t1: &mut Instant) -> Option<u32> {
    let elapsed = t1.elapsed();
    if elapsed < Duration::from_secs(1) {
        return None;
    }
    let rate = (*total_bytes as f64 * 1000.0 / elapsed.as_millis() as f64) as u32;
    *total_bytes = 0;
    *t1 = Instant::now();
    Some(rate)
}

/// Receive thread body for synchronous pipe transports.
pub fn receive_packets_loop<B>(board: Arc<B>, stream: Arc<Streamer>)
where
    B: BoardPort + SyncPipe + 'static,
{
    let rx_channels = stream.rx_channels();
    if rx_channels.is_empty() {
        stream.rx_running.store(false, Ordering::Release);
        return;
    }
    let tx_channels = stream.tx_channels();
    let ch_count = rx_channels.len();
    let packed = rx_channels[0].config().link_format.packed();
    let samples_in_packet = packet::samples_in_packet(packed, ch_count);
    let ep = stream.chip_id();
    let packets_to_batch = stream.rx_batch_size() * 2;
    let buffer_size = packets_to_batch * PACKET_SIZE;

    let mut buffer = Vec::new();
    if buffer.try_reserve_exact(buffer_size).is_err() {
        tracing::error!("allocating RX buffer ({buffer_size} bytes), not enough memory");
        stream.rx_running.store(false, Ordering::Release);
        return;
    }
    buffer.resize(buffer_size, 0);
    let mut scratch = vec![vec![Complex16::default(); samples_in_packet]; ch_count];

    let resetter = LateTxResetter::spawn(board.clone());
    let ctx = RxContext {
        stream: &stream,
        rx_channels: &rx_channels,
        tx_channels: &tx_channels,
        resetter: &resetter,
        samples_in_packet: samples_in_packet as u64,
        packed,
        reset_interval: (packets_to_batch * 2) as u32,
    };
    let mut state = RxState {
        prev_ts: 0,
        reset_flags_delay: INITIAL_RESET_DELAY,
    };

    let mut total_bytes: u64 = 0;
    let mut t1 = Instant::now();

    while !stream.terminate_rx.load(Ordering::Acquire) {
        let received = match board.receive_data(&mut buffer, ep, RECEIVE_TIMEOUT_MS) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("RX transfer failed: {e}");
                0
            }
        };
        total_bytes += received as u64;
        if received != buffer_size {
            // Data comes in full batches; anything short means the board
            // starved the pipe.
            for ch in &rx_channels {
                ch.add_underflow(1);
            }
        }
        process_buffer(&ctx, &mut state, &buffer[..received], &mut scratch);

        if let Some(rate) = publish_rate(&mut total_bytes, &mut t1) {
            tracing::debug!(rate_bps = rate, "RX data rate");
            stream.rx_data_rate_bps.store(rate, Ordering::Relaxed);
        }
    }

    board.abort_reading(ep);
    resetter.shutdown();
    stream.rx_data_rate_bps.store(0, Ordering::Relaxed);
    stream.rx_running.store(false, Ordering::Release);
}

/// Receive thread body for pipelined transports: [`QUEUE_DEPTH`] reads stay
/// in flight, collected and re-submitted round-robin.
pub fn receive_packets_loop_queued<B>(board: Arc<B>, stream: Arc<Streamer>)
where
    B: BoardPort + QueuedPipe + 'static,
{
    let rx_channels = stream.rx_channels();
    if rx_channels.is_empty() {
        stream.rx_running.store(false, Ordering::Release);
        return;
    }
    let tx_channels = stream.tx_channels();
    let ch_count = rx_channels.len();
    let packed = rx_channels[0].config().link_format.packed();
    let samples_in_packet = packet::samples_in_packet(packed, ch_count);
    let packets_to_batch = stream.rx_batch_size() * 2;
    let buffer_size = packets_to_batch * PACKET_SIZE;
    let buffers_count = QUEUE_DEPTH;

    let mut buffer = Vec::new();
    if buffer.try_reserve_exact(buffer_size).is_err() {
        tracing::error!("allocating RX buffer ({buffer_size} bytes), not enough memory");
        stream.rx_running.store(false, Ordering::Release);
        return;
    }
    buffer.resize(buffer_size, 0);
    let mut scratch = vec![vec![Complex16::default(); samples_in_packet]; ch_count];

    let mut handles: Vec<Option<TransferHandle>> = (0..buffers_count)
        .map(|_| board.begin_data_reading(buffer_size).ok())
        .collect();
    let mut bi = 0;

    let resetter = LateTxResetter::spawn(board.clone());
    let ctx = RxContext {
        stream: &stream,
        rx_channels: &rx_channels,
        tx_channels: &tx_channels,
        resetter: &resetter,
        samples_in_packet: samples_in_packet as u64,
        packed,
        reset_interval: (packets_to_batch * buffers_count) as u32,
    };
    let mut state = RxState {
        prev_ts: 0,
        reset_flags_delay: INITIAL_RESET_DELAY,
    };

    let mut total_bytes: u64 = 0;
    let mut t1 = Instant::now();

    while !stream.terminate_rx.load(Ordering::Acquire) {
        let mut received = 0;
        if let Some(handle) = handles[bi] {
            if !board.wait_for_reading(handle, RECEIVE_TIMEOUT_MS) {
                stream.buffer_failures.fetch_add(1, Ordering::Relaxed);
            }
            received = board.finish_data_reading(&mut buffer, handle);
            total_bytes += received as u64;
            if received != buffer_size {
                stream.buffer_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        process_buffer(&ctx, &mut state, &buffer[..received], &mut scratch);

        // Re-submit this slot to keep the queue full.
        handles[bi] = board.begin_data_reading(buffer_size).ok();
        bi = (bi + 1) & (buffers_count - 1);

        if let Some(rate) = publish_rate(&mut total_bytes, &mut t1) {
            tracing::debug!(rate_bps = rate, "RX data rate");
            stream.rx_data_rate_bps.store(rate, Ordering::Relaxed);
        }
    }

    board.abort_reading();
    // Drain whatever is still in flight.
    for _ in 0..buffers_count {
        if let Some(handle) = handles[bi].take() {
            board.wait_for_reading(handle, RECEIVE_TIMEOUT_MS);
            board.finish_data_reading(&mut buffer, handle);
        }
        bi = (bi + 1) & (buffers_count - 1);
    }
    resetter.shutdown();
    stream.rx_data_rate_bps.store(0, Ordering::Relaxed);
    stream.rx_running.store(false, Ordering::Release);
}
