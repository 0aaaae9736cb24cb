//! Transmit path: packet loops for both transport families.
//!
//! The loops pop per-channel sample frames from the TX FIFOs, assemble
//! packet batches (counter from the frame metadata, ignore-timestamp set
//! unless the producer asked for [`SYNC_TIMESTAMP`]) and hand them to the
//! transport. The synchronous flavor treats a starved FIFO as fatal and
//! terminates the stream; the pipelined flavor logs it and keeps going —
//! both behaviors are deliberate and match the hardware deployments they
//! serve.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use rs_lms::{BoardPort, QUEUE_DEPTH, QueuedPipe, SyncPipe, TransferHandle};

use crate::Complex16;
use crate::channel::StreamChannel;
use crate::fifo::{Metadata, SYNC_TIMESTAMP};
use crate::packet::{self, PACKET_SIZE, PacketMut};
use crate::streamer::Streamer;

/// Transport write deadline.
const SEND_TIMEOUT_MS: u32 = 1000;
/// FIFO pop deadline on synchronous transports.
const POP_TIMEOUT_SYNC_MS: u32 = 500;
/// FIFO pop deadline on pipelined transports.
const POP_TIMEOUT_QUEUED_MS: u32 = 100;

struct TxSetup {
    channels: Vec<Arc<StreamChannel>>,
    packed: bool,
    max_samples_batch: usize,
    packets_to_batch: usize,
    buffer_size: usize,
}

fn tx_setup(stream: &Streamer) -> Option<TxSetup> {
    let channels = stream.tx_channels();
    if channels.is_empty() {
        return None;
    }
    let packed = channels[0].config().link_format.packed();
    let max_samples_batch = packet::samples_in_packet(packed, channels.len());
    let packets_to_batch = stream.tx_batch_size() * 2;
    Some(TxSetup {
        packed,
        max_samples_batch,
        packets_to_batch,
        buffer_size: packets_to_batch * PACKET_SIZE,
        channels,
    })
}

/// Fill one packet slot from the TX FIFOs. Returns `false` when a channel
/// starved and `fatal_starvation` asked for termination.
fn fill_packet(
    stream: &Streamer,
    setup: &TxSetup,
    samples: &mut [Vec<Complex16>],
    chunk: &mut [u8],
    pop_timeout_ms: u32,
    fatal_starvation: bool,
) -> bool {
    let mut meta = Metadata::default();
    for (ch, frame) in setup.channels.iter().zip(samples.iter_mut()) {
        let popped = ch.read(frame, &mut meta, pop_timeout_ms);
        if popped != setup.max_samples_batch {
            tracing::warn!(
                popped,
                requested = setup.max_samples_batch,
                "TX FIFO starved"
            );
            ch.add_underflow(1);
            if fatal_starvation {
                stream.terminate_tx.store(true, Ordering::Release);
                return false;
            }
        }
    }

    let Some(mut pkt) = PacketMut::new(chunk) else {
        return false;
    };
    pkt.clear_header();
    pkt.set_counter(meta.timestamp);
    // Timestamps are ignored unless the producer explicitly synchronized.
    if meta.flags & SYNC_TIMESTAMP == 0 {
        pkt.set_flags(packet::IGNORE_TIMESTAMP);
    }
    packet::samples_to_payload(
        samples,
        setup.max_samples_batch,
        setup.packed,
        pkt.payload_mut(),
    );
    true
}

fn publish_rate(total_bytes: &mut u64, t1: &mut Instant) -> Option<u32> {
    let elapsed = t1.elapsed();
    if elapsed < std::time::Duration::from_secs(1) {
        return None;
    }
    let rate = (*total_bytes as f64 * 1000.0 / elapsed.as_millis() as f64) as u32;
    *total_bytes = 0;
    *t1 = Instant::now();
    Some(rate)
}

/// Transmit thread body for synchronous pipe transports.
pub fn transmit_packets_loop<B>(board: Arc<B>, stream: Arc<Streamer>)
where
    B: BoardPort + SyncPipe + 'static,
{
    let Some(setup) = tx_setup(&stream) else {
        stream.tx_running.store(false, Ordering::Release);
        return;
    };
    let ep = stream.chip_id();

    let mut buffer = Vec::new();
    if buffer.try_reserve_exact(setup.buffer_size).is_err() {
        tracing::error!(
            "allocating TX buffer ({} bytes), not enough memory",
            setup.buffer_size
        );
        stream.tx_running.store(false, Ordering::Release);
        return;
    }
    buffer.resize(setup.buffer_size, 0);
    let mut samples =
        vec![vec![Complex16::default(); setup.max_samples_batch]; setup.channels.len()];

    let mut total_bytes: u64 = 0;
    let mut t1 = Instant::now();

    while !stream.terminate_tx.load(Ordering::Acquire) {
        let mut filled = 0;
        for chunk in buffer.chunks_exact_mut(PACKET_SIZE) {
            if stream.terminate_tx.load(Ordering::Acquire) {
                break;
            }
            if !fill_packet(
                &stream,
                &setup,
                &mut samples,
                chunk,
                POP_TIMEOUT_SYNC_MS,
                true,
            ) {
                break;
            }
            filled += 1;
        }
        if filled < setup.packets_to_batch {
            // Terminated mid-fill; do not push a half-stale batch out.
            break;
        }

        let sent = match board.send_data(&buffer, ep, SEND_TIMEOUT_MS) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("TX transfer failed: {e}");
                0
            }
        };
        if sent != setup.buffer_size {
            for ch in &setup.channels {
                ch.add_overflow(1);
            }
        } else {
            total_bytes += sent as u64;
        }

        if let Some(rate) = publish_rate(&mut total_bytes, &mut t1) {
            tracing::debug!(rate_bps = rate, "TX data rate");
            stream.tx_data_rate_bps.store(rate, Ordering::Relaxed);
        }
    }

    board.abort_sending(ep);
    stream.tx_data_rate_bps.store(0, Ordering::Relaxed);
    stream.tx_running.store(false, Ordering::Release);
}

/// Transmit thread body for pipelined transports: up to [`QUEUE_DEPTH`]
/// batches stay in flight, slots recycled round-robin.
pub fn transmit_packets_loop_queued<B>(board: Arc<B>, stream: Arc<Streamer>)
where
    B: BoardPort + QueuedPipe + 'static,
{
    let Some(setup) = tx_setup(&stream) else {
        stream.tx_running.store(false, Ordering::Release);
        return;
    };
    let buffers_count = QUEUE_DEPTH;

    let mut buffer = Vec::new();
    if buffer.try_reserve_exact(setup.buffer_size).is_err() {
        tracing::error!(
            "allocating TX buffer ({} bytes), not enough memory",
            setup.buffer_size
        );
        stream.tx_running.store(false, Ordering::Release);
        return;
    }
    buffer.resize(setup.buffer_size, 0);
    let mut samples =
        vec![vec![Complex16::default(); setup.max_samples_batch]; setup.channels.len()];

    let mut handles: Vec<Option<TransferHandle>> = vec![None; buffers_count];
    let mut buffer_used = vec![false; buffers_count];
    let mut bytes_to_send = vec![0usize; buffers_count];
    let mut bi = 0;

    let mut total_bytes: u64 = 0;
    let mut t1 = Instant::now();

    while !stream.terminate_tx.load(Ordering::Acquire) {
        // Recycle the slot before reusing it.
        if buffer_used[bi] {
            if let Some(handle) = handles[bi].take() {
                if !board.wait_for_sending(handle, SEND_TIMEOUT_MS) {
                    stream.buffer_failures.fetch_add(1, Ordering::Relaxed);
                }
                let sent = board.finish_data_sending(handle);
                if sent != bytes_to_send[bi] {
                    stream.buffer_failures.fetch_add(1, Ordering::Relaxed);
                } else {
                    total_bytes += sent as u64;
                }
            }
            buffer_used[bi] = false;
        }

        let mut filled = 0;
        for chunk in buffer.chunks_exact_mut(PACKET_SIZE) {
            if stream.terminate_tx.load(Ordering::Acquire) {
                break;
            }
            if !fill_packet(
                &stream,
                &setup,
                &mut samples,
                chunk,
                POP_TIMEOUT_QUEUED_MS,
                false,
            ) {
                break;
            }
            filled += 1;
        }
        if filled < setup.packets_to_batch {
            break;
        }

        bytes_to_send[bi] = setup.buffer_size;
        handles[bi] = board.begin_data_sending(&buffer).ok();
        buffer_used[bi] = handles[bi].is_some();

        if let Some(rate) = publish_rate(&mut total_bytes, &mut t1) {
            tracing::debug!(rate_bps = rate, "TX data rate");
            stream.tx_data_rate_bps.store(rate, Ordering::Relaxed);
        }
        bi = (bi + 1) & (buffers_count - 1);
    }

    board.abort_sending();
    // Wait out whatever was already submitted.
    for _ in 0..buffers_count {
        if buffer_used[bi]
            && let Some(handle) = handles[bi].take()
        {
            board.wait_for_sending(handle, SEND_TIMEOUT_MS);
            board.finish_data_sending(handle);
        }
        bi = (bi + 1) & (buffers_count - 1);
    }
    stream.tx_data_rate_bps.store(0, Ordering::Relaxed);
    stream.tx_running.store(false, Ordering::Release);
}
