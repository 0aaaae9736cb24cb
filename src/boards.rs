//! Loop bindings for the shipped transports: character-device boards run
//! the synchronous packet loops, USB boards the pipelined ones.

use std::sync::Arc;

use rs_lms::{CharDevPort, QueuedPipe, SyncPipe, UsbPort};

use crate::error::Result;
use crate::streamer::{StreamBoard, Streamer};
use crate::{rx, tx};

impl StreamBoard for CharDevPort {
    fn run_rx_loop(self: Arc<Self>, stream: Arc<Streamer>) {
        rx::receive_packets_loop(self, stream);
    }

    fn run_tx_loop(self: Arc<Self>, stream: Arc<Streamer>) {
        tx::transmit_packets_loop(self, stream);
    }

    fn read_raw(&self, buf: &mut [u8], ep: usize, timeout_ms: u32) -> Result<usize> {
        Ok(SyncPipe::receive_data(self, buf, ep, timeout_ms)?)
    }

    fn reset_stream_buffers(&self, ep: usize) -> Result<()> {
        Ok(SyncPipe::reset_stream_buffers(self, ep)?)
    }

    fn abort_raw_read(&self, ep: usize) {
        SyncPipe::abort_reading(self, ep);
    }
}

impl StreamBoard for UsbPort {
    fn run_rx_loop(self: Arc<Self>, stream: Arc<Streamer>) {
        rx::receive_packets_loop_queued(self, stream);
    }

    fn run_tx_loop(self: Arc<Self>, stream: Arc<Streamer>) {
        tx::transmit_packets_loop_queued(self, stream);
    }

    fn read_raw(&self, buf: &mut [u8], _ep: usize, timeout_ms: u32) -> Result<usize> {
        let handle = self.begin_data_reading(buf.len())?;
        if QueuedPipe::wait_for_reading(self, handle, timeout_ms) {
            Ok(self.finish_data_reading(buf, handle))
        } else {
            // Reclaim the slot; the transfer is abandoned.
            self.finish_data_reading(buf, handle);
            Ok(0)
        }
    }

    fn reset_stream_buffers(&self, _ep: usize) -> Result<()> {
        Ok(QueuedPipe::reset_stream_buffers(self)?)
    }

    fn abort_raw_read(&self, _ep: usize) {
        QueuedPipe::abort_reading(self);
    }
}
