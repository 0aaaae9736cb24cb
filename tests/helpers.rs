//! Shared mock boards for streaming-engine integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use limelink::packet::{self, HEADER_SIZE, PACKET_SIZE};
use limelink::streamer::{StreamBoard, Streamer};
use limelink::{Complex16, rx, tx};
use rs_lms::{
    BoardKind, BoardPort, DeviceInfo, FpgaRegisters, PllClock, QueuedPipe, RfSpi, SyncPipe,
    TransferHandle, spi,
};

pub const PCIE_R3: DeviceInfo = DeviceInfo {
    chip_version: rs_lms::CHIP_VERSION_R3,
    hardware_rev: 3,
    kind: BoardKind::DualChipPcie,
};

pub const USB_R2: DeviceInfo = DeviceInfo {
    chip_version: rs_lms::CHIP_VERSION_R2,
    hardware_rev: 2,
    kind: BoardKind::SingleChipUsb,
};

/// One recorded PLL configuration call.
#[derive(Debug, Clone)]
pub struct PllCall {
    pub pll_index: u8,
    pub interface_clk_hz: f64,
    pub clocks: Vec<PllClock>,
}

/// Everything the mock board records about control traffic.
#[derive(Default)]
pub struct ControlLog {
    pub register_writes: Vec<(u16, u16)>,
    pub register_values: HashMap<u16, u16>,
    pub rf_reads: Vec<u16>,
    pub rf_writes: Vec<(u16, u16)>,
    pub rf_values: HashMap<u16, u16>,
    pub pll_calls: Vec<PllCall>,
    pub direct_clock_calls: Vec<(u8, f64, f64)>,
}

impl ControlLog {
    /// Writes issued to one register, in order.
    pub fn writes_to(&self, addr: u16) -> Vec<u16> {
        self.register_writes
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
            .collect()
    }
}

/// Scripted board with synchronous pipes: `receive_data` serves prepared
/// buffers (optionally paced), `send_data` records outgoing batches.
pub struct MockBoard {
    pub info: DeviceInfo,
    pub log: Mutex<ControlLog>,
    rx_script: Mutex<VecDeque<Vec<u8>>>,
    pub tx_sent: Mutex<Vec<Vec<u8>>>,
    /// Absolute pacing between served buffers; zero serves immediately.
    rx_interval: Duration,
    next_serve: Mutex<Option<Instant>>,
    /// How long `receive_data` dwells when the script is exhausted.
    empty_wait: Duration,
    fail_pll: AtomicBool,
}

impl MockBoard {
    pub fn new(info: DeviceInfo) -> Arc<Self> {
        Self::with_pacing(info, Duration::ZERO)
    }

    pub fn with_pacing(info: DeviceInfo, rx_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            info,
            log: Mutex::new(ControlLog::default()),
            rx_script: Mutex::new(VecDeque::new()),
            tx_sent: Mutex::new(Vec::new()),
            rx_interval,
            next_serve: Mutex::new(None),
            empty_wait: Duration::from_millis(100),
            fail_pll: AtomicBool::new(false),
        })
    }

    pub fn push_rx_buffer(&self, buf: Vec<u8>) {
        self.rx_script.lock().unwrap().push_back(buf);
    }

    pub fn preload_rf(&self, addr: u16, value: u16) {
        self.log.lock().unwrap().rf_values.insert(addr, value);
    }

    pub fn fail_next_pll(&self) {
        self.fail_pll.store(true, Ordering::SeqCst);
    }
}

impl FpgaRegisters for MockBoard {
    fn write_register(&self, addr: u16, value: u16) -> rs_lms::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.register_writes.push((addr, value));
        log.register_values.insert(addr, value);
        Ok(())
    }

    fn read_register(&self, addr: u16) -> rs_lms::Result<u16> {
        let log = self.log.lock().unwrap();
        Ok(log.register_values.get(&addr).copied().unwrap_or(0))
    }
}

impl RfSpi for MockBoard {
    fn rf_spi_write(&self, words: &[u32], _chip: usize) -> rs_lms::Result<()> {
        let mut log = self.log.lock().unwrap();
        for &word in words {
            let addr = spi::word_addr(word);
            let value = spi::word_value(word);
            log.rf_writes.push((addr, value));
            log.rf_values.insert(addr, value);
        }
        Ok(())
    }

    fn rf_spi_read(&self, addrs: &[u16], values: &mut [u16], _chip: usize) -> rs_lms::Result<()> {
        let mut log = self.log.lock().unwrap();
        for (i, &addr) in addrs.iter().enumerate() {
            log.rf_reads.push(addr);
            values[i] = log.rf_values.get(&addr).copied().unwrap_or(0);
        }
        Ok(())
    }
}

impl BoardPort for MockBoard {
    fn set_pll_frequency(
        &self,
        pll_index: u8,
        interface_clk_hz: f64,
        clocks: &mut [PllClock],
    ) -> rs_lms::Result<()> {
        if self.fail_pll.swap(false, Ordering::SeqCst) {
            return Err(rs_lms::Error::PllFailed("scripted failure".into()));
        }
        self.log.lock().unwrap().pll_calls.push(PllCall {
            pll_index,
            interface_clk_hz,
            clocks: clocks.to_vec(),
        });
        Ok(())
    }

    fn set_direct_clocking(
        &self,
        pll_index: u8,
        interface_clk_hz: f64,
        phase_deg: f64,
    ) -> rs_lms::Result<()> {
        self.log
            .lock()
            .unwrap()
            .direct_clock_calls
            .push((pll_index, interface_clk_hz, phase_deg));
        Ok(())
    }

    fn device_info(&self) -> DeviceInfo {
        self.info
    }
}

impl SyncPipe for MockBoard {
    fn receive_data(&self, buf: &mut [u8], _ep: usize, timeout_ms: u32) -> rs_lms::Result<usize> {
        let next = {
            let mut script = self.rx_script.lock().unwrap();
            script.pop_front()
        };
        match next {
            Some(data) => {
                if !self.rx_interval.is_zero() {
                    let mut next_serve = self.next_serve.lock().unwrap();
                    let due = next_serve.unwrap_or_else(Instant::now) + self.rx_interval;
                    *next_serve = Some(due);
                    let now = Instant::now();
                    if due > now {
                        std::thread::sleep(due - now);
                    }
                }
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => {
                std::thread::sleep(
                    self.empty_wait
                        .min(Duration::from_millis(timeout_ms as u64)),
                );
                Ok(0)
            }
        }
    }

    fn send_data(&self, buf: &[u8], _ep: usize, _timeout_ms: u32) -> rs_lms::Result<usize> {
        self.tx_sent.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn abort_reading(&self, _ep: usize) {}

    fn abort_sending(&self, _ep: usize) {}

    fn reset_stream_buffers(&self, _ep: usize) -> rs_lms::Result<()> {
        self.rx_script.lock().unwrap().clear();
        Ok(())
    }
}

impl StreamBoard for MockBoard {
    fn run_rx_loop(self: Arc<Self>, stream: Arc<Streamer>) {
        rx::receive_packets_loop(self, stream);
    }

    fn run_tx_loop(self: Arc<Self>, stream: Arc<Streamer>) {
        tx::transmit_packets_loop(self, stream);
    }

    fn read_raw(&self, buf: &mut [u8], ep: usize, timeout_ms: u32) -> limelink::Result<usize> {
        Ok(SyncPipe::receive_data(self, buf, ep, timeout_ms)?)
    }

    fn reset_stream_buffers(&self, ep: usize) -> limelink::Result<()> {
        Ok(SyncPipe::reset_stream_buffers(self, ep)?)
    }

    fn abort_raw_read(&self, ep: usize) {
        SyncPipe::abort_reading(self, ep);
    }
}

/// Scripted board with pipelined pipes: submissions complete immediately
/// with the next scripted buffer.
pub struct MockQueuedBoard {
    pub info: DeviceInfo,
    pub log: Mutex<ControlLog>,
    rx_script: Mutex<VecDeque<Vec<u8>>>,
    pub tx_sent: Mutex<Vec<Vec<u8>>>,
    slots: Mutex<HashMap<TransferHandle, Vec<u8>>>,
    next_handle: AtomicUsize,
    empty_wait: Duration,
}

impl MockQueuedBoard {
    pub fn new(info: DeviceInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            log: Mutex::new(ControlLog::default()),
            rx_script: Mutex::new(VecDeque::new()),
            tx_sent: Mutex::new(Vec::new()),
            slots: Mutex::new(HashMap::new()),
            next_handle: AtomicUsize::new(0),
            empty_wait: Duration::from_millis(20),
        })
    }

    pub fn push_rx_buffer(&self, buf: Vec<u8>) {
        self.rx_script.lock().unwrap().push_back(buf);
    }
}

impl FpgaRegisters for MockQueuedBoard {
    fn write_register(&self, addr: u16, value: u16) -> rs_lms::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.register_writes.push((addr, value));
        log.register_values.insert(addr, value);
        Ok(())
    }

    fn read_register(&self, addr: u16) -> rs_lms::Result<u16> {
        let log = self.log.lock().unwrap();
        Ok(log.register_values.get(&addr).copied().unwrap_or(0))
    }
}

impl RfSpi for MockQueuedBoard {
    fn rf_spi_write(&self, words: &[u32], _chip: usize) -> rs_lms::Result<()> {
        let mut log = self.log.lock().unwrap();
        for &word in words {
            log.rf_writes
                .push((spi::word_addr(word), spi::word_value(word)));
        }
        Ok(())
    }

    fn rf_spi_read(&self, addrs: &[u16], values: &mut [u16], _chip: usize) -> rs_lms::Result<()> {
        let mut log = self.log.lock().unwrap();
        for (i, &addr) in addrs.iter().enumerate() {
            log.rf_reads.push(addr);
            values[i] = log.rf_values.get(&addr).copied().unwrap_or(0);
        }
        Ok(())
    }
}

impl BoardPort for MockQueuedBoard {
    fn set_pll_frequency(
        &self,
        pll_index: u8,
        interface_clk_hz: f64,
        clocks: &mut [PllClock],
    ) -> rs_lms::Result<()> {
        self.log.lock().unwrap().pll_calls.push(PllCall {
            pll_index,
            interface_clk_hz,
            clocks: clocks.to_vec(),
        });
        Ok(())
    }

    fn set_direct_clocking(
        &self,
        pll_index: u8,
        interface_clk_hz: f64,
        phase_deg: f64,
    ) -> rs_lms::Result<()> {
        self.log
            .lock()
            .unwrap()
            .direct_clock_calls
            .push((pll_index, interface_clk_hz, phase_deg));
        Ok(())
    }

    fn device_info(&self) -> DeviceInfo {
        self.info
    }
}

impl QueuedPipe for MockQueuedBoard {
    fn begin_data_reading(&self, len: usize) -> rs_lms::Result<TransferHandle> {
        let data = self
            .rx_script
            .lock()
            .unwrap()
            .pop_front()
            .map(|d| {
                let mut d = d;
                d.truncate(len);
                d
            })
            .unwrap_or_default();
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.slots.lock().unwrap().insert(handle, data);
        Ok(handle)
    }

    fn wait_for_reading(&self, handle: TransferHandle, _timeout_ms: u32) -> bool {
        let known = self.slots.lock().unwrap().contains_key(&handle);
        if known {
            let empty = self
                .slots
                .lock()
                .unwrap()
                .get(&handle)
                .is_some_and(|d| d.is_empty());
            if empty {
                std::thread::sleep(self.empty_wait);
            }
        }
        known
    }

    fn finish_data_reading(&self, buf: &mut [u8], handle: TransferHandle) -> usize {
        match self.slots.lock().unwrap().remove(&handle) {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                n
            }
            None => 0,
        }
    }

    fn begin_data_sending(&self, data: &[u8]) -> rs_lms::Result<TransferHandle> {
        self.tx_sent.lock().unwrap().push(data.to_vec());
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.slots.lock().unwrap().insert(handle, vec![0; data.len()]);
        Ok(handle)
    }

    fn wait_for_sending(&self, handle: TransferHandle, _timeout_ms: u32) -> bool {
        self.slots.lock().unwrap().contains_key(&handle)
    }

    fn finish_data_sending(&self, handle: TransferHandle) -> usize {
        self.slots
            .lock()
            .unwrap()
            .remove(&handle)
            .map(|d| d.len())
            .unwrap_or(0)
    }

    fn abort_reading(&self) {
        self.slots.lock().unwrap().clear();
    }

    fn abort_sending(&self) {}

    fn reset_stream_buffers(&self) -> rs_lms::Result<()> {
        self.rx_script.lock().unwrap().clear();
        Ok(())
    }
}

impl StreamBoard for MockQueuedBoard {
    fn run_rx_loop(self: Arc<Self>, stream: Arc<Streamer>) {
        rx::receive_packets_loop_queued(self, stream);
    }

    fn run_tx_loop(self: Arc<Self>, stream: Arc<Streamer>) {
        tx::transmit_packets_loop_queued(self, stream);
    }

    fn read_raw(&self, buf: &mut [u8], _ep: usize, timeout_ms: u32) -> limelink::Result<usize> {
        let handle = self.begin_data_reading(buf.len())?;
        if QueuedPipe::wait_for_reading(self, handle, timeout_ms) {
            Ok(self.finish_data_reading(buf, handle))
        } else {
            Ok(0)
        }
    }

    fn reset_stream_buffers(&self, _ep: usize) -> limelink::Result<()> {
        Ok(QueuedPipe::reset_stream_buffers(self)?)
    }

    fn abort_raw_read(&self, _ep: usize) {
        QueuedPipe::abort_reading(self);
    }
}

/// Build one wire packet with `counter`, `flags` and per-channel sample
/// frames.
pub fn make_packet(counter: u64, flags: u8, frames: &[Vec<Complex16>], packed: bool) -> Vec<u8> {
    let mut raw = vec![0u8; PACKET_SIZE];
    raw[0] = flags;
    raw[8..HEADER_SIZE].copy_from_slice(&counter.to_le_bytes());
    if !frames.is_empty() {
        let count = frames[0].len();
        packet::samples_to_payload(frames, count, packed, &mut raw[HEADER_SIZE..]);
    }
    raw
}

/// Concatenate packets into one transfer buffer.
pub fn make_buffer(packets: Vec<Vec<u8>>) -> Vec<u8> {
    packets.into_iter().flatten().collect()
}

/// A deterministic test frame for one channel.
pub fn test_frame(channel: usize, count: usize, seed: i16) -> Vec<Complex16> {
    (0..count)
        .map(|i| {
            let v = (i as i16)
                .wrapping_mul(7)
                .wrapping_add(seed)
                .wrapping_add(channel as i16 * 101);
            Complex16::new(v, v.wrapping_sub(17))
        })
        .collect()
}
