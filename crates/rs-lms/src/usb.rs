//! USB bulk transport for boards behind an FT601-class bridge.
//!
//! Stream data moves over one bulk-in and one bulk-out endpoint; this class
//! of bridge only reaches full throughput with several transfers in flight,
//! so the port exposes the pipelined [`QueuedPipe`] surface backed by a
//! [`TransferQueue`] per direction. Register and RF-SPI traffic uses vendor
//! control transfers carrying the framed words from [`crate::spi`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusb::{Context, DeviceHandle};

use crate::error::{Error, Result};
use crate::queue::{TransferHandle, TransferQueue};
use crate::{BoardPort, DeviceInfo, FpgaRegisters, PllBackend, PllClock, QueuedPipe, RfSpi, spi};

/// Timeout for USB control transfers.
const USB_CTRL_TIMEOUT: Duration = Duration::from_millis(500);
/// Timeout for one bulk transfer on the queue worker.
const USB_BULK_TIMEOUT: Duration = Duration::from_millis(1000);

// Vendor request codes understood by the board firmware.
const REQ_FPGA_SPI: u8 = 0x20;
const REQ_RF_SPI: u8 = 0x21;

// REQUEST_TYPE_VENDOR | RECIPIENT_DEVICE
const VENDOR_OUT: u8 = 0x40;
const VENDOR_IN: u8 = 0xC0;

/// A board reached through USB bulk endpoints.
pub struct UsbPort {
    handle: Arc<DeviceHandle<Context>>,
    // Register reads are a write/read pair; keep them together.
    control: Mutex<()>,
    ep_in: u8,
    ep_out: u8,
    read_queue: TransferQueue,
    write_queue: TransferQueue,
    info: DeviceInfo,
    pll: Box<dyn PllBackend>,
}

impl UsbPort {
    /// Build a port from an already-open and claimed device handle.
    pub fn new(
        handle: DeviceHandle<Context>,
        ep_in: u8,
        ep_out: u8,
        info: DeviceInfo,
        pll: Box<dyn PllBackend>,
    ) -> Result<Self> {
        let handle = Arc::new(handle);

        let reader = handle.clone();
        let read_queue = TransferQueue::new("usb-read", move |buf| {
            Ok(reader.read_bulk(ep_in, buf, USB_BULK_TIMEOUT)?)
        })?;

        let writer = handle.clone();
        let write_queue = TransferQueue::new("usb-write", move |buf| {
            Ok(writer.write_bulk(ep_out, buf, USB_BULK_TIMEOUT)?)
        })?;

        Ok(Self {
            handle,
            control: Mutex::new(()),
            ep_in,
            ep_out,
            read_queue,
            write_queue,
            info,
            pll,
        })
    }

    fn control_words(
        &self,
        request: u8,
        chip: u16,
        words: &[u32],
        responses: usize,
    ) -> Result<Vec<u16>> {
        let _guard = self.control.lock().unwrap();
        let mut payload = Vec::with_capacity(words.len() * 4);
        for word in words {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        self.handle
            .write_control(VENDOR_OUT, request, 0, chip, &payload, USB_CTRL_TIMEOUT)
            .map_err(|e| Error::ControlTransferFailed(e.to_string()))?;
        if responses == 0 {
            return Ok(Vec::new());
        }
        let mut raw = vec![0u8; responses * 4];
        let n = self
            .handle
            .read_control(VENDOR_IN, request, 0, chip, &mut raw, USB_CTRL_TIMEOUT)
            .map_err(|e| Error::ControlTransferFailed(e.to_string()))?;
        if n < raw.len() {
            return Err(Error::InvalidResponse(format!(
                "short SPI response: {n} of {} bytes",
                raw.len()
            )));
        }
        Ok(raw
            .chunks_exact(4)
            .map(|c| spi::word_value(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect())
    }
}

impl FpgaRegisters for UsbPort {
    fn write_register(&self, addr: u16, value: u16) -> Result<()> {
        self.control_words(REQ_FPGA_SPI, 0, &[spi::write_word(addr, value)], 0)?;
        Ok(())
    }

    fn read_register(&self, addr: u16) -> Result<u16> {
        let values = self.control_words(REQ_FPGA_SPI, 0, &[spi::read_word(addr)], 1)?;
        Ok(values[0])
    }
}

impl RfSpi for UsbPort {
    fn rf_spi_write(&self, words: &[u32], chip: usize) -> Result<()> {
        self.control_words(REQ_RF_SPI, chip as u16, words, 0)?;
        Ok(())
    }

    fn rf_spi_read(&self, addrs: &[u16], values: &mut [u16], chip: usize) -> Result<()> {
        let words: Vec<u32> = addrs.iter().map(|&a| spi::read_word(a)).collect();
        let read = self.control_words(REQ_RF_SPI, chip as u16, &words, addrs.len())?;
        values[..read.len()].copy_from_slice(&read);
        Ok(())
    }
}

impl BoardPort for UsbPort {
    fn set_pll_frequency(
        &self,
        pll_index: u8,
        interface_clk_hz: f64,
        clocks: &mut [PllClock],
    ) -> Result<()> {
        self.pll
            .set_pll_frequency(self, pll_index, interface_clk_hz, clocks)
    }

    fn set_direct_clocking(
        &self,
        pll_index: u8,
        interface_clk_hz: f64,
        phase_deg: f64,
    ) -> Result<()> {
        self.pll
            .set_direct_clocking(self, pll_index, interface_clk_hz, phase_deg)
    }

    fn device_info(&self) -> DeviceInfo {
        self.info
    }
}

impl QueuedPipe for UsbPort {
    fn begin_data_reading(&self, len: usize) -> Result<TransferHandle> {
        self.read_queue.begin_read(len)
    }

    fn wait_for_reading(&self, handle: TransferHandle, timeout_ms: u32) -> bool {
        self.read_queue.wait(handle, timeout_ms)
    }

    fn finish_data_reading(&self, buf: &mut [u8], handle: TransferHandle) -> usize {
        self.read_queue.finish_read(buf, handle)
    }

    fn begin_data_sending(&self, data: &[u8]) -> Result<TransferHandle> {
        self.write_queue.begin_write(data)
    }

    fn wait_for_sending(&self, handle: TransferHandle, timeout_ms: u32) -> bool {
        self.write_queue.wait(handle, timeout_ms)
    }

    fn finish_data_sending(&self, handle: TransferHandle) -> usize {
        self.write_queue.finish_write(handle)
    }

    fn abort_reading(&self) {
        self.read_queue.abort();
    }

    fn abort_sending(&self) {
        self.write_queue.abort();
    }

    fn reset_stream_buffers(&self) -> Result<()> {
        self.read_queue.abort();
        self.write_queue.abort();
        self.handle.clear_halt(self.ep_in)?;
        self.handle.clear_halt(self.ep_out)?;
        Ok(())
    }
}
