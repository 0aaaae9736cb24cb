//! Character-device transport for boards whose FPGA FIFOs surface as
//! Xillybus-style device files.
//!
//! Each stream endpoint is a pair of unidirectional device files (one read,
//! one write); register traffic rides dedicated control pipes carrying the
//! framed words from [`crate::spi`]. The caller opens the files — device
//! naming and enumeration are not this crate's concern — and hands them
//! over; the port puts the stream files into non-blocking mode so the
//! millisecond deadlines of the streaming engine can be honored.

use std::fs::File;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::{BoardPort, DeviceInfo, FpgaRegisters, PllBackend, PllClock, RfSpi, SyncPipe, spi};

/// Polling interval while waiting for a non-blocking device file.
const POLL_INTERVAL: Duration = Duration::from_micros(500);

struct ControlPipe {
    reader: File,
    writer: File,
}

struct StreamPipe {
    reader: Mutex<File>,
    writer: Mutex<File>,
}

/// A board reached through character-device pipes.
pub struct CharDevPort {
    control: Mutex<ControlPipe>,
    rf_controls: Vec<Mutex<ControlPipe>>,
    streams: Vec<StreamPipe>,
    info: DeviceInfo,
    pll: Box<dyn PllBackend>,
}

impl CharDevPort {
    /// Build a port from already-open device files.
    ///
    /// `control` carries FPGA register words, `rf_controls` one pipe pair
    /// per RF transceiver, `streams` one pair per stream endpoint (read
    /// side first). Stream files are switched to non-blocking mode.
    pub fn new(
        control: (File, File),
        rf_controls: Vec<(File, File)>,
        streams: Vec<(File, File)>,
        info: DeviceInfo,
        pll: Box<dyn PllBackend>,
    ) -> Result<Self> {
        let mut stream_pipes = Vec::with_capacity(streams.len());
        for (reader, writer) in streams {
            set_nonblocking(&reader)?;
            set_nonblocking(&writer)?;
            stream_pipes.push(StreamPipe {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
            });
        }
        Ok(Self {
            control: Mutex::new(ControlPipe {
                reader: control.0,
                writer: control.1,
            }),
            rf_controls: rf_controls
                .into_iter()
                .map(|(reader, writer)| Mutex::new(ControlPipe { reader, writer }))
                .collect(),
            streams: stream_pipes,
            info,
            pll,
        })
    }

    fn stream(&self, ep: usize) -> Result<&StreamPipe> {
        self.streams.get(ep).ok_or(Error::InvalidEndpoint(ep))
    }
}

fn set_nonblocking(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn transact(pipe: &mut ControlPipe, words: &[u32], responses: usize) -> Result<Vec<u16>> {
    for word in words {
        pipe.writer.write_all(&word.to_le_bytes())?;
    }
    pipe.writer.flush()?;
    let mut values = Vec::with_capacity(responses);
    let mut raw = [0u8; 4];
    for _ in 0..responses {
        pipe.reader.read_exact(&mut raw)?;
        values.push(spi::word_value(u32::from_le_bytes(raw)));
    }
    Ok(values)
}

impl FpgaRegisters for CharDevPort {
    fn write_register(&self, addr: u16, value: u16) -> Result<()> {
        let mut pipe = self.control.lock().unwrap();
        transact(&mut pipe, &[spi::write_word(addr, value)], 0)?;
        Ok(())
    }

    fn read_register(&self, addr: u16) -> Result<u16> {
        let mut pipe = self.control.lock().unwrap();
        let values = transact(&mut pipe, &[spi::read_word(addr)], 1)?;
        Ok(values[0])
    }
}

impl RfSpi for CharDevPort {
    fn rf_spi_write(&self, words: &[u32], chip: usize) -> Result<()> {
        let pipe = self
            .rf_controls
            .get(chip)
            .ok_or(Error::InvalidEndpoint(chip))?;
        let mut pipe = pipe.lock().unwrap();
        transact(&mut pipe, words, 0)?;
        Ok(())
    }

    fn rf_spi_read(&self, addrs: &[u16], values: &mut [u16], chip: usize) -> Result<()> {
        let pipe = self
            .rf_controls
            .get(chip)
            .ok_or(Error::InvalidEndpoint(chip))?;
        let mut pipe = pipe.lock().unwrap();
        let words: Vec<u32> = addrs.iter().map(|&a| spi::read_word(a)).collect();
        let read = transact(&mut pipe, &words, addrs.len())?;
        values[..read.len()].copy_from_slice(&read);
        Ok(())
    }
}

impl BoardPort for CharDevPort {
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

impl SyncPipe for CharDevPort {
    fn receive_data(&self, buf: &mut [u8], ep: usize, timeout_ms: u32) -> Result<usize> {
        let pipe = self.stream(ep)?;
        let mut reader = pipe.reader.lock().unwrap();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut total = 0;
        while total < buf.len() {
            match reader.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn send_data(&self, buf: &[u8], ep: usize, timeout_ms: u32) -> Result<usize> {
        let pipe = self.stream(ep)?;
        let mut writer = pipe.writer.lock().unwrap();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut total = 0;
        while total < buf.len() {
            match writer.write(&buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn abort_reading(&self, ep: usize) {
        // Nothing is queued on a synchronous pipe; the next read simply
        // does not happen.
        tracing::debug!("abort reading on endpoint {ep}");
    }

    fn abort_sending(&self, ep: usize) {
        tracing::debug!("abort sending on endpoint {ep}");
    }

    fn reset_stream_buffers(&self, ep: usize) -> Result<()> {
        let pipe = self.stream(ep)?;
        let mut reader = pipe.reader.lock().unwrap();
        let mut scratch = [0u8; 4096];
        loop {
            match reader.read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
