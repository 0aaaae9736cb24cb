//! Top-level device handle: streamer ownership, clock retuning and the raw
//! diagnostic read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rs_lms::{BoardKind, CHIP_VERSION_R3, DeviceInfo, regs, spi};

use crate::clocks::{
    self, BACKUP_REG_COUNT, Direction, MIN_PLL_CLK_HZ, PHASE_SEARCH_ADDRS, RX_TEST_PATTERN,
    TX_TEST_PATTERN,
};
use crate::error::{Error, Result};
use crate::streamer::{self, StreamBoard, Streamer};

/// Stream links (RF transceivers) a board may carry.
pub const MAX_LINKS: usize = 2;

struct PhaseSearchBackup {
    reg20: u16,
    values: [u16; BACKUP_REG_COUNT],
}

/// One opened board: the streaming contexts plus the clock control paths.
pub struct SdrDevice {
    board: Arc<dyn StreamBoard>,
    streamers: Mutex<[Option<Arc<Streamer>>; MAX_LINKS]>,
    // Last rxRate handed to the retuner, as f64 bits.
    expected_sample_rate: AtomicU64,
}

impl SdrDevice {
    pub fn new(board: Arc<dyn StreamBoard>) -> Self {
        Self {
            board,
            streamers: Mutex::new([None, None]),
            expected_sample_rate: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn board(&self) -> &Arc<dyn StreamBoard> {
        &self.board
    }

    /// The streaming context of one link, created on first use.
    pub fn streamer(&self, link: usize) -> Result<Arc<Streamer>> {
        let mut streamers = self.streamers.lock().unwrap();
        let slot = streamers
            .get_mut(link)
            .ok_or_else(|| Error::config(format!("link index {link} out of range")))?;
        Ok(slot
            .get_or_insert_with(|| Streamer::new(self.board.clone(), link))
            .clone())
    }

    /// The sample rate the board is currently configured for.
    pub fn expected_sample_rate(&self) -> f64 {
        f64::from_bits(self.expected_sample_rate.load(Ordering::Relaxed))
    }

    fn set_expected_sample_rate(&self, rate_hz: f64) {
        self.expected_sample_rate
            .store(rate_hz.to_bits(), Ordering::Relaxed);
    }

    fn link_running(&self, link: usize) -> bool {
        let streamers = self.streamers.lock().unwrap();
        streamers
            .get(link)
            .and_then(|slot| slot.as_ref())
            .is_some_and(|s| s.is_rx_running() || s.is_tx_running())
    }

    /// Retune the RF interface clocks with caller-supplied phase shifts.
    pub fn update_external_data_rate_with_phases(
        &self,
        channel: usize,
        tx_rate_hz: f64,
        rx_rate_hz: f64,
        tx_phase_deg: f64,
        rx_phase_deg: f64,
    ) -> Result<()> {
        validate_rates(channel, tx_rate_hz, rx_rate_hz)?;
        let tx_clk = 2.0 * tx_rate_hz;
        let rx_clk = 2.0 * rx_rate_hz;
        self.set_expected_sample_rate(rx_rate_hz);

        let pll = clocks::pll_index(channel);
        let mut rx_clocks = clocks::clock_pair(rx_clk, rx_phase_deg, false);
        self.board.set_pll_frequency(pll + 1, rx_clk, &mut rx_clocks)?;
        let mut tx_clocks = clocks::clock_pair(tx_clk, tx_phase_deg, false);
        self.board.set_pll_frequency(pll, tx_clk, &mut tx_clocks)?;
        Ok(())
    }

    /// Retune the RF interface clocks with fitted phase shifts, running the
    /// FPGA-assisted phase search when the board is eligible and the link
    /// is quiescent.
    pub fn update_external_data_rate(
        &self,
        channel: usize,
        tx_rate_hz: f64,
        rx_rate_hz: f64,
    ) -> Result<()> {
        validate_rates(channel, tx_rate_hz, rx_rate_hz)?;
        let info = self.board.device_info();
        let tx_clk = 2.0 * tx_rate_hz;
        let rx_clk = 2.0 * rx_rate_hz;
        let rx_phase = clocks::default_phase(Direction::Rx, info.chip_version, rx_clk);
        let tx_phase = clocks::default_phase(Direction::Tx, info.chip_version, tx_clk);

        // The search needs exclusive use of the link and the test pattern
        // generators; never run it under a live stream.
        let phase_search = !self.link_running(channel)
            && info.chip_version == CHIP_VERSION_R3
            && info.kind == BoardKind::DualChipPcie
            && (rx_clk >= MIN_PLL_CLK_HZ || tx_clk >= MIN_PLL_CLK_HZ);
        self.set_expected_sample_rate(rx_rate_hz);

        let backup = if phase_search {
            Some(self.backup_phase_search_registers(channel)?)
        } else {
            None
        };

        let result = self.retune(channel, &info, tx_clk, rx_clk, tx_phase, rx_phase, phase_search);

        if let Some(backup) = backup {
            match self.restore_phase_search_registers(channel, &backup) {
                Ok(()) => {}
                Err(e) if result.is_err() => {
                    // Restore stays best-effort once the retune already
                    // failed; the original error wins.
                    tracing::warn!("restoring RF registers after failed retune: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn retune(
        &self,
        channel: usize,
        info: &DeviceInfo,
        tx_clk: f64,
        rx_clk: f64,
        tx_phase: f64,
        rx_phase: f64,
        phase_search: bool,
    ) -> Result<()> {
        let pll = clocks::pll_index(channel);

        if rx_clk >= MIN_PLL_CLK_HZ || info.hardware_rev < 3 {
            if phase_search {
                let words: Vec<u32> = PHASE_SEARCH_ADDRS
                    .iter()
                    .zip(RX_TEST_PATTERN)
                    .map(|(&addr, value)| spi::write_word(addr, value))
                    .collect();
                self.board.rf_spi_write(&words, channel)?;
            }
            let mut rx_clocks = clocks::clock_pair(rx_clk, rx_phase, phase_search);
            self.board.set_pll_frequency(pll + 1, rx_clk, &mut rx_clocks)?;
        } else {
            self.board.set_direct_clocking(pll + 1, rx_clk, 90.0)?;
        }

        if tx_clk >= MIN_PLL_CLK_HZ || info.hardware_rev < 3 {
            if phase_search {
                self.board.write_register(regs::INTERFACE_CTRL, 0)?;
                let words: Vec<u32> = PHASE_SEARCH_ADDRS
                    .iter()
                    .zip(TX_TEST_PATTERN)
                    .map(|(&addr, value)| spi::write_word(addr, value))
                    .collect();
                self.board.rf_spi_write(&words, channel)?;
                self.board
                    .write_register(regs::INTERFACE_CTRL, regs::TX_TEST_PATH)?;
            }
            let mut tx_clocks = clocks::clock_pair(tx_clk, tx_phase, phase_search);
            self.board.set_pll_frequency(pll, tx_clk, &mut tx_clocks)?;
        } else {
            self.board.set_direct_clocking(pll, tx_clk, 90.0)?;
        }
        Ok(())
    }

    fn backup_phase_search_registers(&self, chip: usize) -> Result<PhaseSearchBackup> {
        let mut reg20 = [0u16; 1];
        self.board
            .rf_spi_read(&[regs::RF_CHANNEL_ENABLE], &mut reg20, chip)?;
        // Park the unused channel paths while the search runs.
        self.board
            .rf_spi_write(&[spi::write_word(regs::RF_CHANNEL_ENABLE, 0xFFFD)], chip)?;

        let mut values = [0u16; BACKUP_REG_COUNT];
        self.board
            .rf_spi_read(&PHASE_SEARCH_ADDRS[..BACKUP_REG_COUNT], &mut values, chip)?;
        Ok(PhaseSearchBackup {
            reg20: reg20[0],
            values,
        })
    }

    fn restore_phase_search_registers(
        &self,
        chip: usize,
        backup: &PhaseSearchBackup,
    ) -> Result<()> {
        let words: Vec<u32> = PHASE_SEARCH_ADDRS[..BACKUP_REG_COUNT]
            .iter()
            .zip(backup.values)
            .map(|(&addr, value)| spi::write_word(addr, value))
            .collect();
        self.board.rf_spi_write(&words, chip)?;
        self.board
            .rf_spi_write(&[spi::write_word(regs::RF_CHANNEL_ENABLE, backup.reg20)], chip)?;
        self.board.write_register(regs::INTERFACE_CTRL, 0)?;
        Ok(())
    }

    /// Diagnostic single-shot capture from a stream endpoint, bypassing the
    /// packet loops. Returns the bytes received within `timeout_ms`.
    pub fn read_raw_stream_data(
        &self,
        buffer: &mut [u8],
        ep_index: usize,
        timeout_ms: u32,
    ) -> Result<usize> {
        let board = self.board.as_ref();
        board.write_register(regs::ENDPOINT_SELECT, 1 << ep_index)?;
        streamer::stop_streaming(board)?;
        board.reset_stream_buffers(ep_index)?;
        board.write_register(
            regs::STREAM_MODE,
            regs::MODE_LINK_ENABLE | regs::MODE_SAMPLE_12BIT,
        )?;
        board.write_register(regs::CHANNEL_ENABLE, 1)?;
        streamer::start_streaming(board)?;
        let received = board.read_raw(buffer, ep_index, timeout_ms)?;
        streamer::stop_streaming(board)?;
        board.abort_raw_read(ep_index);
        Ok(received)
    }
}

fn validate_rates(channel: usize, tx_rate_hz: f64, rx_rate_hz: f64) -> Result<()> {
    if channel >= MAX_LINKS {
        return Err(Error::config(format!("channel index {channel} out of range")));
    }
    if !(tx_rate_hz > 0.0) || !(rx_rate_hz > 0.0) {
        return Err(Error::config(format!(
            "sample rates must be positive (tx {tx_rate_hz}, rx {rx_rate_hz})"
        )));
    }
    Ok(())
}
