//! Interface-clock retuning support: phase coefficient tables, PLL index
//! mapping and the RF test-pattern recipe used by the phase search.
//!
//! The RF data interface is clocked at twice the baseband sample rate.
//! Each direction gets a pair of PLL outputs: output 0 carries the
//! interface clock, output 1 a phase-shifted copy aligned to the sampling
//! point. Absent a phase search, the shift comes from linear fits per
//! silicon revision, measured against interface clock.

use rs_lms::{CHIP_VERSION_R3, PllClock};

const RX_PH_C1: [f64; 2] = [91.08, 89.46];
const RX_PH_C2: [f64; 2] = [-1.0 / 6e6, 1.24e-6];
const TX_PH_C1: [f64; 2] = [89.75, 89.61];
const TX_PH_C2: [f64; 2] = [-3.0e-7, 2.71e-7];

/// RF registers touched by the phase search, in write order. The first
/// [`BACKUP_REG_COUNT`] are backed up and restored; the tail addresses only
/// carry test-pattern writes.
pub(crate) const PHASE_SEARCH_ADDRS: [u16; 12] = [
    0x0021, 0x0022, 0x0023, 0x0024, 0x0027, 0x002A, 0x0400, 0x040C, 0x040B, 0x0400, 0x040B,
    0x0400,
];
pub(crate) const BACKUP_REG_COUNT: usize = PHASE_SEARCH_ADDRS.len() - 4;

/// RF test pattern feeding the RX phase search.
pub(crate) const RX_TEST_PATTERN: [u16; 12] = [
    0x0E9F, 0x07FF, 0x5550, 0xE4E4, 0xE4E4, 0x0086, 0x028D, 0x00FF, 0x5555, 0x02CD, 0xAAAA,
    0x02ED,
];
/// RF test pattern feeding the TX phase search.
pub(crate) const TX_TEST_PATTERN: [u16; 6] = [0x0E9F, 0x07FF, 0x5550, 0xE4E4, 0xE4E4, 0x0484];

/// Minimum interface clock the PLLs lock to; below this (on hardware that
/// supports it) the interface is clocked directly from the reference.
pub(crate) const MIN_PLL_CLK_HZ: f64 = 5e6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Rx,
    Tx,
}

/// Fitted phase shift for a direction, silicon revision and interface
/// clock.
pub(crate) fn default_phase(direction: Direction, chip_version: u16, interface_clk_hz: f64) -> f64 {
    let v = (chip_version == CHIP_VERSION_R3) as usize;
    match direction {
        Direction::Rx => RX_PH_C1[v] + RX_PH_C2[v] * interface_clk_hz,
        Direction::Tx => TX_PH_C1[v] + TX_PH_C2[v] * interface_clk_hz,
    }
}

/// TX PLL index serving a channel; RX uses the next index up.
pub(crate) fn pll_index(channel: usize) -> u8 {
    if channel == 1 { 2 } else { 0 }
}

/// The two PLL outputs for one direction.
pub(crate) fn clock_pair(interface_clk_hz: f64, phase_deg: f64, find_phase: bool) -> [PllClock; 2] {
    [
        PllClock {
            index: 0,
            out_frequency: interface_clk_hz,
            ..Default::default()
        },
        PllClock {
            index: 1,
            out_frequency: interface_clk_hz,
            phase_shift_deg: phase_deg,
            find_phase,
            ..Default::default()
        },
    ]
}
