//! FPGA data-packet views and the sample codec.
//!
//! Every packet on the wire is 4096 bytes, little-endian: 8 reserved bytes,
//! an 8-byte sample counter, then 4080 bytes of payload. Two header bits
//! matter to the engine: `reserved[0]` bit 3 is the board-reported TX-late
//! indicator, bit 4 the host-set ignore-timestamp request.
//!
//! The payload carries complex int16 samples either unpacked (4 bytes per
//! sample) or packed to 12 bits per component (3 bytes per sample). With
//! two channels, samples interleave per-sample: `A0 B0 A1 B1 …`.

use crate::Complex16;

/// Size of one FPGA data packet on the wire.
pub const PACKET_SIZE: usize = 4096;
/// Reserved bytes plus the sample counter.
pub const HEADER_SIZE: usize = 16;
/// Sample payload bytes per packet.
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE;

/// Board-reported TX-late indicator in `reserved[0]`.
pub const TX_LATE: u8 = 1 << 3;
/// Host-set ignore-timestamp request in `reserved[0]`.
pub const IGNORE_TIMESTAMP: u8 = 1 << 4;

/// Samples carried per packet for one channel.
pub const fn samples_in_packet(packed: bool, channels: usize) -> usize {
    (if packed { 1360 } else { 1020 }) / channels
}

/// Read-only view over one packet inside a transfer buffer.
///
/// Length is validated at construction; no reinterpretation of raw memory
/// is involved.
#[derive(Clone, Copy)]
pub struct PacketView<'a> {
    bytes: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        (bytes.len() == PACKET_SIZE).then_some(Self { bytes })
    }

    /// `reserved[0]`, the flag byte.
    pub fn flags(&self) -> u8 {
        self.bytes[0]
    }

    /// The board's sample counter for the first sample of the payload.
    pub fn counter(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[8..HEADER_SIZE]);
        u64::from_le_bytes(raw)
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..]
    }
}

/// Mutable view used when assembling outgoing packets.
pub struct PacketMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> PacketMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Option<Self> {
        (bytes.len() == PACKET_SIZE).then_some(Self { bytes })
    }

    /// Zero the reserved bytes and the counter.
    pub fn clear_header(&mut self) {
        self.bytes[..HEADER_SIZE].fill(0);
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.bytes[0] = flags;
    }

    pub fn set_counter(&mut self, counter: u64) {
        self.bytes[8..HEADER_SIZE].copy_from_slice(&counter.to_le_bytes());
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[HEADER_SIZE..]
    }
}

/// Iterate over the whole packets contained in a transfer buffer. A
/// trailing partial packet is ignored.
pub fn packets(buf: &[u8]) -> impl Iterator<Item = PacketView<'_>> {
    buf.chunks_exact(PACKET_SIZE).filter_map(PacketView::new)
}

/// Iterate mutably over the whole packets in an outgoing buffer.
pub fn packets_mut(buf: &mut [u8]) -> impl Iterator<Item = PacketMut<'_>> {
    buf.chunks_exact_mut(PACKET_SIZE).filter_map(PacketMut::new)
}

/// Pack per-channel sample frames into a packet payload.
///
/// `src` holds one or two channels; `count` samples are taken from each and
/// interleaved per-sample. Returns the number of payload bytes written.
/// Packed mode keeps the low 12 bits of each component.
pub fn samples_to_payload(
    src: &[Vec<Complex16>],
    count: usize,
    packed: bool,
    out: &mut [u8],
) -> usize {
    let channels = src.len();
    let count = count.min(samples_in_packet(packed, channels));
    let mut offset = 0;
    if packed {
        for i in 0..count {
            for ch in src {
                let s = ch[i];
                let re = (s.re as u16) & 0x0FFF;
                let im = (s.im as u16) & 0x0FFF;
                out[offset] = re as u8;
                out[offset + 1] = ((re >> 8) as u8) | ((im as u8) << 4);
                out[offset + 2] = (im >> 4) as u8;
                offset += 3;
            }
        }
    } else {
        for i in 0..count {
            for ch in src {
                let s = ch[i];
                out[offset..offset + 2].copy_from_slice(&s.re.to_le_bytes());
                out[offset + 2..offset + 4].copy_from_slice(&s.im.to_le_bytes());
                offset += 4;
            }
        }
    }
    offset
}

/// Unpack a packet payload into per-channel sample frames.
///
/// `out` holds one or two pre-sized channel buffers. Returns the number of
/// samples written per channel. Packed components are sign-extended from
/// 12 bits.
pub fn payload_to_samples(
    payload: &[u8],
    packed: bool,
    out: &mut [Vec<Complex16>],
) -> usize {
    let channels = out.len();
    let bytes_per_sample = if packed { 3 } else { 4 };
    let stride = bytes_per_sample * channels;
    let count = (payload.len() / stride).min(samples_in_packet(packed, channels));
    let mut offset = 0;
    if packed {
        for i in 0..count {
            for ch in out.iter_mut() {
                let lo = payload[offset] as u16;
                let mid = payload[offset + 1] as u16;
                let hi = payload[offset + 2] as u16;
                let re12 = lo | ((mid & 0x0F) << 8);
                let im12 = (mid >> 4) | (hi << 4);
                ch[i] = Complex16::new(sign_extend_12(re12), sign_extend_12(im12));
                offset += 3;
            }
        }
    } else {
        for i in 0..count {
            for ch in out.iter_mut() {
                let re = i16::from_le_bytes([payload[offset], payload[offset + 1]]);
                let im = i16::from_le_bytes([payload[offset + 2], payload[offset + 3]]);
                ch[i] = Complex16::new(re, im);
                offset += 4;
            }
        }
    }
    count
}

fn sign_extend_12(value: u16) -> i16 {
    ((value << 4) as i16) >> 4
}
