//! Bounded timestamped sample FIFO between user code and the packet loops.
//!
//! One FIFO sits between each stream channel and its packet loop: single
//! producer, single consumer, capacity fixed in samples. Writers either
//! block for space or, with [`OVERWRITE_OLD`], push out the oldest samples
//! and return immediately. Readers collect the requested count, waiting up
//! to their timeout; a short read signals starvation.
//!
//! Timestamps and flags ride along with the samples: the metadata returned
//! by [`RingFifo::read`] describes the first sample handed back, so a
//! consumer popping mid-transfer still sees the right sample counter.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::Complex16;

/// Drop the oldest samples instead of blocking when the FIFO is full.
pub const OVERWRITE_OLD: u32 = 1 << 0;
/// Honor the attached timestamp when transmitting.
pub const SYNC_TIMESTAMP: u32 = 1 << 1;
/// Last frame of a burst.
pub const END_BURST: u32 = 1 << 2;

/// Rides along with every FIFO transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Sample counter of the first sample in the transfer.
    pub timestamp: u64,
    /// Combination of [`OVERWRITE_OLD`], [`SYNC_TIMESTAMP`], [`END_BURST`].
    pub flags: u32,
}

// A stretch of buffered samples with contiguous timestamps and identical
// flags.
struct Run {
    timestamp: u64,
    flags: u32,
    len: usize,
}

struct Inner {
    samples: VecDeque<Complex16>,
    runs: VecDeque<Run>,
}

/// Bounded single-producer/single-consumer sample queue.
pub struct RingFifo {
    capacity: usize,
    inner: Mutex<Inner>,
    readable: Condvar,
    writable: Condvar,
}

impl RingFifo {
    /// Create a FIFO holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                samples: VecDeque::with_capacity(capacity),
                runs: VecDeque::new(),
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push up to `src.len()` samples, associating `meta.timestamp` with
    /// the first of them.
    ///
    /// With [`OVERWRITE_OLD`] the oldest buffered samples make room and the
    /// call never blocks; otherwise the writer waits for space until
    /// `timeout_ms` expires. Returns the number of samples pushed.
    pub fn write(&self, src: &[Complex16], meta: Metadata, timeout_ms: u32) -> usize {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut inner = self.inner.lock().unwrap();
        let mut pushed = 0;
        while pushed < src.len() {
            if inner.samples.len() == self.capacity {
                if meta.flags & OVERWRITE_OLD != 0 {
                    Self::drop_oldest(&mut inner, src.len() - pushed);
                } else {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    inner = self
                        .writable
                        .wait_timeout(inner, deadline - now)
                        .unwrap()
                        .0;
                    continue;
                }
            }
            let free = self.capacity - inner.samples.len();
            let n = free.min(src.len() - pushed);
            for &sample in &src[pushed..pushed + n] {
                inner.samples.push_back(sample);
            }
            Self::append_run(
                &mut inner,
                meta.timestamp.wrapping_add(pushed as u64),
                meta.flags,
                n,
            );
            pushed += n;
            self.readable.notify_all();
        }
        pushed
    }

    /// Pop up to `dst.len()` samples, waiting until the full count is
    /// available or `timeout_ms` expires. `meta` receives the timestamp and
    /// flags of the first returned sample. Returns the number popped.
    pub fn read(&self, dst: &mut [Complex16], meta: &mut Metadata, timeout_ms: u32) -> usize {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut inner = self.inner.lock().unwrap();
        let mut popped = 0;
        loop {
            let available = inner.samples.len();
            if available > 0 {
                if popped == 0
                    && let Some(front) = inner.runs.front()
                {
                    meta.timestamp = front.timestamp;
                    meta.flags = front.flags;
                }
                let take = available.min(dst.len() - popped);
                for slot in &mut dst[popped..popped + take] {
                    if let Some(sample) = inner.samples.pop_front() {
                        *slot = sample;
                    }
                }
                Self::consume_runs(&mut inner, take);
                popped += take;
                self.writable.notify_all();
            }
            if popped == dst.len() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            inner = self
                .readable
                .wait_timeout(inner, deadline - now)
                .unwrap()
                .0;
        }
        popped
    }

    /// Drop all pending samples.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.samples.clear();
        inner.runs.clear();
        self.writable.notify_all();
    }

    fn append_run(inner: &mut Inner, timestamp: u64, flags: u32, len: usize) {
        if let Some(last) = inner.runs.back_mut()
            && last.flags == flags
            && last.timestamp.wrapping_add(last.len as u64) == timestamp
        {
            last.len += len;
            return;
        }
        inner.runs.push_back(Run {
            timestamp,
            flags,
            len,
        });
    }

    fn drop_oldest(inner: &mut Inner, count: usize) {
        let count = count.min(inner.samples.len());
        inner.samples.drain(..count);
        Self::consume_runs(inner, count);
    }

    fn consume_runs(inner: &mut Inner, mut count: usize) {
        while count > 0 {
            let Some(front) = inner.runs.front_mut() else {
                break;
            };
            if front.len <= count {
                count -= front.len;
                inner.runs.pop_front();
            } else {
                front.len -= count;
                front.timestamp = front.timestamp.wrapping_add(count as u64);
                count = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn samples(range: std::ops::Range<i16>) -> Vec<Complex16> {
        range.map(|i| Complex16::new(i, -i)).collect()
    }

    fn meta(timestamp: u64, flags: u32) -> Metadata {
        Metadata { timestamp, flags }
    }

    #[test]
    fn test_fifo_preserves_order() {
        let fifo = RingFifo::new(64);
        assert_eq!(fifo.write(&samples(0..8), meta(0, 0), 10), 8);
        assert_eq!(fifo.write(&samples(8..16), meta(8, 0), 10), 8);

        let mut out = vec![Complex16::default(); 16];
        let mut m = Metadata::default();
        assert_eq!(fifo.read(&mut out, &mut m, 10), 16);
        assert_eq!(out, samples(0..16));
        assert_eq!(m.timestamp, 0);
    }

    #[test]
    fn test_overwrite_old_drops_oldest() {
        let fifo = RingFifo::new(8);
        assert_eq!(fifo.write(&samples(0..8), meta(0, OVERWRITE_OLD), 10), 8);
        // Three more than fit: the oldest three must go.
        assert_eq!(fifo.write(&samples(8..11), meta(8, OVERWRITE_OLD), 10), 3);

        let mut out = vec![Complex16::default(); 8];
        let mut m = Metadata::default();
        assert_eq!(fifo.read(&mut out, &mut m, 10), 8);
        assert_eq!(out, samples(3..11));
        assert_eq!(m.timestamp, 3, "timestamp follows the dropped samples");
    }

    #[test]
    fn test_blocking_write_times_out_when_full() {
        let fifo = RingFifo::new(4);
        let start = Instant::now();
        assert_eq!(fifo.write(&samples(0..6), meta(0, 0), 50), 4);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_read_timeout_gives_short_read() {
        let fifo = RingFifo::new(16);
        fifo.write(&samples(0..4), meta(100, 0), 10);
        let mut out = vec![Complex16::default(); 8];
        let mut m = Metadata::default();
        assert_eq!(fifo.read(&mut out, &mut m, 30), 4);
        assert_eq!(m.timestamp, 100);
    }

    #[test]
    fn test_partial_read_advances_timestamp() {
        let fifo = RingFifo::new(16);
        fifo.write(&samples(0..10), meta(1000, 0), 10);

        let mut out = vec![Complex16::default(); 4];
        let mut m = Metadata::default();
        assert_eq!(fifo.read(&mut out, &mut m, 10), 4);
        assert_eq!(m.timestamp, 1000);
        assert_eq!(fifo.read(&mut out, &mut m, 10), 4);
        assert_eq!(m.timestamp, 1004);
    }

    #[test]
    fn test_flags_ride_through() {
        let fifo = RingFifo::new(16);
        fifo.write(&samples(0..4), meta(0, SYNC_TIMESTAMP), 10);
        fifo.write(&samples(4..8), meta(4, SYNC_TIMESTAMP | END_BURST), 10);

        let mut out = vec![Complex16::default(); 4];
        let mut m = Metadata::default();
        fifo.read(&mut out, &mut m, 10);
        assert_eq!(m.flags, SYNC_TIMESTAMP);
        fifo.read(&mut out, &mut m, 10);
        assert_eq!(m.flags, SYNC_TIMESTAMP | END_BURST);
    }

    #[test]
    fn test_read_collects_across_writes() {
        let fifo = Arc::new(RingFifo::new(1024));
        let producer = fifo.clone();
        let handle = std::thread::spawn(move || {
            for chunk in 0..4u64 {
                std::thread::sleep(Duration::from_millis(10));
                let data = samples(0..32);
                producer.write(&data, meta(chunk * 32, 0), 100);
            }
        });

        let mut out = vec![Complex16::default(); 128];
        let mut m = Metadata::default();
        let popped = fifo.read(&mut out, &mut m, 500);
        handle.join().unwrap();
        assert_eq!(popped, 128, "reader waits for the full batch");
        assert_eq!(m.timestamp, 0);
    }

    #[test]
    fn test_clear_empties_fifo() {
        let fifo = RingFifo::new(16);
        fifo.write(&samples(0..8), meta(0, 0), 10);
        fifo.clear();
        assert!(fifo.is_empty());
        let mut out = vec![Complex16::default(); 4];
        let mut m = Metadata::default();
        assert_eq!(fifo.read(&mut out, &mut m, 10), 0);
    }

    #[test]
    fn test_large_write_with_overwrite_keeps_tail() {
        let fifo = RingFifo::new(8);
        assert_eq!(fifo.write(&samples(0..20), meta(0, OVERWRITE_OLD), 10), 20);
        let mut out = vec![Complex16::default(); 8];
        let mut m = Metadata::default();
        assert_eq!(fifo.read(&mut out, &mut m, 10), 8);
        assert_eq!(out, samples(12..20));
        assert_eq!(m.timestamp, 12);
    }
}
