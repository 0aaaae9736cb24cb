//! Fixed-depth pipelined transfer queue.
//!
//! Some transports only reach full throughput when the host keeps several
//! transfers in flight. This module provides the in-flight machinery behind
//! the [`QueuedPipe`](crate::QueuedPipe) surface: a fixed table of transfer
//! slots fed to a single worker thread that performs the underlying
//! synchronous I/O in submission order. Callers get back slot handles and
//! wait on per-slot completion.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};

use crate::error::{Error, Result};

/// Number of in-flight slots. Must be a power of two.
pub const QUEUE_DEPTH: usize = 16;

/// Identifies an in-flight transfer slot.
pub type TransferHandle = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Submitted, not yet picked up by the worker.
    Queued,
    /// The worker is performing the transfer.
    Active,
    /// Transfer finished; `result` holds the byte count.
    Done,
    /// Transfer failed or was aborted before it started.
    Failed,
    /// Caller gave up on an active transfer; reclaim on completion.
    Abandoned,
}

struct Slot {
    data: Vec<u8>,
    len: usize,
    result: usize,
    generation: u64,
    state: SlotState,
}

struct Shared {
    slots: Mutex<Vec<Slot>>,
    completed: Condvar,
}

/// One direction of a pipelined transport.
pub struct TransferQueue {
    shared: Arc<Shared>,
    jobs: Option<Sender<(usize, u64)>>,
    worker: Option<JoinHandle<()>>,
}

impl TransferQueue {
    /// Spawn the worker. `io` performs one synchronous transfer over the
    /// underlying pipe and returns the byte count.
    pub fn new<F>(name: &str, mut io: F) -> Result<Self>
    where
        F: FnMut(&mut [u8]) -> Result<usize> + Send + 'static,
    {
        let slots = (0..QUEUE_DEPTH)
            .map(|_| Slot {
                data: Vec::new(),
                len: 0,
                result: 0,
                generation: 0,
                state: SlotState::Free,
            })
            .collect();
        let shared = Arc::new(Shared {
            slots: Mutex::new(slots),
            completed: Condvar::new(),
        });
        let (jobs, jobs_rx) = channel::unbounded::<(usize, u64)>();

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("rs-lms-{name}"))
            .spawn(move || {
                for (idx, generation) in jobs_rx {
                    let (mut data, len) = {
                        let mut slots = worker_shared.slots.lock().unwrap();
                        let slot = &mut slots[idx];
                        // Stale job: the slot was aborted or reclaimed since
                        // submission.
                        if slot.generation != generation || slot.state != SlotState::Queued {
                            continue;
                        }
                        slot.state = SlotState::Active;
                        (std::mem::take(&mut slot.data), slot.len)
                    };

                    let outcome = io(&mut data[..len]);

                    let mut slots = worker_shared.slots.lock().unwrap();
                    let slot = &mut slots[idx];
                    slot.data = data;
                    if slot.state == SlotState::Abandoned {
                        slot.state = SlotState::Free;
                    } else {
                        match outcome {
                            Ok(n) => {
                                slot.result = n;
                                slot.state = SlotState::Done;
                            }
                            Err(e) => {
                                tracing::debug!("transfer failed: {e}");
                                slot.result = 0;
                                slot.state = SlotState::Failed;
                            }
                        }
                    }
                    worker_shared.completed.notify_all();
                }
            })
            .map_err(Error::Io)?;

        Ok(Self {
            shared,
            jobs: Some(jobs),
            worker: Some(worker),
        })
    }

    /// Queue a read of `len` bytes. The slot provides the buffer; the data
    /// is copied out by [`finish_read`](Self::finish_read).
    pub fn begin_read(&self, len: usize) -> Result<TransferHandle> {
        self.submit(len, None)
    }

    /// Queue a write of `data`. The bytes are copied into the slot so the
    /// caller may reuse its buffer immediately.
    pub fn begin_write(&self, data: &[u8]) -> Result<TransferHandle> {
        self.submit(data.len(), Some(data))
    }

    fn submit(&self, len: usize, data: Option<&[u8]>) -> Result<TransferHandle> {
        let mut slots = self.shared.slots.lock().unwrap();
        let idx = slots
            .iter()
            .position(|s| s.state == SlotState::Free)
            .ok_or_else(|| Error::StreamingError("transfer queue full".into()))?;
        let slot = &mut slots[idx];
        if slot.data.len() < len {
            if slot.data.try_reserve_exact(len - slot.data.len()).is_err() {
                return Err(Error::StreamingError("transfer buffer allocation".into()));
            }
            slot.data.resize(len, 0);
        }
        if let Some(src) = data {
            slot.data[..len].copy_from_slice(src);
        }
        slot.len = len;
        slot.result = 0;
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Queued;
        let generation = slot.generation;
        drop(slots);

        if let Some(jobs) = &self.jobs {
            jobs.send((idx, generation))
                .map_err(|_| Error::StreamingError("transfer worker gone".into()))?;
        }
        Ok(idx)
    }

    /// Wait until the transfer completed (successfully or not). Returns
    /// `false` on timeout or for a handle that is not in flight.
    pub fn wait(&self, handle: TransferHandle, timeout_ms: u32) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut slots = self.shared.slots.lock().unwrap();
        loop {
            match slots.get(handle).map(|s| s.state) {
                Some(SlotState::Done) | Some(SlotState::Failed) => return true,
                Some(SlotState::Queued) | Some(SlotState::Active) => {}
                _ => return false,
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .completed
                .wait_timeout(slots, deadline - now)
                .unwrap();
            slots = guard;
        }
    }

    /// Collect a completed read: copies the received bytes into `dst` and
    /// frees the slot. Returns 0 if the transfer failed or is still pending
    /// (a pending slot is reclaimed once the worker finishes with it).
    pub fn finish_read(&self, dst: &mut [u8], handle: TransferHandle) -> usize {
        let mut slots = self.shared.slots.lock().unwrap();
        let Some(slot) = slots.get_mut(handle) else {
            return 0;
        };
        match slot.state {
            SlotState::Done => {
                let n = slot.result.min(dst.len());
                dst[..n].copy_from_slice(&slot.data[..n]);
                slot.state = SlotState::Free;
                slot.result
            }
            SlotState::Failed => {
                slot.state = SlotState::Free;
                0
            }
            SlotState::Queued => {
                slot.state = SlotState::Free;
                0
            }
            SlotState::Active => {
                slot.state = SlotState::Abandoned;
                0
            }
            _ => 0,
        }
    }

    /// Collect a completed write; returns the byte count actually sent.
    pub fn finish_write(&self, handle: TransferHandle) -> usize {
        let mut slots = self.shared.slots.lock().unwrap();
        let Some(slot) = slots.get_mut(handle) else {
            return 0;
        };
        match slot.state {
            SlotState::Done => {
                slot.state = SlotState::Free;
                slot.result
            }
            SlotState::Failed | SlotState::Queued => {
                slot.state = SlotState::Free;
                0
            }
            SlotState::Active => {
                slot.state = SlotState::Abandoned;
                0
            }
            _ => 0,
        }
    }

    /// Fail every submission the worker has not started yet and wake all
    /// waiters. Transfers already on the wire complete naturally.
    pub fn abort(&self) {
        let mut slots = self.shared.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if slot.state == SlotState::Queued {
                slot.state = SlotState::Failed;
            }
        }
        self.shared.completed.notify_all();
    }

    /// Number of slots currently free for submission.
    pub fn free_slots(&self) -> usize {
        let slots = self.shared.slots.lock().unwrap();
        slots.iter().filter(|s| s.state == SlotState::Free).count()
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
