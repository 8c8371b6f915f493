//! Cross-thread delivery queue
//!
//! The USB worker produces audio frames, metadata records and error strings;
//! the dispatcher thread consumes them and invokes listeners. One mutex
//! guards the queues together with the `stopped` flag and the shutdown cancel
//! counter, and a condvar wakes the dispatcher. The mutex is held only for
//! the short enqueue/drain critical sections, never while listeners run.
//!
//! Within one event kind delivery is strictly FIFO. A single wake-up may
//! carry audio, metadata and an error together; the dispatcher delivers audio
//! first, then metadata, then the error.

use crate::events::Metadata;
use std::sync::{Condvar, Mutex};
use tracing::trace;

/// Shutdown decision taken by the worker loop after each event-pump tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownPhase {
    /// Not stopping; keep pumping.
    Running,
    /// Stop was just observed: cancels must be issued now, exactly once.
    CancelNow,
    /// Every cancelled completion has been accounted for; the worker exits.
    Finished,
}

#[derive(Debug)]
struct Pending {
    stopped: bool,
    /// -1 until shutdown is initiated, then 1 + NUM_TRANSFERS counting down
    /// as cancelled completions arrive.
    pending_cancels: i32,
    audio: Vec<Vec<u8>>,
    metadata: Vec<Metadata>,
    error: Option<String>,
}

/// Everything drained from the queues by one dispatcher wake-up.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    pub audio: Vec<Vec<u8>>,
    pub metadata: Vec<Metadata>,
    pub error: Option<String>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.metadata.is_empty() && self.error.is_none()
    }
}

/// Session state shared between the USB worker and the dispatcher.
pub(crate) struct SharedState {
    pending: Mutex<Pending>,
    wake: Condvar,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                stopped: false,
                pending_cancels: -1,
                audio: Vec::new(),
                metadata: Vec::new(),
                error: None,
            }),
            wake: Condvar::new(),
        }
    }

    /// Enqueue an audio frame. Ownership transfers to the dispatcher, which
    /// hands the buffer to listeners and drops it after delivery.
    pub fn push_audio(&self, frame: Vec<u8>) {
        let mut pending = self.pending.lock().unwrap();
        pending.audio.push(frame);
        self.wake.notify_all();
    }

    pub fn push_metadata(&self, metadata: Metadata) {
        let mut pending = self.pending.lock().unwrap();
        pending.metadata.push(metadata);
        self.wake.notify_all();
    }

    /// Record an error string. At most one error is pending at a time; later
    /// errors are dropped until the dispatcher drains the slot.
    pub fn push_error(&self, message: String) {
        let mut pending = self.pending.lock().unwrap();
        if pending.error.is_none() {
            pending.error = Some(message);
        } else {
            trace!(dropped = %message, "error slot occupied");
        }
        self.wake.notify_all();
    }

    /// Block until there is something to deliver or the session stops.
    ///
    /// Returns `None` once stopped; from that point no further batches are
    /// handed out, which is what guarantees that no listener runs after
    /// `Session::close` returns.
    pub fn wait_drain(&self) -> Option<Batch> {
        let mut pending = self.pending.lock().unwrap();
        loop {
            if pending.stopped {
                return None;
            }
            let batch = Batch {
                audio: std::mem::take(&mut pending.audio),
                metadata: std::mem::take(&mut pending.metadata),
                error: pending.error.take(),
            };
            if !batch.is_empty() {
                return Some(batch);
            }
            pending = self.wake.wait(pending).unwrap();
        }
    }

    /// Request shutdown and wake both consumer threads.
    pub fn set_stopped(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.stopped = true;
        self.wake.notify_all();
    }

    /// Worker-side shutdown state machine, one atomic step under the mutex.
    ///
    /// The first call that observes `stopped` arms the counter with
    /// `1 + num_transfers` and tells the caller to issue the cancel batch;
    /// cancels are therefore issued exactly once.
    pub fn shutdown_phase(&self, num_transfers: usize) -> ShutdownPhase {
        let mut pending = self.pending.lock().unwrap();
        if !pending.stopped {
            return ShutdownPhase::Running;
        }
        if pending.pending_cancels == -1 {
            pending.pending_cancels = 1 + num_transfers as i32;
            return ShutdownPhase::CancelNow;
        }
        if pending.pending_cancels <= 0 {
            return ShutdownPhase::Finished;
        }
        ShutdownPhase::Running
    }

    /// Account for one cancelled transfer completion.
    pub fn note_cancelled(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.pending_cancels -= 1;
        trace!(remaining = pending.pending_cancels, "transfer cancelled");
    }

    #[cfg(test)]
    pub fn pending_cancels(&self) -> i32 {
        self.pending.lock().unwrap().pending_cancels
    }

    /// Non-blocking drain, test-only.
    #[cfg(test)]
    pub fn try_drain(&self) -> Batch {
        let mut pending = self.pending.lock().unwrap();
        Batch {
            audio: std::mem::take(&mut pending.audio),
            metadata: std::mem::take(&mut pending.metadata),
            error: pending.error.take(),
        }
    }
}
