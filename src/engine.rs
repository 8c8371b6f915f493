//! Transfer engine
//!
//! The worker thread keeps the isochronous audio endpoint and the HID
//! interrupt endpoint continuously serviced. Endpoint plumbing lives behind
//! [`TransferBackend`]; the engine consumes completion records, assembles
//! audio frames, parses VAD/DoA reports and runs the shutdown state machine.
//! Keeping the engine backend-agnostic is what lets the scenario tests drive
//! it with a scripted backend instead of hardware.

use crate::delivery::{SharedState, ShutdownPhase};
use crate::events::Metadata;
use crate::{EVENT_TICK, NUM_PACKETS, NUM_TRANSFERS, PACKET_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// First two bytes of a VAD/DoA interrupt packet.
const METADATA_TAG: [u8; 2] = [0x06, 0x36];

/// One isochronous packet slot as reported by a completed transfer.
#[derive(Debug, Clone)]
pub(crate) struct IsoPacket {
    /// Whether the per-packet status was COMPLETED.
    pub completed: bool,
    /// The packet's buffer slot. Only meaningful when `completed`.
    pub data: [u8; PACKET_SIZE],
}

/// A transfer completion observed by the backend.
#[derive(Debug, Clone)]
pub(crate) enum Completion {
    /// An isochronous transfer finished; packet slots in endpoint order.
    Iso { packets: Vec<IsoPacket> },
    /// An isochronous transfer was cancelled and its descriptor released.
    IsoCancelled,
    /// The interrupt transfer finished with `data` (actual length).
    Irq { data: Vec<u8> },
    /// The interrupt transfer was cancelled and its descriptor released.
    IrqCancelled,
    /// An asynchronous backend failure worth reporting to the application.
    Error(String),
}

/// Endpoint plumbing the engine runs on.
///
/// The real implementation wraps the libusb asynchronous API; tests use a
/// scripted mock. Completed transfers are resubmitted by the backend itself
/// (inside the completion callback for the libusb backend), so the engine
/// only ever consumes.
pub(crate) trait TransferBackend: Send {
    /// Allocate and submit the isochronous pool and the interrupt transfer.
    ///
    /// `Err` is fatal and aborts the worker (allocation failure); individual
    /// submission failures are non-fatal and surface as
    /// [`Completion::Error`] on a later `poll`.
    fn start(&mut self) -> std::result::Result<(), String>;

    /// Drive the event pump for up to `timeout`, returning the completions
    /// observed.
    fn poll(&mut self, timeout: Duration) -> Vec<Completion>;

    /// Issue cancel on the interrupt transfer and every isochronous
    /// transfer. Called exactly once per session. Every one of the
    /// `1 + NUM_TRANSFERS` descriptors must eventually yield a `*Cancelled`
    /// completion, synthesized if the descriptor is already gone.
    fn cancel_all(&mut self);
}

pub(crate) struct TransferEngine<B> {
    backend: B,
    shared: Arc<SharedState>,
}

impl<B: TransferBackend> TransferEngine<B> {
    pub fn new(backend: B, shared: Arc<SharedState>) -> Self {
        Self { backend, shared }
    }

    /// Worker thread main loop. Returns once every cancelled completion has
    /// been accounted for after shutdown.
    pub fn run(mut self) {
        if let Err(message) = self.backend.start() {
            warn!(%message, "transfer engine startup failed");
            self.shared.push_error(message);
            return;
        }
        debug!("transfer engine started");

        loop {
            for completion in self.backend.poll(EVENT_TICK) {
                self.handle(completion);
            }
            match self.shared.shutdown_phase(NUM_TRANSFERS) {
                ShutdownPhase::Running => {}
                ShutdownPhase::CancelNow => self.backend.cancel_all(),
                ShutdownPhase::Finished => break,
            }
        }
        debug!("transfer engine stopped");
    }

    fn handle(&mut self, completion: Completion) {
        match completion {
            Completion::Iso { packets } => self.handle_iso(&packets),
            Completion::Irq { data } => self.handle_irq(&data),
            Completion::IsoCancelled | Completion::IrqCancelled => {
                self.shared.note_cancelled();
            }
            Completion::Error(message) => {
                warn!(%message, "usb transfer error");
                self.shared.push_error(message);
            }
        }
    }

    /// Assemble one audio frame from the per-packet slots of a completed
    /// isochronous transfer. Packets that did not complete are skipped and
    /// reported; successful payloads are appended verbatim, in order.
    fn handle_iso(&mut self, packets: &[IsoPacket]) {
        // Bounded by the transfer buffer, not the reported slot count; a
        // backend reporting more slots than the buffer holds is broken and
        // its frame is dropped.
        let capacity = PACKET_SIZE * NUM_PACKETS;
        let mut frame = Vec::with_capacity(capacity);
        let mut errored = false;

        for packet in packets {
            if !packet.completed {
                self.shared.push_error("incomplete iso xfr".into());
                continue;
            }
            if frame.len() + PACKET_SIZE > capacity {
                self.shared.push_error("overflow in iso xfr".into());
                errored = true;
                break;
            }
            frame.extend_from_slice(&packet.data);
        }

        if errored {
            return;
        }
        if frame.is_empty() {
            debug!("iso transfer yielded no completed packets");
            return;
        }
        self.shared.push_audio(frame);
    }

    /// Parse one interrupt packet. Packets of at least 6 bytes tagged
    /// `06 36` carry `[vad, angle_hi, angle_lo, direction]`; everything else
    /// is ignored.
    fn handle_irq(&mut self, data: &[u8]) {
        if data.len() < 6 || data[..2] != METADATA_TAG {
            return;
        }
        let metadata = Metadata {
            vad: data[2] == 1,
            angle: (u16::from(data[3]) << 8) | u16::from(data[4]),
            direction: data[5],
        };
        self.shared.push_metadata(metadata);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{MockBackend, failed_packet, iso_packet};
    use super::*;
    use crate::NUM_PACKETS;
    use std::sync::atomic::Ordering;

    fn engine_on(shared: &Arc<SharedState>) -> TransferEngine<MockBackend> {
        TransferEngine::new(MockBackend::new(Vec::new()), shared.clone())
    }

    #[test]
    fn test_full_transfer_yields_one_frame() {
        let shared = Arc::new(SharedState::new());
        let mut engine = engine_on(&shared);

        let packets: Vec<_> = (0..NUM_PACKETS as u8).map(iso_packet).collect();
        engine.handle(Completion::Iso { packets });

        let batch = shared.try_drain();
        assert_eq!(batch.audio.len(), 1);
        let frame = &batch.audio[0];
        assert_eq!(frame.len(), PACKET_SIZE * NUM_PACKETS);
        for (i, chunk) in frame.chunks(PACKET_SIZE).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
        assert!(batch.error.is_none());
    }

    #[test]
    fn test_incomplete_packet_is_skipped_and_reported() {
        let shared = Arc::new(SharedState::new());
        let mut engine = engine_on(&shared);

        let mut packets: Vec<_> = (0..NUM_PACKETS as u8).map(iso_packet).collect();
        packets[3] = failed_packet();
        engine.handle(Completion::Iso { packets });

        let batch = shared.try_drain();
        assert_eq!(batch.error.as_deref(), Some("incomplete iso xfr"));
        assert_eq!(batch.audio.len(), 1);
        let frame = &batch.audio[0];
        assert_eq!(frame.len(), PACKET_SIZE * (NUM_PACKETS - 1));
        // Successful payloads stay in endpoint order with the gap closed.
        let expected: Vec<u8> = (0..NUM_PACKETS as u8).filter(|&i| i != 3).collect();
        for (chunk, fill) in frame.chunks(PACKET_SIZE).zip(expected) {
            assert!(chunk.iter().all(|&b| b == fill));
        }
    }

    #[test]
    fn test_all_packets_failed_drops_frame() {
        let shared = Arc::new(SharedState::new());
        let mut engine = engine_on(&shared);

        let packets: Vec<_> = (0..NUM_PACKETS).map(|_| failed_packet()).collect();
        engine.handle(Completion::Iso { packets });

        let batch = shared.try_drain();
        assert!(batch.audio.is_empty());
        assert_eq!(batch.error.as_deref(), Some("incomplete iso xfr"));
    }

    #[test]
    fn test_oversized_transfer_is_dropped() {
        let shared = Arc::new(SharedState::new());
        let mut engine = engine_on(&shared);

        // One slot more than the transfer buffer can hold.
        let packets: Vec<_> = (0..NUM_PACKETS as u8 + 1).map(iso_packet).collect();
        engine.handle(Completion::Iso { packets });

        let batch = shared.try_drain();
        assert!(batch.audio.is_empty());
        assert_eq!(batch.error.as_deref(), Some("overflow in iso xfr"));
    }

    #[test]
    fn test_metadata_parse() {
        let shared = Arc::new(SharedState::new());
        let mut engine = engine_on(&shared);

        engine.handle(Completion::Irq {
            data: vec![0x06, 0x36, 0x01, 0x00, 0xB4, 0x02, 0x00, 0x00],
        });

        let batch = shared.try_drain();
        assert_eq!(
            batch.metadata,
            vec![Metadata {
                vad: true,
                angle: 180,
                direction: 2,
            }]
        );
    }

    #[test]
    fn test_metadata_vad_zero_is_false() {
        let shared = Arc::new(SharedState::new());
        let mut engine = engine_on(&shared);

        engine.handle(Completion::Irq {
            data: vec![0x06, 0x36, 0x00, 0xFF, 0xFF, 0xFF],
        });

        let batch = shared.try_drain();
        assert_eq!(batch.metadata[0].vad, false);
        assert_eq!(batch.metadata[0].angle, 0xFFFF);
        assert_eq!(batch.metadata[0].direction, 0xFF);
    }

    #[test]
    fn test_non_metadata_irq_is_ignored() {
        let shared = Arc::new(SharedState::new());
        let mut engine = engine_on(&shared);

        engine.handle(Completion::Irq {
            data: vec![0x06, 0x37, 0x01, 0x00, 0xB4, 0x02],
        });
        engine.handle(Completion::Irq {
            data: vec![0x06, 0x36, 0x01], // too short
        });

        let batch = shared.try_drain();
        assert!(batch.metadata.is_empty());
        assert!(batch.error.is_none());
    }

    #[test]
    fn test_startup_allocation_failure_aborts_worker() {
        let shared = Arc::new(SharedState::new());
        let engine = TransferEngine::new(
            MockBackend::failing_start("unable to allocate iso transfer"),
            shared.clone(),
        );

        // Returns without looping.
        engine.run();
        assert_eq!(
            shared.try_drain().error.as_deref(),
            Some("unable to allocate iso transfer")
        );
    }

    #[test]
    fn test_submission_failure_is_reported_but_not_fatal() {
        let shared = Arc::new(SharedState::new());
        let packets: Vec<_> = (0..NUM_PACKETS as u8).map(iso_packet).collect();
        let backend = MockBackend::new(vec![vec![
            Completion::Error("error submitting iso transfer: -1".into()),
            Completion::Iso { packets },
        ]]);
        let cancels = backend.cancels_issued();
        let engine = TransferEngine::new(backend, shared.clone());

        let worker = std::thread::spawn(move || engine.run());
        // Let the scripted batch flow through, then shut down.
        std::thread::sleep(Duration::from_millis(20));
        shared.set_stopped();
        worker.join().unwrap();

        let batch = shared.try_drain();
        assert_eq!(
            batch.error.as_deref(),
            Some("error submitting iso transfer: -1")
        );
        assert_eq!(batch.audio.len(), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 1 + NUM_TRANSFERS);
        assert_eq!(shared.pending_cancels(), 0);
    }

    #[test]
    fn test_shutdown_cancels_exactly_once_and_terminates() {
        let shared = Arc::new(SharedState::new());
        let backend = MockBackend::new(Vec::new());
        let cancels = backend.cancels_issued();
        let engine = TransferEngine::new(backend, shared.clone());

        let worker = std::thread::spawn(move || engine.run());
        shared.set_stopped();
        worker.join().unwrap();

        assert_eq!(cancels.load(Ordering::SeqCst), 1 + NUM_TRANSFERS);
        assert_eq!(shared.pending_cancels(), 0);
    }
}
