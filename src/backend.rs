//! libusb-backed transfer plumbing
//!
//! The safe `rusb` surface has no asynchronous transfer API, so the
//! isochronous pool and the interrupt transfer are driven through
//! `rusb::ffi` (libusb1-sys) directly. Completion callbacks run on the
//! worker thread inside `libusb_handle_events_timeout_completed`; they copy
//! packet payloads into [`Completion`] records, resubmit the descriptor, and
//! push the record onto a queue that [`LibusbBackend::poll`] drains for the
//! engine.
//!
//! Descriptor lifetime: a descriptor is freed in its callback when it is
//! cancelled or can no longer be resubmitted, and its slot is marked
//! not-in-flight so `cancel_all` knows to synthesize the cancelled
//! completion instead of cancelling a dead pointer. `cancel_all` also marks
//! every slot as stopping before the first cancel; a transfer that completed
//! in the kernel just before its cancel reports COMPLETED, not CANCELLED,
//! and the stopping flag is what makes its callback settle the descriptor
//! instead of resubmitting it. This keeps the shutdown counter sound even
//! when the device disappears mid-stream.

use crate::engine::{Completion, IsoPacket, TransferBackend};
use crate::{
    EP_IRQ_IN, EP_ISO_IN, IRQ_BUFFER_LEN, ISO_TIMEOUT_MS, NUM_PACKETS, NUM_TRANSFERS, PACKET_SIZE,
};
use rusb::ffi::{self, constants};
use rusb::{Context, DeviceHandle, UsbContext};
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const ISO_BUFFER_LEN: usize = PACKET_SIZE * NUM_PACKETS;
/// Slot index of the interrupt transfer, after the iso pool.
const IRQ_SLOT: usize = NUM_TRANSFERS;

/// Completion records produced by the C callbacks, drained by `poll`.
#[derive(Default)]
struct CompletionQueue {
    completions: Mutex<Vec<Completion>>,
}

impl CompletionQueue {
    fn push(&self, completion: Completion) {
        self.completions.lock().unwrap().push(completion);
    }

    fn drain(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.completions.lock().unwrap())
    }
}

/// Per-transfer state reachable from the completion callback via
/// `user_data`. Lives in a stable heap allocation owned by the backend,
/// which outlives every descriptor that points at it.
struct SlotState {
    queue: *const CompletionQueue,
    in_flight: AtomicBool,
    /// Set once shutdown cancels are being issued; completions observed from
    /// then on settle the descriptor instead of resubmitting it.
    stopping: AtomicBool,
}

pub(crate) struct LibusbBackend {
    context: Context,
    handle: Arc<DeviceHandle<Context>>,
    queue: Box<CompletionQueue>,
    slots: Vec<Box<SlotState>>,
    iso_buffers: Vec<Box<[u8; ISO_BUFFER_LEN]>>,
    irq_buffer: Box<[u8; IRQ_BUFFER_LEN]>,
    iso_transfers: Vec<*mut ffi::libusb_transfer>,
    irq_transfer: *mut ffi::libusb_transfer,
}

// The backend is constructed on the caller's thread and then moved to the
// worker thread, which is the only thread that ever touches the raw
// descriptors and slot pointers.
unsafe impl Send for LibusbBackend {}

impl LibusbBackend {
    pub fn new(context: Context, handle: Arc<DeviceHandle<Context>>) -> Self {
        let queue = Box::new(CompletionQueue::default());
        let queue_ptr: *const CompletionQueue = &*queue;

        let slots = (0..=NUM_TRANSFERS)
            .map(|_| {
                Box::new(SlotState {
                    queue: queue_ptr,
                    in_flight: AtomicBool::new(false),
                    stopping: AtomicBool::new(false),
                })
            })
            .collect();

        Self {
            context,
            handle,
            queue,
            slots,
            iso_buffers: (0..NUM_TRANSFERS)
                .map(|_| Box::new([0u8; ISO_BUFFER_LEN]))
                .collect(),
            irq_buffer: Box::new([0u8; IRQ_BUFFER_LEN]),
            iso_transfers: Vec::with_capacity(NUM_TRANSFERS),
            irq_transfer: ptr::null_mut(),
        }
    }

    /// Release descriptors allocated so far. Only valid before any
    /// submission, while nothing is in flight.
    fn free_allocated(&mut self) {
        for xfr in self.iso_transfers.drain(..) {
            unsafe { ffi::libusb_free_transfer(xfr) };
        }
        if !self.irq_transfer.is_null() {
            unsafe { ffi::libusb_free_transfer(self.irq_transfer) };
            self.irq_transfer = ptr::null_mut();
        }
    }

    unsafe fn fill_iso(&mut self, index: usize) {
        let xfr = self.iso_transfers[index];
        let slot: *const SlotState = &*self.slots[index];
        unsafe {
            (*xfr).dev_handle = self.handle.as_raw();
            (*xfr).flags = 0;
            (*xfr).endpoint = EP_ISO_IN;
            (*xfr).transfer_type = constants::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
            (*xfr).timeout = ISO_TIMEOUT_MS;
            (*xfr).buffer = self.iso_buffers[index].as_mut_ptr();
            (*xfr).length = ISO_BUFFER_LEN as c_int;
            (*xfr).num_iso_packets = NUM_PACKETS as c_int;
            (*xfr).callback = iso_transfer_callback;
            (*xfr).user_data = slot as *mut c_void;

            let descs = (&raw mut (*xfr).iso_packet_desc)
                .cast::<ffi::libusb_iso_packet_descriptor>();
            for i in 0..NUM_PACKETS {
                (*descs.add(i)).length = PACKET_SIZE as c_uint;
            }
        }
    }

    unsafe fn fill_irq(&mut self) {
        let xfr = self.irq_transfer;
        let slot: *const SlotState = &*self.slots[IRQ_SLOT];
        unsafe {
            (*xfr).dev_handle = self.handle.as_raw();
            (*xfr).flags = 0;
            (*xfr).endpoint = EP_IRQ_IN;
            (*xfr).transfer_type = constants::LIBUSB_TRANSFER_TYPE_INTERRUPT;
            // Infinite timeout; VAD/DoA reports are sparse.
            (*xfr).timeout = 0;
            (*xfr).buffer = self.irq_buffer.as_mut_ptr();
            (*xfr).length = IRQ_BUFFER_LEN as c_int;
            (*xfr).num_iso_packets = 0;
            (*xfr).callback = irq_transfer_callback;
            (*xfr).user_data = slot as *mut c_void;
        }
    }

    /// Submit one filled descriptor; on failure the descriptor is released
    /// immediately and the error is queued for asynchronous delivery.
    fn submit(&mut self, xfr: *mut ffi::libusb_transfer, slot: usize, what: &str) {
        let ret = unsafe { ffi::libusb_submit_transfer(xfr) };
        if ret < 0 {
            warn!(ret, what, "transfer submission failed");
            self.queue
                .push(Completion::Error(format!("error submitting {what}: {ret}")));
            unsafe { ffi::libusb_free_transfer(xfr) };
        } else {
            self.slots[slot].in_flight.store(true, Ordering::Release);
        }
    }

    /// Cancel one transfer, or synthesize its cancelled completion when the
    /// descriptor was already reaped.
    ///
    /// An in-flight slot always has a callback owed, so its descriptor is
    /// never freed here; even when the cancel fails because the transfer
    /// completed in the kernel first, the pending callback observes the
    /// stopping flag on the next poll and settles the descriptor itself.
    fn cancel_one(&self, slot: usize, xfr: *mut ffi::libusb_transfer, synthetic: Completion) {
        if self.slots[slot].in_flight.load(Ordering::Acquire) {
            let ret = unsafe { ffi::libusb_cancel_transfer(xfr) };
            if ret < 0 {
                debug!(ret, slot, "cancel raced a completed transfer");
            }
        } else {
            self.queue.push(synthetic);
        }
    }
}

impl TransferBackend for LibusbBackend {
    fn start(&mut self) -> Result<(), String> {
        // Allocate every descriptor before submitting any, so an allocation
        // failure aborts with nothing in flight to unwind.
        for _ in 0..NUM_TRANSFERS {
            let xfr = unsafe { ffi::libusb_alloc_transfer(NUM_PACKETS as c_int) };
            if xfr.is_null() {
                self.free_allocated();
                return Err("unable to allocate iso transfer".into());
            }
            self.iso_transfers.push(xfr);
        }
        let irq = unsafe { ffi::libusb_alloc_transfer(0) };
        if irq.is_null() {
            self.free_allocated();
            return Err("unable to allocate irq transfer".into());
        }
        self.irq_transfer = irq;

        for index in 0..NUM_TRANSFERS {
            unsafe { self.fill_iso(index) };
        }
        unsafe { self.fill_irq() };

        for index in 0..NUM_TRANSFERS {
            let xfr = self.iso_transfers[index];
            self.submit(xfr, index, "iso transfer");
        }
        let irq = self.irq_transfer;
        self.submit(irq, IRQ_SLOT, "irq transfer");

        debug!("submitted {} iso transfers and 1 irq transfer", NUM_TRANSFERS);
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Vec<Completion> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            ffi::libusb_handle_events_timeout_completed(
                self.context.as_raw(),
                &tv,
                ptr::null_mut(),
            )
        };
        if ret < 0 {
            warn!(ret, "usb event pump error");
        }
        self.queue.drain()
    }

    fn cancel_all(&mut self) {
        // Mark every slot before the first cancel; completions that raced
        // ahead in the kernel must settle, not resubmit.
        for slot in &self.slots {
            slot.stopping.store(true, Ordering::Release);
        }
        self.cancel_one(IRQ_SLOT, self.irq_transfer, Completion::IrqCancelled);
        for index in 0..NUM_TRANSFERS {
            self.cancel_one(index, self.iso_transfers[index], Completion::IsoCancelled);
        }
    }
}

/// Whether a completion must settle its descriptor (free it, account for the
/// cancel) instead of resubmitting. Once shutdown cancels have been issued
/// any status settles: a resubmitted transfer would never be cancelled and
/// the shutdown countdown could not finish.
fn settles(stopping: bool, status: c_int) -> bool {
    stopping || status == constants::LIBUSB_TRANSFER_CANCELLED
}

/// Isochronous completion. Copies every packet slot, resubmits, and leaves
/// frame assembly to the engine. Cancelled transfers release their
/// descriptor and never resubmit.
extern "system" fn iso_transfer_callback(xfr: *mut ffi::libusb_transfer) {
    unsafe {
        let slot = &*((*xfr).user_data as *const SlotState);
        let queue = &*slot.queue;

        let stopping = slot.stopping.load(Ordering::Acquire);
        if settles(stopping, (*xfr).status) {
            slot.in_flight.store(false, Ordering::Release);
            queue.push(Completion::IsoCancelled);
            ffi::libusb_free_transfer(xfr);
            return;
        }

        let count = (*xfr).num_iso_packets as usize;
        let descs =
            (&raw const (*xfr).iso_packet_desc).cast::<ffi::libusb_iso_packet_descriptor>();
        let base = (*xfr).buffer;

        let mut packets = Vec::with_capacity(count);
        for i in 0..count {
            let completed = (*descs.add(i)).status == constants::LIBUSB_TRANSFER_COMPLETED;
            let mut data = [0u8; PACKET_SIZE];
            if completed {
                // Equal packet lengths, so slot i starts at i * PACKET_SIZE.
                ptr::copy_nonoverlapping(base.add(i * PACKET_SIZE), data.as_mut_ptr(), PACKET_SIZE);
            }
            packets.push(IsoPacket { completed, data });
        }
        queue.push(Completion::Iso { packets });

        let ret = ffi::libusb_submit_transfer(xfr);
        if ret < 0 {
            slot.in_flight.store(false, Ordering::Release);
            queue.push(Completion::Error(format!(
                "error resubmitting iso transfer: {ret}"
            )));
            ffi::libusb_free_transfer(xfr);
        }
    }
}

/// Interrupt completion. Hands the raw packet to the engine and resubmits.
/// A transfer that fails outright is released here; the slot bookkeeping
/// lets shutdown account for it.
extern "system" fn irq_transfer_callback(xfr: *mut ffi::libusb_transfer) {
    unsafe {
        let slot = &*((*xfr).user_data as *const SlotState);
        let queue = &*slot.queue;

        let status = (*xfr).status;
        let stopping = slot.stopping.load(Ordering::Acquire);
        if stopping || status != constants::LIBUSB_TRANSFER_COMPLETED {
            slot.in_flight.store(false, Ordering::Release);
            if settles(stopping, status) {
                queue.push(Completion::IrqCancelled);
            } else {
                warn!(status, "irq transfer failed; not resubmitting");
            }
            ffi::libusb_free_transfer(xfr);
            return;
        }

        let len = (*xfr).actual_length as usize;
        let data = std::slice::from_raw_parts((*xfr).buffer, len).to_vec();
        queue.push(Completion::Irq { data });

        let ret = ffi::libusb_submit_transfer(xfr);
        if ret < 0 {
            slot.in_flight.store(false, Ordering::Release);
            queue.push(Completion::Error(format!(
                "error resubmitting irq transfer: {ret}"
            )));
            ffi::libusb_free_transfer(xfr);
        }
    }
}
