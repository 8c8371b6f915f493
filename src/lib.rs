//! Host-side driver for the UMA-8 USB far-field microphone array
//! (vendor 0x2752, product 0x001C).
//!
//! The driver opens one device instance selected by its bus/port topology
//! coordinates, streams raw captured audio to the application, and reports the
//! device's voice-activity-detection (VAD) and direction-of-arrival (DoA)
//! telemetry. Audio arrives on an isochronous IN endpoint and telemetry on an
//! interrupt IN endpoint; both are serviced by a dedicated USB worker thread
//! driving the libusb event pump, with delivery to application callbacks
//! decoupled through a dispatcher thread so that slow listeners never stall
//! USB scheduling.
//!
//! ```no_run
//! use uma8::Session;
//! use std::sync::Arc;
//!
//! let mut session = Session::new()?;
//! session.on(uma8::AUDIO_EVENT, Arc::new(|event| {
//!     if let uma8::Event::Audio(frame) = event {
//!         println!("frame: {} bytes", frame.len());
//!     }
//! }));
//! let devices = session.enumerate()?;
//! session.open(devices[0])?;
//! # Ok::<(), uma8::Error>(())
//! ```
//!
//! Frames are passed through verbatim: the device emits signed 32-bit
//! little-endian 2-channel PCM at 24 kHz (its descriptors claim 24-bit/16 kHz;
//! the observed wire format wins). The driver does not parse or resample.

mod backend;
mod delivery;
mod engine;
mod error;
mod events;
mod session;

pub use error::{Error, Result};
pub use events::{AUDIO_EVENT, ERROR_EVENT, Event, Listener, METADATA_EVENT, Metadata};
pub use session::{DeviceLocation, Session};

/// USB vendor ID of the UMA-8.
pub const VENDOR_ID: u16 = 0x2752;
/// USB product ID of the UMA-8.
pub const PRODUCT_ID: u16 = 0x001C;

/// Audio streaming interface number.
pub(crate) const AUDIO_INTERFACE: u8 = 2;
/// Alternate setting on the audio interface that activates the iso endpoint.
pub(crate) const AUDIO_ALT_SETTING: u8 = 1;
/// HID interface number carrying the VAD/DoA reports.
pub(crate) const HID_INTERFACE: u8 = 4;

/// Isochronous IN endpoint delivering audio.
pub(crate) const EP_ISO_IN: u8 = 0x81;
/// Interrupt IN endpoint delivering VAD/DoA reports.
pub(crate) const EP_IRQ_IN: u8 = 0x82;

/// Bytes per isochronous packet.
pub(crate) const PACKET_SIZE: usize = 24;
/// Isochronous packets per transfer. Tuning parameter; valid range 10-100.
pub(crate) const NUM_PACKETS: usize = 10;
/// Concurrently outstanding isochronous transfers. The pool absorbs USB
/// scheduling jitter so microframes are never left unserviced.
pub(crate) const NUM_TRANSFERS: usize = 10;
/// Interrupt transfer buffer length.
pub(crate) const IRQ_BUFFER_LEN: usize = 64;

/// Timeout applied to each isochronous transfer, in milliseconds.
pub(crate) const ISO_TIMEOUT_MS: u32 = 1000;
/// Event-pump tick; the worker re-checks the stop flag at this cadence.
pub(crate) const EVENT_TICK: std::time::Duration = std::time::Duration::from_secs(1);
