//! Session façade
//!
//! One [`Session`] owns the USB context, the listener registry, and (once
//! opened) the two threads that make the driver run: the USB worker pumping
//! libusb events and the dispatcher invoking listeners. A session opens at
//! most one device; dropping it tears everything down in order.

use crate::backend::LibusbBackend;
use crate::delivery::{Batch, SharedState};
use crate::engine::{TransferBackend, TransferEngine};
use crate::error::{Error, Result};
use crate::events::{AUDIO_EVENT, ERROR_EVENT, Event, Listener, METADATA_EVENT, Registry};
use crate::{AUDIO_ALT_SETTING, AUDIO_INTERFACE, HID_INTERFACE, PRODUCT_ID, VENDOR_ID};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Stable USB topology coordinates of one UMA-8 instance, used to pick one
/// device among several identical ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceLocation {
    pub bus: u8,
    pub port: u8,
}

/// One driver instance.
pub struct Session {
    context: Context,
    registry: Arc<Mutex<Registry>>,
    shared: Arc<SharedState>,
    handle: Option<Arc<DeviceHandle<Context>>>,
    worker: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    opened: bool,
}

impl Session {
    /// Create a session with a fresh USB context.
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(Error::Init)?;
        Ok(Self {
            context,
            registry: Arc::new(Mutex::new(Registry::new())),
            shared: Arc::new(SharedState::new()),
            handle: None,
            worker: None,
            dispatcher: None,
            opened: false,
        })
    }

    /// List the bus/port locations of every attached UMA-8.
    ///
    /// Devices whose descriptor cannot be read are skipped silently; only a
    /// device-list retrieval failure surfaces an error. The result is stable
    /// across calls while the bus topology does not change.
    pub fn enumerate(&self) -> Result<Vec<DeviceLocation>> {
        let devices = self.context.devices().map_err(Error::DeviceList)?;
        let mut found = Vec::new();
        for device in devices.iter() {
            if is_uma8(&device) {
                found.push(DeviceLocation {
                    bus: device.bus_number(),
                    port: device.port_number(),
                });
            }
        }
        debug!("enumerated {} matching devices", found.len());
        Ok(found)
    }

    /// Open the device at `location` and start streaming.
    ///
    /// Claims the audio and HID interfaces (detaching kernel drivers as
    /// needed), selects the alternate setting that activates the isochronous
    /// endpoint, and spawns the worker and dispatcher threads. A session can
    /// be opened at most once, and stays consumed after `close`; setup
    /// failures leave it closed and reusable.
    pub fn open(&mut self, location: DeviceLocation) -> Result<()> {
        if self.opened {
            return Err(Error::AlreadyOpened);
        }

        let device = self.find_device(location)?;
        // Early returns below drop the handle, which closes the device.
        let handle = device.open().map_err(Error::Open)?;

        for interface in [AUDIO_INTERFACE, HID_INTERFACE] {
            match handle.kernel_driver_active(interface) {
                Ok(true) => {
                    debug!(interface, "detaching kernel driver");
                    handle
                        .detach_kernel_driver(interface)
                        .map_err(|source| Error::DetachKernelDriver { interface, source })?;
                }
                Ok(false) => {}
                Err(err) => {
                    debug!(interface, %err, "could not check kernel driver state");
                }
            }
            handle
                .claim_interface(interface)
                .map_err(|source| Error::ClaimInterface { interface, source })?;
        }

        handle
            .set_alternate_setting(AUDIO_INTERFACE, AUDIO_ALT_SETTING)
            .map_err(|source| Error::AltSetting {
                interface: AUDIO_INTERFACE,
                alt: AUDIO_ALT_SETTING,
                source,
            })?;

        let handle = Arc::new(handle);
        let backend = LibusbBackend::new(self.context.clone(), handle.clone());
        let (worker, dispatcher) = spawn_pipeline(&self.shared, &self.registry, backend);

        self.handle = Some(handle);
        self.worker = Some(worker);
        self.dispatcher = Some(dispatcher);
        self.opened = true;
        info!(bus = location.bus, port = location.port, "session opened");
        Ok(())
    }

    /// Register `listener` under `name`. The driver fires `"audio"`,
    /// `"metadata"` and `"error"`; other names are accepted but never fire.
    pub fn on(&self, name: &str, listener: Listener) {
        self.registry.lock().unwrap().add(name, listener);
    }

    /// Remove the most recently added registration of `listener` under
    /// `name`. Returns whether anything was removed.
    pub fn remove_listener(&self, name: &str, listener: &Listener) -> bool {
        self.registry.lock().unwrap().remove(name, listener)
    }

    /// Remove every listener registered under `name`. Returns whether the
    /// name had any.
    pub fn remove_all_listeners(&self, name: &str) -> bool {
        self.registry.lock().unwrap().remove_all(name)
    }

    /// Stop streaming and join both threads. Idempotent; also runs on drop.
    ///
    /// The worker cancels all outstanding transfers and exits once every
    /// cancellation has completed (within one event-pump tick); the
    /// dispatcher exits on the stop flag. No listener is invoked after this
    /// returns.
    pub fn close(&mut self) {
        self.shared.set_stopped();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        if self.handle.take().is_some() {
            debug!("session closed");
        }
        // `opened` stays set: the stop flag in `SharedState` is permanent,
        // so a reopened pipeline would exit immediately. One open per
        // session.
    }

    fn find_device(&self, location: DeviceLocation) -> Result<Device<Context>> {
        let devices = self.context.devices().map_err(Error::DeviceList)?;
        devices
            .iter()
            .find(|device| {
                is_uma8(device)
                    && device.bus_number() == location.bus
                    && device.port_number() == location.port
            })
            .ok_or(Error::NoDevice {
                bus: location.bus,
                port: location.port,
            })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_uma8(device: &Device<Context>) -> bool {
    match device.device_descriptor() {
        Ok(desc) => desc.vendor_id() == VENDOR_ID && desc.product_id() == PRODUCT_ID,
        // Unreadable descriptors are skipped, not fatal.
        Err(_) => false,
    }
}

/// Spawn the USB worker and the dispatcher for one opened session.
pub(crate) fn spawn_pipeline<B: TransferBackend + 'static>(
    shared: &Arc<SharedState>,
    registry: &Arc<Mutex<Registry>>,
    backend: B,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let engine = TransferEngine::new(backend, shared.clone());
    let worker = std::thread::Builder::new()
        .name("uma8-usb".to_string())
        .spawn(move || engine.run())
        .expect("failed to spawn usb worker thread");

    let dispatcher = {
        let shared = shared.clone();
        let registry = registry.clone();
        std::thread::Builder::new()
            .name("uma8-dispatch".to_string())
            .spawn(move || {
                while let Some(batch) = shared.wait_drain() {
                    dispatch_batch(&registry, batch);
                }
            })
            .expect("failed to spawn dispatcher thread")
    };

    (worker, dispatcher)
}

/// Deliver one drained batch: audio first, then metadata, then the pending
/// error. Listener lists are snapshotted per event name and invoked outside
/// every lock, so listeners may call back into the session freely.
fn dispatch_batch(registry: &Mutex<Registry>, batch: Batch) {
    if !batch.audio.is_empty() {
        let listeners = registry.lock().unwrap().snapshot(AUDIO_EVENT);
        for frame in batch.audio {
            let event = Event::Audio(frame);
            for listener in &listeners {
                listener(&event);
            }
        }
    }
    if !batch.metadata.is_empty() {
        let listeners = registry.lock().unwrap().snapshot(METADATA_EVENT);
        for metadata in batch.metadata {
            let event = Event::Metadata(metadata);
            for listener in &listeners {
                listener(&event);
            }
        }
    }
    if let Some(message) = batch.error {
        warn!(%message, "delivering worker error");
        let listeners = registry.lock().unwrap().snapshot(ERROR_EVENT);
        let event = Event::Error(message);
        for listener in &listeners {
            listener(&event);
        }
    }
}
