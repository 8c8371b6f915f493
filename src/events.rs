//! Event payloads and the listener registry
//!
//! Listeners are registered under free-form event names. The driver itself
//! only ever fires `"audio"`, `"metadata"` and `"error"`; other names are
//! accepted and simply never invoked. Within one name, listeners fire in
//! registration order.

use std::collections::HashMap;
use std::sync::Arc;

/// Event name for delivered audio frames.
pub const AUDIO_EVENT: &str = "audio";
/// Event name for delivered VAD/DoA records.
pub const METADATA_EVENT: &str = "metadata";
/// Event name for asynchronous worker errors.
pub const ERROR_EVENT: &str = "error";

/// A VAD/DoA report parsed from one HID interrupt packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Whether the device currently hears speech.
    pub vad: bool,
    /// Direction-of-arrival estimate, degrees scaled into 0..=65535.
    pub angle: u16,
    /// Coarse direction sector reported by the array.
    pub direction: u8,
}

/// Payload handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A raw audio frame: `PACKET_SIZE * k` bytes of pass-through PCM.
    Audio(Vec<u8>),
    /// A parsed VAD/DoA record.
    Metadata(Metadata),
    /// An asynchronous error reported by the USB worker.
    Error(String),
}

/// Callback handle. Equality between listeners is pointer identity
/// (`Arc::ptr_eq`), so registering the same `Arc` twice creates two
/// removable entries.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

/// Ordered listener lists keyed by event name.
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<String, Vec<Listener>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener to the list for `name`, preserving insertion order.
    pub fn add(&mut self, name: &str, listener: Listener) {
        self.entries.entry(name.to_owned()).or_default().push(listener);
    }

    /// Remove the most recently added entry matching `listener`.
    ///
    /// Returns whether anything was removed. The name entry is dropped
    /// entirely once its list becomes empty.
    pub fn remove(&mut self, name: &str, listener: &Listener) -> bool {
        let Some(list) = self.entries.get_mut(name) else {
            return false;
        };
        let Some(pos) = list.iter().rposition(|l| Arc::ptr_eq(l, listener)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            self.entries.remove(name);
        }
        true
    }

    /// Drop the whole entry for `name`. Returns whether it existed.
    pub fn remove_all(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Clone the current listener list for `name`.
    ///
    /// Delivery snapshots the list before invoking, so a listener that
    /// unregisters itself still completes the current pass.
    pub fn snapshot(&self, name: &str) -> Vec<Listener> {
        self.entries.get(name).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
