//! Driver error types
//!
//! Setup failures (`Session::new`, `Session::open`) surface synchronously as
//! these variants. Runtime failures on the USB worker are reported
//! asynchronously as string errors through the delivery queue instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// libusb context initialization failed; the session is unusable.
    #[error("USB context initialization failed: {0}")]
    Init(#[source] rusb::Error),

    /// The USB device list could not be retrieved.
    #[error("Error getting devices: {0}")]
    DeviceList(#[source] rusb::Error),

    /// No UMA-8 was found at the requested bus/port.
    #[error("No device at bus {bus} port {port}")]
    NoDevice { bus: u8, port: u8 },

    /// The matching device was found but could not be opened.
    #[error("Can't open device: {0}")]
    Open(#[source] rusb::Error),

    /// A kernel driver was attached to an interface and refused to detach.
    #[error("Can't detach kernel driver from interface {interface}: {source}")]
    DetachKernelDriver {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    /// An interface could not be claimed.
    #[error("Can't claim interface {interface}: {source}")]
    ClaimInterface {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    /// The audio alternate setting could not be selected.
    #[error("Can't set alt setting {alt} on interface {interface}: {source}")]
    AltSetting {
        interface: u8,
        alt: u8,
        #[source]
        source: rusb::Error,
    },

    /// `open` was called on a session that already opened a device.
    #[error("Session is already opened")]
    AlreadyOpened,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NoDevice { bus: 3, port: 2 };
        assert_eq!(format!("{}", err), "No device at bus 3 port 2");

        let err = Error::ClaimInterface {
            interface: 4,
            source: rusb::Error::Busy,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("interface 4"));
    }
}
