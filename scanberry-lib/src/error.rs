use crate::control::ScannerState;
use nusb::transfer::TransferError;
use thiserror::Error;

/// The primary error type for the `scanberry` library.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("USB device not found. Is the scanner powered and connected?")]
    DeviceNotFound,

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("USB transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// No data arrived within the requested window. Expected while polling.
    #[error("Timeout during USB operation")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected acknowledgement to {command}: expected {expected}, got {actual}")]
    UnexpectedAck {
        command: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Unknown status code: class {class:#04x}, detail {detail:#04x}")]
    UnknownStatus { class: u8, detail: u8 },

    #[error("Scanner reported an internal error")]
    DeviceReportedError,

    #[error("Image decoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Scanner is not ready to scan (state: {0:?})")]
    NotReady(ScannerState),

    #[error("A delayed callback is already pending")]
    DelayPending,

    #[error("GPIO error: {0}")]
    Gpio(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scan worker panicked: {0}")]
    WorkerPanicked(String),
}

impl ScanError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ScanError::Timeout)
    }

    /// Everything except a polling timeout ends the current scan.
    pub fn is_fatal(&self) -> bool {
        !self.is_timeout()
    }
}

impl From<tokio::time::error::Elapsed> for ScanError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ScanError::Timeout
    }
}

#[cfg(feature = "rpi")]
impl From<rppal::gpio::Error> for ScanError {
    fn from(err: rppal::gpio::Error) -> Self {
        ScanError::Gpio(err.to_string())
    }
}

impl From<toml::de::Error> for ScanError {
    fn from(err: toml::de::Error) -> Self {
        ScanError::Config(err.to_string())
    }
}
