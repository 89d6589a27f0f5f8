pub mod config;
pub mod constants;
pub mod control;
pub mod driver;
pub mod emulate;
pub mod error;
pub mod gpio;
pub mod packet;
pub mod params;
mod scan;
pub mod timer;
pub mod transport;


pub use config::ScannerConfig;
pub use control::{ScannerControl, ScannerEvent, ScannerState};
pub use driver::{AbortHandle, PageImage, ProtocolDriver, ScanSession};
pub use emulate::{EmulatedConnector, EmulatedTransport};
pub use error::ScanError;
#[cfg(feature = "rpi")]
pub use gpio::GpioRails;
pub use gpio::{LoggingRails, Rail, Rails};
pub use transport::{Connector, Transport, UsbConnector, UsbTransport};
