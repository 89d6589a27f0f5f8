use crate::constants::{ENDPOINT_IN, ENDPOINT_OUT, PID, USB_CONFIGURATION, USER_INTERFACE, VID};
use crate::error::ScanError;
use bytes::Bytes;
use nusb::{Interface, transfer::RequestBuffer};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// A framing-agnostic byte pipe to the scanner.
///
/// Implementations never retry. A read that sees no data within `timeout`
/// fails with [`ScanError::Timeout`]; bus faults surface as any other error.
pub trait Transport: Send + Sync + 'static {
    fn write(
        &self,
        data: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<(), ScanError>> + Send;

    fn read(
        &self,
        max_size: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Bytes, ScanError>> + Send;
}

/// Opens a device handle once the scanner has powered up.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(&self) -> Result<Self::Transport, ScanError>;
}

/// Bulk transport over the scanner's user interface.
pub struct UsbTransport {
    interface: Interface,
}

impl UsbTransport {
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self, ScanError> {
        info!("Searching for scanner {:04x}:{:04x}...", vendor_id, product_id);
        let device_info = nusb::list_devices()?
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .ok_or(ScanError::DeviceNotFound)?;

        info!(
            "Found device on bus {} addr {}",
            device_info.bus_number(),
            device_info.device_address()
        );

        let device = device_info.open()?;
        device.set_configuration(USB_CONFIGURATION)?;
        let interface = device.detach_and_claim_interface(USER_INTERFACE)?;
        info!("Interface {} claimed successfully.", USER_INTERFACE);

        Ok(Self { interface })
    }
}

impl Transport for UsbTransport {
    async fn write(&self, data: &[u8], timeout: Duration) -> Result<(), ScanError> {
        debug!(bytes = hex::encode(data), "USB Write");
        let write_transfer = self.interface.bulk_out(ENDPOINT_OUT, data.to_vec());
        let completion = tokio::time::timeout(timeout, write_transfer).await?;
        completion.into_result()?;
        Ok(())
    }

    async fn read(&self, max_size: usize, timeout: Duration) -> Result<Bytes, ScanError> {
        // Dropping the transfer on timeout cancels it
        let read_transfer = self.interface.bulk_in(ENDPOINT_IN, RequestBuffer::new(max_size));
        let completion = tokio::time::timeout(timeout, read_transfer).await?;
        let data = completion.into_result()?;
        debug!(bytes = hex::encode(&data[..data.len().min(64)]), len = data.len(), "USB Read");
        Ok(Bytes::from(data))
    }
}

/// Opens [`UsbTransport`] by vendor/product id.
#[derive(Debug, Clone, Copy)]
pub struct UsbConnector {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for UsbConnector {
    fn default() -> Self {
        Self {
            vendor_id: VID,
            product_id: PID,
        }
    }
}

impl Connector for UsbConnector {
    type Transport = UsbTransport;

    fn connect(&self) -> Result<UsbTransport, ScanError> {
        UsbTransport::open(self.vendor_id, self.product_id)
    }
}
