use nusb::list_devices;
use scanberry_lib::constants::{PID, VID};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    info!("Listing connected USB devices...\n");

    match list_devices() {
        Ok(devices) => {
            let mut count = 0;
            let mut scanners = 0;
            for device_info in devices {
                count += 1;
                let is_scanner = device_info.vendor_id() == VID && device_info.product_id() == PID;
                if is_scanner {
                    scanners += 1;
                }
                info!(
                    "Device #{}: VID: {:#06x}, PID: {:#06x}, Bus: {:03}, Address: {:03}{}",
                    count,
                    device_info.vendor_id(),
                    device_info.product_id(),
                    device_info.bus_number(),
                    device_info.device_address(),
                    if is_scanner { "  <-- scanner" } else { "" }
                );
                info!(
                    "  Manufacturer: {}",
                    device_info.manufacturer_string().unwrap_or("<Not available>")
                );
                info!("  Product: {}", device_info.product_string().unwrap_or("<Not available>"));
                info!("  Serial: {}", device_info.serial_number().unwrap_or("<Not available>"));
                info!("  Speed: {:?}", device_info.speed());
                info!("---");
            }
            if count == 0 {
                info!("No USB devices found.");
            } else if scanners == 0 {
                info!("No scanner ({:04x}:{:04x}) found. Is it powered on?", VID, PID);
            }
        }
        Err(e) => {
            eprintln!("Error listing USB devices: {:?}", e);
        }
    }
}
