//! An in-process stand-in for the scanner.
//!
//! Speaks just enough of the protocol for the state machine to run end to end
//! without USB or GPIO: parameter and source commands are acknowledged, and a
//! scan streams a synthetic JPEG page after a short feed delay.

use crate::constants::{ABT_ACK, ESC, SOURCE_ACK, SSP_ACK_LEN};
use crate::error::ScanError;
use crate::packet::{ChunkHeader, StatusDetail, status_packet};
use crate::transport::{Connector, Transport};
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Page size used when the scan command carries no usable `AREA`.
const DEFAULT_PAGE: (u32, u32) = (1275, 1650);

#[derive(Debug, Clone, Copy)]
pub struct EmulatedConnector {
    /// Time between the scan command and the first streamed packet
    pub feed_time: Duration,
    /// Image bytes per chunk
    pub chunk_size: usize,
}

impl Default for EmulatedConnector {
    fn default() -> Self {
        Self {
            feed_time: Duration::from_secs(2),
            chunk_size: 64 * 1024,
        }
    }
}

impl Connector for EmulatedConnector {
    type Transport = EmulatedTransport;

    fn connect(&self) -> Result<EmulatedTransport, ScanError> {
        info!("Connecting to emulated scanner");
        Ok(EmulatedTransport::new(self.feed_time, self.chunk_size))
    }
}

#[derive(Debug, Default)]
struct Device {
    outbox: VecDeque<Bytes>,
    /// Nothing is readable before this instant
    busy_until: Option<Instant>,
    streaming: bool,
}

#[derive(Debug)]
pub struct EmulatedTransport {
    feed_time: Duration,
    chunk_size: usize,
    device: Mutex<Device>,
}

impl EmulatedTransport {
    pub fn new(feed_time: Duration, chunk_size: usize) -> Self {
        Self {
            feed_time,
            chunk_size: chunk_size.max(1),
            device: Mutex::default(),
        }
    }

    fn device(&self) -> MutexGuard<'_, Device> {
        self.device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle_command(&self, command: &str, payload: &[u8]) -> Result<(), ScanError> {
        let mut device = self.device();
        match command {
            "SSP" => {
                device.outbox.push_back(Bytes::from(vec![0u8; SSP_ACK_LEN]));
            }
            "S" | "D" => device.outbox.push_back(Bytes::from_static(&SOURCE_ACK)),
            "ABT" => {
                if device.streaming {
                    debug!("Emulated scan aborted");
                    device.outbox.clear();
                    device.outbox.push_back(status_packet(StatusDetail::Aborted));
                    device.streaming = false;
                } else {
                    device.outbox.push_back(Bytes::from_static(&ABT_ACK));
                }
            }
            "XSC" => {
                let (width, height) = requested_size(payload);
                let jpeg = render_page(width, height)?;
                info!(width, height, bytes = jpeg.len(), "Emulated page ready");
                device.outbox.extend(stream_page(&jpeg, height, self.chunk_size));
                device.busy_until = Some(Instant::now() + self.feed_time);
                device.streaming = true;
            }
            other => {
                return Err(ScanError::Protocol(format!(
                    "Emulated scanner does not understand {other:?}"
                )));
            }
        }
        Ok(())
    }
}

impl Transport for EmulatedTransport {
    async fn write(&self, data: &[u8], _timeout: Duration) -> Result<(), ScanError> {
        let Some((&ESC, rest)) = data.split_first() else {
            return Err(ScanError::Protocol("Command does not start with ESC".to_string()));
        };
        let (name, payload) = match rest.iter().position(|&b| b == b'\n') {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, &[][..]),
        };
        let name = String::from_utf8_lossy(name);
        debug!(command = %name, "Emulated write");
        self.handle_command(&name, payload)
    }

    async fn read(&self, max_size: usize, timeout: Duration) -> Result<Bytes, ScanError> {
        let wait = {
            let mut device = self.device();
            let now = Instant::now();
            match device.busy_until {
                Some(until) if until > now => Some((until - now).min(timeout)),
                _ => {
                    device.busy_until = None;
                    match device.outbox.pop_front() {
                        Some(mut packet) => {
                            if packet.len() > max_size {
                                let rest = packet.split_off(max_size);
                                device.outbox.push_front(rest);
                            }
                            if device.outbox.is_empty() {
                                device.streaming = false;
                            }
                            return Ok(packet);
                        }
                        None => None,
                    }
                }
            }
        };
        match wait {
            Some(wait) => sleep(wait).await,
            None => sleep(timeout).await,
        }
        Err(ScanError::Timeout)
    }
}

/// Page size from the `AREA=l,t,r,b` line of a scan command.
fn requested_size(payload: &[u8]) -> (u32, u32) {
    let text = String::from_utf8_lossy(payload);
    let area = text
        .lines()
        .find_map(|line| line.strip_prefix("AREA="))
        .map(|value| value.split(',').map(str::parse::<u32>).collect::<Result<Vec<_>, _>>());
    match area {
        Some(Ok(v)) if v.len() == 4 && v[2] > v[0] && v[3] > v[1] => (v[2] - v[0], v[3] - v[1]),
        _ => {
            warn!("No usable AREA in scan command, using the default page size");
            DEFAULT_PAGE
        }
    }
}

fn render_page(width: u32, height: u32) -> Result<Vec<u8>, ScanError> {
    let page = RgbImage::from_fn(width, height, |x, y| {
        // Faint ruled lines on off-white paper
        if y % 40 == 0 {
            Rgb([200, 210, 230])
        } else {
            Rgb([250, 248, (240 + x % 8) as u8])
        }
    });
    let mut jpeg = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(page).write_to(&mut jpeg, ImageFormat::Jpeg)?;
    Ok(jpeg.into_inner())
}

/// Split an encoded page into chunk packets; the last header carries the height.
fn stream_page(jpeg: &[u8], height: u32, chunk_size: usize) -> Vec<Bytes> {
    let chunks: Vec<&[u8]> = jpeg.chunks(chunk_size).collect();
    let last = chunks.len().saturating_sub(1);
    let mut packets = Vec::with_capacity(chunks.len() * 2 + 2);
    for (i, chunk) in chunks.into_iter().enumerate() {
        let header = ChunkHeader {
            page: 1,
            compression: 0,
            chunk_size: chunk.len() as u32,
            height: if i == last { height } else { 0 },
        };
        packets.push(header.to_packet());
        packets.push(Bytes::copy_from_slice(chunk));
    }
    packets.push(Bytes::from_static(&[0x00, 0x21, 0x01, 0x00]));
    packets.push(status_packet(StatusDetail::Finished));
    packets
}
