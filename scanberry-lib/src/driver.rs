//! Command/response driver for the scanner's `ESC` protocol.
//!
//! All commands are `ESC <name> LF <payload> LF 0x80`. Parameter and abort
//! commands are answered with a fixed-shape acknowledgement; a scan is
//! answered with a stream of status packets interleaved with raw image chunks,
//! which [`ScanSession`] turns into pages one at a time.

use crate::constants::{
    ABT_ACK, PACKET_SIZE, POLL_TIMEOUT, READ_TIMEOUT, SOURCE_ACK, SSP_ACK_LEN, SSP_ACK_TIMEOUT,
    WRITE_TIMEOUT,
};
use crate::error::ScanError;
use crate::packet::{ChunkHeader, Response};
use crate::params::{Eject, Source, SspRequest, XscRequest, abort_command, frame};
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use image::DynamicImage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// One decoded page.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub page: u16,
    pub image: DynamicImage,
    /// The encoded bytes exactly as streamed by the device
    pub raw: Bytes,
}

impl PageImage {
    fn decode(page: u16, raw: Bytes, height: Option<u32>) -> Result<Self, ScanError> {
        let image = image::load_from_memory(&raw)?;
        let image = match height {
            Some(height) if height <= image.height() => {
                image.crop_imm(0, 0, image.width(), height)
            }
            Some(height) => {
                warn!(
                    page,
                    declared = height,
                    decoded = image.height(),
                    "Page shorter than declared, padding"
                );
                // Rows past the raster stay black
                let mut padded = DynamicImage::new(image.width(), height, image.color());
                image::imageops::replace(&mut padded, &image, 0, 0);
                padded
            }
            None => image,
        };
        Ok(Self { page, image, raw })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Best-effort cancellation of a running scan.
///
/// Only polled when a packet read times out, so a request takes effect
/// within one poll interval at the earliest.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

pub struct ProtocolDriver<T> {
    transport: T,
    aborting: AbortHandle,
}

impl<T: Transport> ProtocolDriver<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            aborting: AbortHandle::default(),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.aborting.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn send(&self, command: &[u8]) -> Result<(), ScanError> {
        self.transport.write(command, WRITE_TIMEOUT).await
    }

    async fn expect_ack(&self, command: &'static str, expected: &[u8]) -> Result<(), ScanError> {
        let ack = self.transport.read(expected.len(), READ_TIMEOUT).await?;
        if ack.as_ref() != expected {
            return Err(ScanError::UnexpectedAck {
                command,
                expected: hex::encode(expected),
                actual: hex::encode(&ack),
            });
        }
        Ok(())
    }

    /// `ESC SSP`: push the scan parameters.
    pub async fn set_parameters(&self, request: &SspRequest) -> Result<(), ScanError> {
        self.send(&request.to_command()).await?;
        let ack = self.transport.read(PACKET_SIZE, SSP_ACK_TIMEOUT).await?;
        if ack.len() != SSP_ACK_LEN || ack[0] != 0x00 {
            return Err(ScanError::UnexpectedAck {
                command: "SSP",
                expected: format!("{SSP_ACK_LEN} bytes starting with 00"),
                actual: hex::encode(&ack),
            });
        }
        debug!("Scan parameters accepted");
        Ok(())
    }

    /// `ESC S`: select the document source.
    pub async fn set_source(&self, source: Source) -> Result<(), ScanError> {
        self.send(&frame("S", source.to_string().as_bytes())).await?;
        self.expect_ack("S", &SOURCE_ACK).await
    }

    /// `ESC D`: select the document source (alternate form).
    pub async fn set_source_d(&self, source: Source) -> Result<(), ScanError> {
        self.send(&frame("D", source.to_string().as_bytes())).await?;
        self.expect_ack("D", &SOURCE_ACK).await
    }

    /// `ESC ABT`: cancel, ejecting the current sheet or leaving it in place.
    pub async fn abort(&self, eject: bool) -> Result<(), ScanError> {
        self.abort_with(if eject { Eject::One } else { Eject::No }).await
    }

    pub async fn abort_with(&self, eject: Eject) -> Result<(), ScanError> {
        self.send(&abort_command(eject)).await?;
        self.expect_ack("ABT", &ABT_ACK).await
    }

    /// `ESC XSC`: start a scan and hand back the page stream.
    pub async fn scan(&mut self, request: &XscRequest) -> Result<ScanSession<'_, T>, ScanError> {
        self.send(&request.to_command()).await?;
        self.aborting.clear();
        Ok(ScanSession {
            driver: self,
            chunks: BytesMut::new(),
            page: 0,
            done: false,
            aborted: false,
        })
    }
}

/// Lazily decodes the pages of one scan.
pub struct ScanSession<'a, T> {
    driver: &'a ProtocolDriver<T>,
    chunks: BytesMut,
    page: u16,
    done: bool,
    aborted: bool,
}

impl<T: Transport> ScanSession<'_, T> {
    /// Poll the device until the next page is complete.
    ///
    /// Returns `Ok(None)` once the stream has ended. Any error also ends the
    /// stream.
    pub async fn next_page(&mut self) -> Result<Option<PageImage>, ScanError> {
        if self.done {
            return Ok(None);
        }
        let result = self.poll_page().await;
        if result.is_err() {
            self.done = true;
        }
        result
    }

    /// True once the device reported the scan as aborted.
    pub fn was_aborted(&self) -> bool {
        self.aborted
    }

    /// Drain the stream, keeping only the last page.
    ///
    /// An aborted scan yields nothing, even if a page completed before the abort.
    pub async fn last_page(mut self) -> Result<Option<PageImage>, ScanError> {
        let mut last = None;
        while let Some(page) = self.next_page().await? {
            last = Some(page);
        }
        if self.aborted {
            if let Some(page) = last {
                info!(page = page.page, "Dropping page of aborted scan");
            }
            return Ok(None);
        }
        Ok(last)
    }

    async fn poll_page(&mut self) -> Result<Option<PageImage>, ScanError> {
        let driver = self.driver;
        loop {
            let packet = match driver.transport.read(PACKET_SIZE, POLL_TIMEOUT).await {
                Ok(packet) => packet,
                Err(ScanError::Timeout) => {
                    if driver.aborting.take() {
                        // Only signals the device; the stream keeps running until it answers
                        info!("Aborting softly");
                        driver.send(&abort_command(Eject::No)).await?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            match Response::parse(packet)? {
                Response::Chunk(header) => {
                    if let Some(page) = self.receive_chunk(header).await? {
                        return Ok(Some(page));
                    }
                }
                Response::PageDone { page } => info!(page, "Page done"),
                Response::Oversize { page } => warn!(page, "Oversize page reported"),
                Response::EmptyPage => info!("Empty page"),
                Response::PageInfo { page, width, height } => {
                    warn!(page, width, height, "Unrecognised status 0x11 (page info?)");
                }
                Response::Info(payload) => {
                    warn!(payload = hex::encode(&payload), "Unrecognised status 0x41");
                }
                Response::Finished => {
                    self.done = true;
                    if self.chunks.is_empty() {
                        return Ok(None);
                    }
                    let raw = self.chunks.split().freeze();
                    return PageImage::decode(self.page, raw, None).map(Some);
                }
                Response::Aborted => {
                    info!(discarded = self.chunks.len(), "Scan aborted by device");
                    self.done = true;
                    self.aborted = true;
                    self.chunks.clear();
                    return Ok(None);
                }
                Response::DeviceError(payload) => {
                    warn!(payload = hex::encode(&payload), "Device reported an error");
                    return Err(ScanError::DeviceReportedError);
                }
                Response::Terminal(packet) => {
                    return Err(ScanError::Protocol(format!(
                        "Unexpected terminal packet: {}",
                        hex::encode(&packet)
                    )));
                }
            }
        }
    }

    async fn receive_chunk(&mut self, header: ChunkHeader) -> Result<Option<PageImage>, ScanError> {
        debug!(
            page = header.page,
            compression = header.compression,
            chunk_size = header.chunk_size,
            height = header.height,
            "Chunk header"
        );
        let mut remaining = header.chunk_size as usize;
        while remaining > 0 {
            let data = self.driver.transport.read(remaining, READ_TIMEOUT).await?;
            if data.is_empty() || data.len() > remaining {
                return Err(ScanError::Protocol(format!(
                    "Chunk payload read returned {} bytes, {} outstanding",
                    data.len(),
                    remaining
                )));
            }
            remaining -= data.len();
            self.chunks.extend_from_slice(&data);
        }
        self.page = header.page;

        match header.final_height() {
            Some(height) => {
                let raw = self.chunks.split().freeze();
                PageImage::decode(header.page, raw, Some(height)).map(Some)
            }
            None => Ok(None),
        }
    }
}
