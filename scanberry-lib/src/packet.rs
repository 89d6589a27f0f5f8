//! Response packets streamed back by the scanner.
//!
//! Byte 0 is the packet class. Class `0x00` carries a status detail in byte 1
//! which selects the payload shape; class `0x01` is a terminal report that we
//! have never seen carry anything useful. Only part of the code space is
//! understood, so anything unrecognised is rejected rather than guessed at.

use crate::constants::CHUNK_HEADER_SIZE;
use crate::error::ScanError;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketClass {
    Status = 0x00,
    Terminal = 0x01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StatusDetail {
    EmptyPage = 0x00,
    // Both carry an image-chunk header
    ImageData = 0x01,
    ImageDataAlt = 0x02,
    // Meaning not established; reports page geometry, followed by PageDone
    PageInfo = 0x11,
    Finished = 0x20,
    PageDone = 0x21,
    Oversize = 0x23,
    Aborted = 0x40,
    // Meaning not established
    Info = 0x41,
    DeviceError = 0x51,
}

/// Image-chunk header, little-endian on the wire (12 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ChunkHeaderRaw {
    pub page: U16,
    pub compression: u8,
    pub reserved: u8,
    pub chunk_size: U32,
    /// Final page height once known, zero while more chunks follow
    pub height: U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub page: u16,
    pub compression: u8,
    pub chunk_size: u32,
    pub height: u32,
}

impl From<ChunkHeaderRaw> for ChunkHeader {
    fn from(raw: ChunkHeaderRaw) -> Self {
        Self {
            page: raw.page.get(),
            compression: raw.compression,
            chunk_size: raw.chunk_size.get(),
            height: raw.height.get(),
        }
    }
}

impl ChunkHeader {
    /// The declared final height, if this chunk completes the page.
    pub fn final_height(&self) -> Option<u32> {
        (self.height > 0).then_some(self.height)
    }

    /// Encode as a complete `0x00 0x01` response packet.
    pub fn to_packet(&self) -> Bytes {
        let raw = ChunkHeaderRaw {
            page: U16::new(self.page),
            compression: self.compression,
            reserved: 0,
            chunk_size: U32::new(self.chunk_size),
            height: U32::new(self.height),
        };
        let mut packet = BytesMut::with_capacity(2 + CHUNK_HEADER_SIZE);
        packet.put_u8(PacketClass::Status.into());
        packet.put_u8(StatusDetail::ImageData.into());
        packet.put_slice(raw.as_bytes());
        packet.freeze()
    }
}

/// A decoded response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Image-chunk header; `chunk_size` payload bytes follow in a separate read
    Chunk(ChunkHeader),
    PageDone { page: u16 },
    Oversize { page: u16 },
    EmptyPage,
    PageInfo { page: u16, width: u32, height: u32 },
    /// End of the scan stream
    Finished,
    Info(Bytes),
    /// The scan was cancelled; partial data must be dropped
    Aborted,
    DeviceError(Bytes),
    Terminal(Bytes),
}

impl Response {
    pub fn parse(bytes: Bytes) -> Result<Self, ScanError> {
        let class_byte = *bytes
            .first()
            .ok_or_else(|| ScanError::Protocol("Empty response packet".to_string()))?;
        let class = PacketClass::try_from(class_byte).map_err(|_| ScanError::UnknownStatus {
            class: class_byte,
            detail: bytes.get(1).copied().unwrap_or(0),
        })?;

        if class == PacketClass::Terminal {
            return Ok(Response::Terminal(bytes));
        }

        let detail_byte = *bytes
            .get(1)
            .ok_or_else(|| ScanError::Protocol("Status packet without detail byte".to_string()))?;
        let detail = StatusDetail::try_from(detail_byte).map_err(|_| ScanError::UnknownStatus {
            class: class_byte,
            detail: detail_byte,
        })?;
        let payload = bytes.slice(2..);

        match detail {
            StatusDetail::ImageData | StatusDetail::ImageDataAlt => {
                expect_len(detail, &payload, CHUNK_HEADER_SIZE)?;
                let raw = ChunkHeaderRaw::read_from_bytes(payload.as_ref())
                    .map_err(|_| ScanError::Protocol("Failed to parse chunk header".to_string()))?;
                Ok(Response::Chunk(ChunkHeader::from(raw)))
            }
            StatusDetail::PageDone => {
                expect_len(detail, &payload, 2)?;
                Ok(Response::PageDone { page: read_u16(&payload) })
            }
            StatusDetail::Oversize => {
                expect_len(detail, &payload, 2)?;
                Ok(Response::Oversize { page: read_u16(&payload) })
            }
            StatusDetail::EmptyPage => {
                expect_len(detail, &payload, 0)?;
                Ok(Response::EmptyPage)
            }
            StatusDetail::PageInfo => {
                expect_len(detail, &payload, 10)?;
                Ok(Response::PageInfo {
                    page: read_u16(&payload),
                    width: u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
                    height: u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]),
                })
            }
            StatusDetail::Finished => Ok(Response::Finished),
            StatusDetail::Info => Ok(Response::Info(payload)),
            StatusDetail::Aborted => {
                expect_len(detail, &payload, 0)?;
                Ok(Response::Aborted)
            }
            StatusDetail::DeviceError => Ok(Response::DeviceError(payload)),
        }
    }
}

/// Encode a bare two-byte status packet.
pub fn status_packet(detail: StatusDetail) -> Bytes {
    Bytes::from(vec![PacketClass::Status.into(), detail.into()])
}

fn expect_len(detail: StatusDetail, payload: &Bytes, expected: usize) -> Result<(), ScanError> {
    if payload.len() != expected {
        return Err(ScanError::Protocol(format!(
            "{:?} packet payload must be {} bytes, got {} ({})",
            detail,
            expected,
            payload.len(),
            hex::encode(payload)
        )));
    }
    Ok(())
}

fn read_u16(payload: &[u8]) -> u16 {
    u16::from_le_bytes([payload[0], payload[1]])
}
