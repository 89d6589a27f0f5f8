//! Common test utilities: scripted transport, recording rails, page fixtures

// Shared across several test files; not every helper is used in each one
#![allow(dead_code)]

pub use bytes::Bytes;
pub use scanberry_lib::config::ScannerConfig;
pub use scanberry_lib::control::{ScannerControl, ScannerEvent, ScannerState};
pub use scanberry_lib::driver::ProtocolDriver;
pub use scanberry_lib::error::ScanError;
pub use scanberry_lib::gpio::{Rail, Rails};
pub use scanberry_lib::packet::{ChunkHeader, StatusDetail, status_packet};
pub use scanberry_lib::transport::{Connector, Transport};
pub use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

/// What the next read returns.
#[derive(Debug, Clone)]
pub enum Reply {
    Data(Bytes),
    Timeout,
    Fail,
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Reply>,
    writes: Vec<Vec<u8>>,
    /// Replies queued whenever the named command is written
    responders: HashMap<String, Vec<Reply>>,
}

/// A transport replaying canned replies and recording every write.
///
/// Once the script runs dry, reads time out after their full timeout.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, data: impl Into<Bytes>) -> &Self {
        self.script.lock().unwrap().replies.push_back(Reply::Data(data.into()));
        self
    }

    pub fn push_hex(&self, hex_data: &str) -> &Self {
        self.push(hex::decode(hex_data).expect("Failed to decode hex"))
    }

    pub fn push_reply(&self, reply: Reply) -> &Self {
        self.script.lock().unwrap().replies.push_back(reply);
        self
    }

    pub fn extend(&self, packets: impl IntoIterator<Item = Bytes>) -> &Self {
        let mut script = self.script.lock().unwrap();
        script.replies.extend(packets.into_iter().map(Reply::Data));
        self
    }

    /// Queue `replies` each time `command` is written.
    pub fn respond_to(&self, command: &str, replies: Vec<Reply>) -> &Self {
        self.script.lock().unwrap().responders.insert(command.to_string(), replies);
        self
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.script.lock().unwrap().writes.clone()
    }

    /// Names of the commands written so far (`SSP`, `XSC`, ...).
    pub fn commands(&self) -> Vec<String> {
        self.writes().iter().map(|w| command_name(w)).collect()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().replies.len()
    }
}

pub fn command_name(command: &[u8]) -> String {
    let end = command.iter().position(|&b| b == b'\n').unwrap_or(command.len());
    String::from_utf8_lossy(&command[1..end]).into_owned()
}

impl Transport for ScriptedTransport {
    async fn write(&self, data: &[u8], _timeout: Duration) -> Result<(), ScanError> {
        let mut script = self.script.lock().unwrap();
        script.writes.push(data.to_vec());
        if let Some(replies) = script.responders.get(&command_name(data)).cloned() {
            script.replies.extend(replies);
        }
        Ok(())
    }

    async fn read(&self, max_size: usize, timeout: Duration) -> Result<Bytes, ScanError> {
        let reply = self.script.lock().unwrap().replies.pop_front();
        match reply {
            Some(Reply::Data(data)) => {
                assert!(data.len() <= max_size, "scripted reply larger than the read");
                Ok(data)
            }
            Some(Reply::Fail) => Err(ScanError::Protocol("Scripted transport fault".to_string())),
            Some(Reply::Timeout) | None => {
                tokio::time::sleep(timeout).await;
                Err(ScanError::Timeout)
            }
        }
    }
}

/// Hands out clones of one scripted transport, or refuses to connect.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    pub transport: ScriptedTransport,
    pub fail: bool,
}

impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    fn connect(&self) -> Result<ScriptedTransport, ScanError> {
        if self.fail {
            return Err(ScanError::DeviceNotFound);
        }
        Ok(self.transport.clone())
    }
}

/// Rails that remember every change and the current levels.
#[derive(Debug, Clone, Default)]
pub struct RecordingRails {
    log: Arc<Mutex<Vec<(Rail, bool)>>>,
    levels: Arc<Mutex<HashMap<Rail, bool>>>,
}

impl RecordingRails {
    pub fn level(&self, rail: Rail) -> bool {
        self.levels.lock().unwrap().get(&rail).copied().unwrap_or(false)
    }

    pub fn log(&self) -> Vec<(Rail, bool)> {
        self.log.lock().unwrap().clone()
    }

    pub fn all_low(&self) -> bool {
        Rail::ALL.iter().all(|&rail| !self.level(rail))
    }
}

impl Rails for RecordingRails {
    fn set(&mut self, rail: Rail, on: bool) {
        self.log.lock().unwrap().push((rail, on));
        self.levels.lock().unwrap().insert(rail, on);
    }
}

/// A small solid-colour JPEG.
pub fn jpeg_page(width: u32, height: u32) -> Vec<u8> {
    let page = RgbImage::from_pixel(width, height, Rgb([240, 240, 240]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(page)
        .write_to(&mut out, ImageFormat::Jpeg)
        .expect("Failed to encode JPEG");
    out.into_inner()
}

/// Chunk packets for one page; only the last header carries `height`.
pub fn page_stream(page: u16, encoded: &[u8], height: u32, chunk_size: usize) -> Vec<Bytes> {
    let chunks: Vec<&[u8]> = encoded.chunks(chunk_size).collect();
    let last = chunks.len() - 1;
    let mut packets = Vec::new();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let header = ChunkHeader {
            page,
            compression: 0,
            chunk_size: chunk.len() as u32,
            height: if i == last { height } else { 0 },
        };
        packets.push(header.to_packet());
        packets.push(Bytes::copy_from_slice(chunk));
    }
    packets
}

pub fn ssp_ack() -> Bytes {
    Bytes::from(vec![0u8; 0x26])
}

/// Default timing, small scan area.
pub fn test_config() -> ScannerConfig {
    let mut config = ScannerConfig::default();
    config.scan.area = [0, 0, 64, 48];
    config
}

/// Collect events until `pred` matches, or panic after `limit` of (paused) time.
pub async fn wait_for_event(
    events: &mut UnboundedReceiver<ScannerEvent>,
    limit: Duration,
    mut pred: impl FnMut(&ScannerEvent) -> bool,
) -> Vec<ScannerEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(limit, async {
        while let Some(event) = events.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    assert!(
        matches!(result, Ok(true)),
        "event not seen within {limit:?}; got {seen:?}"
    );
    seen
}

/// Drain whatever is queued right now.
pub fn drain(events: &mut UnboundedReceiver<ScannerEvent>) -> Vec<ScannerEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
