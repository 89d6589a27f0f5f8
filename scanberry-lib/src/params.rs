//! Scan parameter sets and their `KEY=VALUE` wire form.
//!
//! The scanner is configured with newline-separated `KEY=VALUE` pairs sent
//! inside an `ESC <command>` frame. Keys appear in declaration order, absent
//! optional fields are left out entirely, and tuple values are joined with
//! commas and no whitespace:
//!
//! ```text
//! ESC "SSP" LF "RESO=150,150" LF "OS=RPI" LF ... LF LF 0x80
//! ```

use crate::constants::{COMMAND_TERMINATOR, ESC};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use strum_macros::Display;

/// A value that can appear on the right-hand side of `KEY=VALUE`.
///
/// `None` means the whole field is omitted from the payload.
pub trait WireValue {
    fn wire(&self) -> Option<String>;
}

macro_rules! wire_display {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireValue for $ty {
                fn wire(&self) -> Option<String> {
                    Some(self.to_string())
                }
            }
        )*
    };
}

wire_display!(
    u8,
    u16,
    u32,
    i32,
    &str,
    String,
    OnOff,
    Resolution,
    FeedSource,
    PageMode,
    ColorMode,
    AreaMode,
    Threshold,
    Compression,
    JpegSampling,
    DoubleFeedAction,
    BlankPageRemoval,
    Gamma,
    ScanMode,
);

impl<T: WireValue> WireValue for Option<T> {
    fn wire(&self) -> Option<String> {
        self.as_ref().and_then(WireValue::wire)
    }
}

impl<A: WireValue, B: WireValue> WireValue for (A, B) {
    fn wire(&self) -> Option<String> {
        Some(format!("{},{}", self.0.wire()?, self.1.wire()?))
    }
}

impl<A: WireValue, B: WireValue, C: WireValue, D: WireValue> WireValue for (A, B, C, D) {
    fn wire(&self) -> Option<String> {
        Some(format!(
            "{},{},{},{}",
            self.0.wire()?,
            self.1.wire()?,
            self.2.wire()?,
            self.3.wire()?
        ))
    }
}

/// Accumulates `KEY=VALUE\n` lines in call order.
#[derive(Debug, Default)]
struct ParamWriter {
    buf: BytesMut,
}

impl ParamWriter {
    fn field(mut self, key: &str, value: &impl WireValue) -> Self {
        if let Some(value) = value.wire() {
            self.buf.put_slice(key.as_bytes());
            self.buf.put_u8(b'=');
            self.buf.put_slice(value.as_bytes());
            self.buf.put_u8(b'\n');
        }
        self
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Wrap a payload into a complete command: `ESC <name> LF <payload> LF 0x80`.
pub fn frame(name: &str, payload: &[u8]) -> Vec<u8> {
    let mut command = BytesMut::with_capacity(name.len() + payload.len() + 4);
    command.put_u8(ESC);
    command.put_slice(name.as_bytes());
    command.put_u8(b'\n');
    command.put_slice(payload);
    command.put_u8(b'\n');
    command.put_u8(COMMAND_TERMINATOR);
    command.to_vec()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OnOff {
    #[strum(to_string = "ON")]
    On,
    #[strum(to_string = "OFF")]
    Off,
}

impl From<bool> for OnOff {
    fn from(on: bool) -> Self {
        if on { OnOff::On } else { OnOff::Off }
    }
}

/// Per-axis resolution in dots per inch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Auto,
    Dpi(u16),
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Auto => write!(f, "AUTO"),
            Resolution::Dpi(dpi) => write!(f, "{dpi}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FeedSource {
    #[strum(to_string = "ADF")]
    Adf,
    #[strum(to_string = "FB")]
    Flatbed,
    #[strum(to_string = "AUTO")]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PageMode {
    #[strum(to_string = "0")]
    Paged,
    #[strum(to_string = "1")]
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ColorMode {
    #[strum(to_string = "TEXT")]
    Text,
    #[strum(to_string = "ERRDIF")]
    ErrorDiffusion,
    #[strum(to_string = "C24BIT")]
    Color24,
    #[strum(to_string = "GRAY256")]
    Gray256,
    #[strum(to_string = "AUTO")]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaMode {
    Normal,
    Over,
    Auto,
    Custom(u32),
}

impl fmt::Display for AreaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AreaMode::Normal => write!(f, "NORMAL"),
            AreaMode::Over => write!(f, "OVER"),
            AreaMode::Auto => write!(f, "AUTO"),
            AreaMode::Custom(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    Auto,
    Level(u8),
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Auto => write!(f, "AUTO"),
            Threshold::Level(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Compression {
    #[strum(to_string = "TEXT")]
    Text,
    #[strum(to_string = "NONE")]
    None,
    #[strum(to_string = "ERRDIF")]
    ErrorDiffusion,
    #[strum(to_string = "JPEG")]
    Jpeg,
    #[strum(to_string = "RLENGTH")]
    RunLength,
    /// Sent as an empty value (`COMP=`)
    #[strum(to_string = "")]
    Unset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum JpegSampling {
    #[strum(to_string = "444")]
    S444,
    #[strum(to_string = "400")]
    S400,
    #[strum(to_string = "420")]
    S420,
    #[strum(to_string = "422")]
    S422,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DoubleFeedAction {
    #[strum(to_string = "STOP")]
    Stop,
    #[strum(to_string = "CONT")]
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankPageRemoval {
    On,
    Off,
    Level(u8),
}

impl fmt::Display for BlankPageRemoval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlankPageRemoval::On => write!(f, "ON"),
            BlankPageRemoval::Off => write!(f, "OFF"),
            BlankPageRemoval::Level(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gamma {
    Off,
    Value(u8),
}

impl fmt::Display for Gamma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gamma::Off => write!(f, "OFF"),
            Gamma::Value(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum ScanMode {
    #[default]
    #[strum(to_string = "NORMAL")]
    Normal,
}

/// Document source selector for `ESC S` / `ESC D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum Source {
    #[default]
    #[strum(to_string = "ADF")]
    Adf,
}

/// Eject behaviour of `ESC ABT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Eject {
    #[strum(to_string = "ALL")]
    All,
    #[strum(to_string = "ONE")]
    One,
    #[strum(to_string = "NO")]
    No,
}

/// `ESC SSP`: set scan parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SspRequest {
    /// RESO
    pub resolution: (Resolution, Resolution),
    /// OS
    pub os: String,
    /// PSRC
    pub feed_source: FeedSource,
    /// DPLX
    pub duplex: OnOff,
    /// PAGE
    pub page: PageMode,
    /// CLR
    pub color: ColorMode,
    /// AREA
    pub area: AreaMode,
    /// MRGN
    pub margin: (u32, u32, u32, u32),
    /// CONT
    pub contrast: u8,
    /// BRIT
    pub brightness: u8,
    /// ATCL, auto-color level
    pub autocolor_level: Option<u8>,
    /// THRS
    pub threshold: Option<Threshold>,
    /// COMP
    pub compression: Compression,
    /// JSF, JPEG sample factor
    pub jpeg_sampling: JpegSampling,
    /// RATE, compression ratio 0..=2
    pub rate: u8,
    /// LONG
    pub long_page: OnOff,
    /// DTDF, double-feed detection
    pub double_feed_detection: OnOff,
    /// OPDF, action on double feed
    pub double_feed_action: Option<DoubleFeedAction>,
    /// RMBP
    pub remove_blank: BlankPageRemoval,
    /// GMMA
    pub gamma: Gamma,
    /// TONE
    pub tone: OnOff,
    /// ATCN, continuous scan
    pub continuous: OnOff,
    /// ATFD, continuous scan delay (at most 5)
    pub continuous_delay: Option<u8>,
}

impl SspRequest {
    pub fn new(dpi: u16) -> Self {
        Self {
            resolution: (Resolution::Dpi(dpi), Resolution::Dpi(dpi)),
            os: "RPI".to_string(),
            feed_source: FeedSource::Auto,
            duplex: OnOff::Off,
            page: PageMode::Paged,
            color: ColorMode::Color24,
            area: AreaMode::Over,
            margin: (0, 0, 0, 0),
            contrast: 50,
            brightness: 50,
            autocolor_level: None,
            threshold: None,
            compression: Compression::Jpeg,
            jpeg_sampling: JpegSampling::S420,
            rate: 0,
            long_page: OnOff::Off,
            double_feed_detection: OnOff::Off,
            double_feed_action: None,
            remove_blank: BlankPageRemoval::Off,
            gamma: Gamma::Off,
            tone: OnOff::Off,
            continuous: OnOff::Off,
            continuous_delay: None,
        }
    }

    pub fn long(mut self, long: bool) -> Self {
        self.long_page = long.into();
        self
    }

    pub fn to_bytes(&self) -> Bytes {
        ParamWriter::default()
            .field("RESO", &self.resolution)
            .field("OS", &self.os)
            .field("PSRC", &self.feed_source)
            .field("DPLX", &self.duplex)
            .field("PAGE", &self.page)
            .field("CLR", &self.color)
            .field("AREA", &self.area)
            .field("MRGN", &self.margin)
            .field("CONT", &self.contrast)
            .field("BRIT", &self.brightness)
            .field("ATCL", &self.autocolor_level)
            .field("THRS", &self.threshold)
            .field("COMP", &self.compression)
            .field("JSF", &self.jpeg_sampling)
            .field("RATE", &self.rate)
            .field("LONG", &self.long_page)
            .field("DTDF", &self.double_feed_detection)
            .field("OPDF", &self.double_feed_action)
            .field("RMBP", &self.remove_blank)
            .field("GMMA", &self.gamma)
            .field("TONE", &self.tone)
            .field("ATCN", &self.continuous)
            .field("ATFD", &self.continuous_delay)
            .finish()
    }

    pub fn to_command(&self) -> Vec<u8> {
        frame("SSP", &self.to_bytes())
    }
}

/// `ESC XSC`: start a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XscRequest {
    /// RESO
    pub resolution: (u16, u16),
    /// AREA as left, top, right, bottom in dots
    pub area: (u32, u32, u32, u32),
    /// MODE
    pub mode: ScanMode,
}

impl XscRequest {
    pub fn new(dpi: u16, area: [u32; 4]) -> Self {
        Self {
            resolution: (dpi, dpi),
            area: (area[0], area[1], area[2], area[3]),
            mode: ScanMode::Normal,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        ParamWriter::default()
            .field("RESO", &self.resolution)
            .field("AREA", &self.area)
            .field("MODE", &self.mode)
            .finish()
    }

    pub fn to_command(&self) -> Vec<u8> {
        frame("XSC", &self.to_bytes())
    }
}

/// `ESC ABT` with the given eject behaviour.
pub fn abort_command(eject: Eject) -> Vec<u8> {
    frame("ABT", format!("EJCT={eject}").as_bytes())
}
