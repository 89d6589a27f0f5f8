// Wire and hardware constants for the Brother DS scanner

use std::time::Duration;

/// USB vendor id (Brother)
pub const VID: u16 = 0x04F9;

/// USB product id of the DS scanner
pub const PID: u16 = 0x0468;

/// USB configuration selected on open
pub const USB_CONFIGURATION: u8 = 1;

/// Interface carrying the command/response endpoints
pub const USER_INTERFACE: u8 = 1;

pub const ENDPOINT_OUT: u8 = 0x04;
pub const ENDPOINT_IN: u8 = 0x83;

/// Escape byte opening every command
pub const ESC: u8 = 0x1B;

/// Sentinel byte closing every command
pub const COMMAND_TERMINATOR: u8 = 0x80;

/// Size of a response packet read while streaming a scan
pub const PACKET_SIZE: usize = 1024;

/// Length of the acknowledgement to `ESC SSP`
pub const SSP_ACK_LEN: usize = 0x26;

/// Acknowledgement to `ESC ABT`
pub const ABT_ACK: [u8; 2] = [0x00, 0x81];

/// Acknowledgement to `ESC S` and `ESC D`
pub const SOURCE_ACK: [u8; 1] = [0x80];

/// Size of the image-chunk header following the two status bytes
pub const CHUNK_HEADER_SIZE: usize = 12;

/// Poll interval while waiting for scan packets
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default timeout for command writes
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default timeout for acknowledgements and chunk payloads
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the `ESC SSP` acknowledgement
pub const SSP_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// BCM pin driving the power switch
pub const PIN_POWER: u8 = 26;

/// BCM pin driving the front-panel button
pub const PIN_BUTTON: u8 = 16;

/// BCM pin emulating the paper-presence sensor
pub const PIN_PAPER: u8 = 19;

/// BCM pin keeping the feed motor driver awake
pub const PIN_MOTOR_WAKE: u8 = 12;
