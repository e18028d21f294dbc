//! Pebble Feel Protocol
//!
//! This module contains the protocol definitions for communicating with
//! the Pebble Feel wearable: GATT identifiers, fixed command blobs, the
//! register read frame codec and the mode value table.

use crate::domain::models::Mode;
use tracing::trace;

/// Pebble Feel BLE Service UUID (advertised)
pub const SERVICE_UUID: &str = "5df89308-0b98-11eb-adc1-0242ac120002";

/// Write-only characteristic used for enable and mode commands
pub const WRITE_CHAR_UUID: &str = "8eb21104-0b98-11eb-adc1-0242ac120002";

/// Write + notify characteristic. Read requests go out here and the
/// replies come back as notifications on the same characteristic.
pub const PIPE_CHAR_UUID: &str = "8eb20e7a-0b98-11eb-adc1-0242ac120002";

/// Frame preamble byte
pub const PREAMBLE: u8 = 0x55;
/// Register read request opcode
pub const OPCODE_READ: u8 = 0xA1;
/// Register read reply opcode
pub const OPCODE_READ_REPLY: u8 = 0xA2;
/// Command scope byte shared by requests and replies
pub const SCOPE: u8 = 0xE0;

/// Frame terminator appended after the ASCII-hex text
pub const TERMINATOR: &[u8] = b"\r\n";

/// Raw (decoded) frame length in bytes
pub const FRAME_LEN: usize = 8;

/// Register addresses
pub mod register {
    /// Enable flag (bit 0)
    pub const ENABLE: u8 = 0x80;
    /// Operating mode value
    pub const MODE: u8 = 0x90;
}

/// Delay after an enable write before the device accepts a mode write
pub const ENABLE_SETTLE_MS: u64 = 200;

/// Delay after subscribing before the device starts delivering notifications
pub const SUBSCRIBE_SETTLE_MS: u64 = 100;

/// Default time to wait for a read reply
pub const READ_TIMEOUT_MS: u64 = 3000;

/// Manufacturer command blobs. These are sent as-is and are not produced
/// by the read frame codec.
pub mod command {
    /// Power on
    pub const ENABLE: &[u8] = b"55a0e080000100aa\r\n";
    /// Power off
    pub const DISABLE: &[u8] = b"55a0e080000000ab\r\n";

    pub const MODE_COOL_LOW: &[u8] = b"55a0e09000020099\r\n";
    pub const MODE_COOL_MID: &[u8] = b"55a0e09000030098\r\n";
    pub const MODE_COOL_HIGH: &[u8] = b"55a0e09000040097\r\n";
    pub const MODE_COOL_RAPID: &[u8] = b"55a0e09000050096\r\n";
    pub const MODE_HOT_LOW: &[u8] = b"55a0e09000060095\r\n";
    pub const MODE_HOT_MID: &[u8] = b"55a0e09000070094\r\n";
    pub const MODE_HOT_HIGH: &[u8] = b"55a0e09000080093\r\n";
}

/// Enable or disable command blob
pub fn enable_command(on: bool) -> &'static [u8] {
    if on {
        command::ENABLE
    } else {
        command::DISABLE
    }
}

/// Set-mode command blob for a mode
pub fn mode_command(mode: Mode) -> &'static [u8] {
    match mode {
        Mode::CoolLow => command::MODE_COOL_LOW,
        Mode::CoolMid => command::MODE_COOL_MID,
        Mode::CoolHigh => command::MODE_COOL_HIGH,
        Mode::CoolRapid => command::MODE_COOL_RAPID,
        Mode::HotLow => command::MODE_HOT_LOW,
        Mode::HotMid => command::MODE_HOT_MID,
        Mode::HotHigh => command::MODE_HOT_HIGH,
    }
}

/// Register value reported for a mode
pub fn mode_to_value(mode: Mode) -> u16 {
    match mode {
        Mode::CoolLow => 0x0002,
        Mode::CoolMid => 0x0003,
        Mode::CoolHigh => 0x0004,
        Mode::CoolRapid => 0x0005,
        Mode::HotLow => 0x0006,
        Mode::HotMid => 0x0007,
        Mode::HotHigh => 0x0008,
    }
}

/// Inverse of [`mode_to_value`]. Values outside the table mean the device
/// is in no known mode.
pub fn value_to_mode(value: u16) -> Option<Mode> {
    Mode::ALL
        .iter()
        .copied()
        .find(|mode| mode_to_value(*mode) == value)
}

/// Two's complement of the byte sum
pub fn checksum(data: &[u8; 7]) -> u8 {
    let total = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    total.wrapping_neg()
}

/// Raw 8-byte read request for a register
pub fn read_frame_bytes(address: u8) -> [u8; FRAME_LEN] {
    let head = [PREAMBLE, OPCODE_READ, SCOPE, address, 0x00, 0x00, 0x00];
    let mut frame = [0u8; FRAME_LEN];
    frame[..7].copy_from_slice(&head);
    frame[7] = checksum(&head);
    frame
}

/// Wire form of a read request: uppercase ASCII-hex followed by CRLF
///
/// ```text
/// 55 A1 E0 <addr> 00 00 00 <chk>  ->  "55A1E0<AA>000000<CC>\r\n"
/// ```
pub fn build_read_frame(address: u8) -> Vec<u8> {
    let mut wire = hex::encode_upper(read_frame_bytes(address)).into_bytes();
    wire.extend_from_slice(TERMINATOR);
    wire
}

/// A decoded register read reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame {
    pub address: u8,
    pub value: u16,
}

/// Parse an ASCII-hex notification payload
///
/// # Reply Structure
///
/// ```text
/// [0]   : 0x55 preamble
/// [1]   : 0xA2 read reply
/// [2]   : 0xE0 scope
/// [3]   : register address
/// [4-5] : value (u16 big-endian)
/// [6..] : padding and checksum (not verified)
/// ```
///
/// Garbage on the radio link is expected, so every malformed payload simply
/// yields `None`.
pub fn parse_response(payload: &[u8]) -> Option<ResponseFrame> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    let raw = match hex::decode(text) {
        Ok(raw) => raw,
        Err(e) => {
            trace!("Discarding non-hex payload: {}", e);
            return None;
        }
    };

    if raw.len() < FRAME_LEN {
        trace!("Discarding short frame: {} bytes", raw.len());
        return None;
    }
    if raw[0] != PREAMBLE || raw[1] != OPCODE_READ_REPLY || raw[2] != SCOPE {
        trace!("Discarding frame with unexpected header: {:02X?}", &raw[..3]);
        return None;
    }

    Some(ResponseFrame {
        address: raw[3],
        value: u16::from_be_bytes([raw[4], raw[5]]),
    })
}

/// Parse a Bluetooth address of the form `AA:BB:CC:DD:EE:FF` (or with `-`
/// separators) into the 48-bit integer form used by WinRT
pub fn parse_bluetooth_address(address: &str) -> Option<u64> {
    let parts: Vec<&str> = address.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }

    let mut value = 0u64;
    for part in parts {
        if part.len() != 2 {
            return None;
        }
        let byte = u8::from_str_radix(part, 16).ok()?;
        value = (value << 8) | byte as u64;
    }
    Some(value)
}

/// Parse a UUID string into a Windows GUID
#[cfg(windows)]
pub fn parse_uuid(uuid_str: &str) -> anyhow::Result<windows::core::GUID> {
    let uuid_str = uuid_str.replace('-', "");

    if uuid_str.len() != 32 {
        return Err(anyhow::anyhow!("Invalid UUID format"));
    }

    let d1 = u32::from_str_radix(&uuid_str[0..8], 16)?;
    let d2 = u16::from_str_radix(&uuid_str[8..12], 16)?;
    let d3 = u16::from_str_radix(&uuid_str[12..16], 16)?;

    let mut d4 = [0u8; 8];
    for (i, byte) in d4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&uuid_str[16 + i * 2..18 + i * 2], 16)?;
    }

    Ok(windows::core::GUID {
        data1: d1,
        data2: d2,
        data3: d3,
        data4: d4,
    })
}
