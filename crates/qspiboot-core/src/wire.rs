//! Wire format for the UART command protocol
//!
//! All multi-byte fields are little-endian. A request is a 13-byte
//! header (CRC over its first 9 bytes), optionally followed by
//! `param_len` parameter bytes plus a trailing CRC over them. A
//! response is a 14-byte header starting with the frame marker (CRC
//! over its first 10 bytes), optionally followed by `payload_len`
//! payload bytes plus a trailing CRC.
//!
//! This module is shared between the device-side engine and the host
//! tool, so both ends agree on the framing by construction.

use crate::crc32;

/// Frame marker opening every response and resynchronizing requests
pub const FRAME_MARKER: u8 = 0xA5;

/// Sentinel transaction id used for unsolicited frames (Online, Debug)
pub const BROADCAST_ID: u32 = 0xFFFF_FFFF;

/// Size of an encoded request header
pub const COMMAND_HEADER_LEN: usize = 13;

/// Size of an encoded response header
pub const RESPONSE_HEADER_LEN: usize = 14;

/// Size of a frame CRC trailer
pub const CRC_LEN: usize = 4;

/// Page size for the ProgramPage operation
pub const PAGE_SIZE: usize = 256;

/// Command opcodes understood by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Liveness probe, no side effect
    Ping = 0x00,
    /// Switch the UART divisor; acknowledged at the old rate
    SetBaudrate = 0x01,
    /// Report the flash size discovered at boot
    FlashInfo = 0x02,
    /// Erase one sector at the given address
    EraseSector = 0x03,
    /// Program one 256-byte page at the given address
    ProgramPage = 0x04,
    /// Acknowledge, then hardware reset
    Reset = 0x05,
    /// Stream flash contents back to the host
    ReadFlash = 0x06,
    /// CRC a flash region without transferring it
    Checksum = 0x07,
    /// Read the chip identification registers
    ChipId = 0x08,
}

impl Opcode {
    /// Decode a raw opcode byte; `None` for out-of-range values
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(Self::Ping),
            0x01 => Some(Self::SetBaudrate),
            0x02 => Some(Self::FlashInfo),
            0x03 => Some(Self::EraseSector),
            0x04 => Some(Self::ProgramPage),
            0x05 => Some(Self::Reset),
            0x06 => Some(Self::ReadFlash),
            0x07 => Some(Self::Checksum),
            0x08 => Some(Self::ChipId),
            _ => None,
        }
    }

    /// Minimum acceptable `param_len` for this command
    pub fn min_param_len(self) -> u32 {
        match self {
            Self::Ping | Self::FlashInfo | Self::Reset | Self::ChipId => 0,
            Self::SetBaudrate | Self::EraseSector => 4,
            Self::ProgramPage => 4 + PAGE_SIZE as u32,
            Self::ReadFlash | Self::Checksum => 8,
        }
    }
}

/// Response codes sent back to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    /// Header or parameter CRC mismatch
    InvalidCrc = 0x00,
    /// Command accepted (framing level)
    CmdOk = 0x01,
    /// Opcode out of range
    CmdInvalid = 0x02,
    /// `param_len` below the handler's minimum
    ParamTooShort = 0x03,
    /// Command executed successfully
    Ok = 0x04,
    /// Unsolicited diagnostic text
    Debug = 0x05,
    /// Parameter value rejected by the handler
    InvalidParam = 0x06,
    /// Boot announcement
    Online = 0x07,
    /// Flash write-in-progress never cleared
    FlashTimeout = 0x08,
    /// Checksum result payload
    Checksum = 0x09,
    /// Flash geometry payload
    FlashInfo = 0x0A,
    /// Chip identification payload
    ChipId = 0x0B,
}

impl ResponseCode {
    /// Decode a raw response code byte
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(Self::InvalidCrc),
            0x01 => Some(Self::CmdOk),
            0x02 => Some(Self::CmdInvalid),
            0x03 => Some(Self::ParamTooShort),
            0x04 => Some(Self::Ok),
            0x05 => Some(Self::Debug),
            0x06 => Some(Self::InvalidParam),
            0x07 => Some(Self::Online),
            0x08 => Some(Self::FlashTimeout),
            0x09 => Some(Self::Checksum),
            0x0A => Some(Self::FlashInfo),
            0x0B => Some(Self::ChipId),
            _ => None,
        }
    }
}

/// Decoded request header
///
/// The marker byte preceding the header on the wire is consumed by the
/// resynchronization scan and is not part of this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Raw opcode byte (may be out of range; validated by the engine)
    pub opcode: u8,
    /// Host-chosen correlation tag, echoed in the response
    pub transaction_id: u32,
    /// Number of parameter bytes following the header
    pub param_len: u32,
    /// CRC-32 over the first 9 encoded bytes
    pub crc32: u32,
}

impl CommandHeader {
    /// Build a header with a freshly computed CRC (host side)
    pub fn new(opcode: Opcode, transaction_id: u32, param_len: u32) -> Self {
        let mut hdr = Self {
            opcode: opcode as u8,
            transaction_id,
            param_len,
            crc32: 0,
        };
        hdr.crc32 = crc32::checksum(&hdr.encode()[..9]);
        hdr
    }

    /// Encode into wire representation
    pub fn encode(&self) -> [u8; COMMAND_HEADER_LEN] {
        let mut raw = [0u8; COMMAND_HEADER_LEN];
        raw[0] = self.opcode;
        raw[1..5].copy_from_slice(&self.transaction_id.to_le_bytes());
        raw[5..9].copy_from_slice(&self.param_len.to_le_bytes());
        raw[9..13].copy_from_slice(&self.crc32.to_le_bytes());
        raw
    }

    /// Decode from wire representation without validating the CRC
    pub fn decode(raw: &[u8; COMMAND_HEADER_LEN]) -> Self {
        Self {
            opcode: raw[0],
            transaction_id: u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]),
            param_len: u32::from_le_bytes([raw[5], raw[6], raw[7], raw[8]]),
            crc32: u32::from_le_bytes([raw[9], raw[10], raw[11], raw[12]]),
        }
    }

    /// Check the embedded CRC against the first 9 encoded bytes
    pub fn crc_valid(&self) -> bool {
        crc32::checksum(&self.encode()[..9]) == self.crc32
    }
}

/// Decoded response header (marker byte included)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Raw response code byte
    pub code: u8,
    /// Correlation tag echoed from the request
    pub transaction_id: u32,
    /// Number of payload bytes following the header
    pub payload_len: u32,
    /// CRC-32 over the first 10 encoded bytes
    pub crc32: u32,
}

impl ResponseHeader {
    /// Build a header with a freshly computed CRC (device side)
    pub fn new(code: ResponseCode, transaction_id: u32, payload_len: u32) -> Self {
        let mut hdr = Self {
            code: code as u8,
            transaction_id,
            payload_len,
            crc32: 0,
        };
        hdr.crc32 = crc32::checksum(&hdr.encode()[..10]);
        hdr
    }

    /// Encode into wire representation, marker first
    pub fn encode(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut raw = [0u8; RESPONSE_HEADER_LEN];
        raw[0] = FRAME_MARKER;
        raw[1] = self.code;
        raw[2..6].copy_from_slice(&self.transaction_id.to_le_bytes());
        raw[6..10].copy_from_slice(&self.payload_len.to_le_bytes());
        raw[10..14].copy_from_slice(&self.crc32.to_le_bytes());
        raw
    }

    /// Decode from wire representation without validating marker or CRC
    pub fn decode(raw: &[u8; RESPONSE_HEADER_LEN]) -> Self {
        Self {
            code: raw[1],
            transaction_id: u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
            payload_len: u32::from_le_bytes([raw[6], raw[7], raw[8], raw[9]]),
            crc32: u32::from_le_bytes([raw[10], raw[11], raw[12], raw[13]]),
        }
    }

    /// Check the embedded CRC against the first 10 encoded bytes
    pub fn crc_valid(&self) -> bool {
        crc32::checksum(&self.encode()[..10]) == self.crc32
    }

    /// Decoded response code; `None` for values this crate doesn't know
    pub fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::from_u8(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_header_round_trip() {
        let hdr = CommandHeader::new(Opcode::EraseSector, 0x1122_3344, 4);
        let raw = hdr.encode();
        assert_eq!(raw[0], 0x03);
        assert_eq!(&raw[1..5], &0x1122_3344u32.to_le_bytes());
        let back = CommandHeader::decode(&raw);
        assert_eq!(back, hdr);
        assert!(back.crc_valid());
    }

    #[test]
    fn command_header_crc_covers_first_nine_bytes() {
        let hdr = CommandHeader::new(Opcode::Ping, 1, 0);
        let mut raw = hdr.encode();
        raw[1] ^= 0x01; // corrupt the transaction id
        assert!(!CommandHeader::decode(&raw).crc_valid());
    }

    #[test]
    fn response_header_round_trip() {
        let hdr = ResponseHeader::new(ResponseCode::FlashInfo, 7, 4);
        let raw = hdr.encode();
        assert_eq!(raw[0], FRAME_MARKER);
        assert_eq!(raw[1], 0x0A);
        let back = ResponseHeader::decode(&raw);
        assert_eq!(back, hdr);
        assert!(back.crc_valid());
        assert_eq!(back.response_code(), Some(ResponseCode::FlashInfo));
    }

    #[test]
    fn opcode_param_minimums() {
        assert_eq!(Opcode::Ping.min_param_len(), 0);
        assert_eq!(Opcode::SetBaudrate.min_param_len(), 4);
        assert_eq!(Opcode::ProgramPage.min_param_len(), 260);
        assert_eq!(Opcode::ReadFlash.min_param_len(), 8);
        assert_eq!(Opcode::from_u8(0x09), None);
    }
}
