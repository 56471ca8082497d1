//! MSPM0 BSL wire protocol.
//!
//! Command frames are `[0x80][len:2 LE][cmd][payload..][crc:4 LE]` where `len`
//! counts the command byte plus payload and the CRC covers the same span.

use core::convert::TryFrom;
use core::fmt;

use crate::checksum::checksum;

/// Frame header byte
pub const HEADER: u8 = 0x80;

/// Header, length and command bytes preceding the payload
pub const HDR_LEN: usize = 4;
/// Trailing checksum bytes
pub const CRC_LEN: usize = 4;

/// Largest frame the link carries in either direction
pub const MAX_FRAME: usize = 256;
pub const MAX_PAYLOAD: usize = MAX_FRAME - HDR_LEN - CRC_LEN;

/// Offset of the acknowledgement byte in a received buffer
pub const ACK_OFFSET: usize = 4;
pub const ACK_SUCCESS: u8 = 0x00;

/// Firmware bytes carried by a single ProgramData frame
pub const BLOCK_SIZE: usize = 128;

/// ProgramData payload prefix, address and data length
pub const PROGRAM_HDR_LEN: usize = 6;

pub const PASSWORD_LEN: usize = 32;

/// Unlock key of a device with no BSL password set
pub const DEFAULT_PASSWORD: [u8; PASSWORD_LEN] = [0xFF; PASSWORD_LEN];

/// Byte a running application accepts as a request to reboot into the BSL
pub const SOFTWARE_INVOKE: u8 = 0x22;

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Command {
    /// Establish the connection with the bootloader
    Connection = 0x12,

    /// Read the device identification block
    GetId = 0x19,

    /// Unlock protected commands with the 32-byte password
    LoadPassword = 0x21,

    /// Erase all of main flash
    MassErase = 0x15,

    /// Write up to one block of data at an address
    ProgramData = 0x20,

    /// Leave the bootloader and reset into the application
    StartApplication = 0x40,
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let c = match v {
            0x12 => Command::Connection,
            0x19 => Command::GetId,
            0x21 => Command::LoadPassword,
            0x15 => Command::MassErase,
            0x20 => Command::ProgramData,
            0x40 => Command::StartApplication,
            _ => return Err(FrameError::UnknownCommand(v)),
        };
        Ok(c)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the 248 byte limit")]
    PayloadTooLarge(usize),

    #[error("frame truncated")]
    Truncated,

    #[error("unexpected frame header 0x{0:02x}")]
    BadHeader(u8),

    #[error("frame length field does not match received bytes")]
    LengthMismatch,

    #[error("checksum mismatch (expected 0x{expected:08x}, received 0x{actual:08x})")]
    Checksum { expected: u32, actual: u32 },

    #[error("unknown command opcode 0x{0:02x}")]
    UnknownCommand(u8),
}

/// An encoded command frame, held on the stack
#[derive(Clone)]
pub struct Frame {
    buf: [u8; MAX_FRAME],
    len: usize,
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:02x?})", self.as_bytes())
    }
}

/// Encode a command and its payload into a wire frame
pub fn encode(command: Command, payload: &[u8]) -> Result<Frame, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut buf = [0u8; MAX_FRAME];
    let body_len = payload.len() + 1;

    buf[0] = HEADER;
    buf[1..3].copy_from_slice(&(body_len as u16).to_le_bytes());
    buf[3] = command as u8;
    buf[HDR_LEN..HDR_LEN + payload.len()].copy_from_slice(payload);

    let end = HDR_LEN + payload.len();
    let crc = checksum(&buf[3..end]);
    buf[end..end + CRC_LEN].copy_from_slice(&crc.to_le_bytes());

    Ok(Frame {
        buf,
        len: end + CRC_LEN,
    })
}

/// Encode a ProgramData frame writing `data` at `address`
pub fn encode_program_data(address: u32, data: &[u8]) -> Result<Frame, FrameError> {
    let mut payload = [0u8; MAX_PAYLOAD];
    let len = PROGRAM_HDR_LEN + data.len();
    if len > MAX_PAYLOAD || data.len() > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge(len));
    }

    payload[0..4].copy_from_slice(&address.to_le_bytes());
    payload[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
    payload[PROGRAM_HDR_LEN..len].copy_from_slice(data);

    encode(Command::ProgramData, &payload[..len])
}

/// Decode a complete command frame, checking header, length and checksum
pub fn decode_frame(raw: &[u8]) -> Result<(Command, &[u8]), FrameError> {
    if raw.len() < HDR_LEN + CRC_LEN {
        return Err(FrameError::Truncated);
    }
    if raw[0] != HEADER {
        return Err(FrameError::BadHeader(raw[0]));
    }

    let body_len = u16::from_le_bytes([raw[1], raw[2]]) as usize;
    if body_len == 0 || 3 + body_len + CRC_LEN != raw.len() {
        return Err(FrameError::LengthMismatch);
    }

    let end = 3 + body_len;
    let expected = checksum(&raw[3..end]);
    let actual = u32::from_le_bytes([raw[end], raw[end + 1], raw[end + 2], raw[end + 3]]);
    if expected != actual {
        return Err(FrameError::Checksum { expected, actual });
    }

    let command = Command::try_from(raw[3])?;
    Ok((command, &raw[HDR_LEN..end]))
}

/// Interpreted reply to a single command exchange
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// Too few bytes arrived within the read window to carry an ack
    NoResponse,
    Reply { ack: u8, extra: Vec<u8> },
}

impl Response {
    /// Interpret a received buffer, reading the ack at [`ACK_OFFSET`]
    pub fn decode(raw: &[u8]) -> Self {
        match raw.get(ACK_OFFSET) {
            Some(ack) => Response::Reply {
                ack: *ack,
                extra: raw[ACK_OFFSET + 1..].to_vec(),
            },
            None => Response::NoResponse,
        }
    }

    pub fn ack(&self) -> Option<u8> {
        match self {
            Response::Reply { ack, .. } => Some(*ack),
            Response::NoResponse => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.ack() == Some(ACK_SUCCESS)
    }
}
