//! RFC 1350 packet codec
//!
//! Every TFTP packet starts with a 2-byte big-endian opcode:
//!
//! ```text
//! RRQ/WRQ | 01/02 | filename | 0 | mode | 0 |
//! DATA    | 03    | block #  | data (0-512 bytes)  |
//! ACK     | 04    | block #  |
//! ERROR   | 05    | code     | message | 0 |
//! ```
//!
//! Encoding and decoding are pure transforms with no I/O.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};

/// RFC 1350 fixed block size
pub const BLOCK_SIZE: usize = 512;
/// Largest packet the base protocol produces: DATA header + one full block
pub const MAX_PACKET_SIZE: usize = BLOCK_SIZE + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read request
    Wrq = 2,   // Write request
    Data = 3,  // Data packet
    Ack = 4,   // Acknowledgment
    Error = 5, // Error packet
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> std::result::Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            _ => Err(TftpError::MalformedPacket(format!("Invalid opcode: {}", value))),
        }
    }
}

// RFC 1350 - TFTP Error Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined,       // Not defined, see error message
    FileNotFound,     // File not found
    AccessViolation,  // Access violation
    DiskFull,         // Disk full or allocation exceeded
    IllegalOperation, // Illegal TFTP operation
    UnknownTid,       // Unknown transfer ID
    FileExists,       // File already exists
    NoSuchUser,       // No such user
    /// Code outside the RFC 1350 table, kept verbatim
    Other(u16),
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            0 => ErrorCode::NotDefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::Other(value) => value,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", u16::from(*self), self)
    }
}

/// RFC 1350 transfer modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// 8-bit ASCII with CR+LF line endings on the wire
    Netascii,
    /// Raw bytes, no conversion
    Octet,
    /// Obsolete, recognised only so it can be refused explicitly
    Mail,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
        }
    }
}

impl FromStr for TransferMode {
    type Err = TftpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            _ => Err(TftpError::ProtocolViolation(format!(
                "Invalid transfer mode: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String, mode: String },
    Wrq { filename: String, mode: String },
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

impl Packet {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }

    /// Decode a raw UDP payload.
    ///
    /// Bytes following the mode string of a request (RFC 2347 options) are
    /// ignored, so option-aware clients fall back to plain RFC 1350.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;

        if buf.remaining() < 2 {
            return Err(TftpError::MalformedPacket("Packet too small".to_string()));
        }
        let opcode = Opcode::try_from(buf.get_u16())?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let filename = parse_string(&mut buf, "filename")?;
                let mode = parse_string(&mut buf, "mode")?;
                if opcode == Opcode::Rrq {
                    Ok(Packet::Rrq { filename, mode })
                } else {
                    Ok(Packet::Wrq { filename, mode })
                }
            }
            Opcode::Data => {
                if buf.remaining() < 2 {
                    return Err(TftpError::MalformedPacket(
                        "DATA packet missing block number".to_string(),
                    ));
                }
                let block = buf.get_u16();
                if buf.remaining() > BLOCK_SIZE {
                    return Err(TftpError::MalformedPacket(format!(
                        "DATA payload of {} bytes exceeds {}",
                        buf.remaining(),
                        BLOCK_SIZE
                    )));
                }
                Ok(Packet::Data {
                    block,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            Opcode::Ack => {
                if buf.remaining() < 2 {
                    return Err(TftpError::MalformedPacket(
                        "ACK packet missing block number".to_string(),
                    ));
                }
                Ok(Packet::Ack {
                    block: buf.get_u16(),
                })
            }
            Opcode::Error => {
                if buf.remaining() < 2 {
                    return Err(TftpError::MalformedPacket(
                        "ERROR packet missing error code".to_string(),
                    ));
                }
                let code = ErrorCode::from(buf.get_u16());
                // Some clients omit the final NUL; take the rest of the buffer then.
                let message = match buf.iter().position(|&b| b == 0) {
                    Some(_) => parse_string(&mut buf, "error message")?,
                    None => utf8(buf, "error message")?,
                };
                Ok(Packet::Error { code, message })
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(self.opcode() as u16);

        match self {
            Packet::Rrq { filename, mode } | Packet::Wrq { filename, mode } => {
                put_string(&mut buf, filename);
                put_string(&mut buf, mode);
            }
            Packet::Data { block, payload } => {
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => buf.put_u16(*block),
            Packet::Error { code, message } => {
                buf.put_u16(u16::from(*code));
                put_string(&mut buf, message);
            }
        }

        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        2 + match self {
            Packet::Rrq { filename, mode } | Packet::Wrq { filename, mode } => {
                filename.len() + mode.len() + 2
            }
            Packet::Data { payload, .. } => 2 + payload.len(),
            Packet::Ack { .. } => 2,
            Packet::Error { message, .. } => 2 + message.len() + 1,
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn parse_string(buf: &mut &[u8], field: &str) -> Result<String> {
    let null_pos = buf.iter().position(|&b| b == 0).ok_or_else(|| {
        TftpError::MalformedPacket(format!("No null terminator found for {}", field))
    })?;

    let s = utf8(&buf[..null_pos], field)?;
    buf.advance(null_pos + 1);
    Ok(s)
}

fn utf8(bytes: &[u8], field: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| TftpError::MalformedPacket(format!("Invalid UTF-8 in {}: {}", field, e)))
}
