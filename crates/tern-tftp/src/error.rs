use std::net::SocketAddr;

use thiserror::Error;

use crate::packet::ErrorCode;
use crate::pipe::PipeError;

#[derive(Error, Debug)]
pub enum TftpError {
    /// Datagram that does not decode as an RFC 1350 packet
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Datagram from a source other than the session peer
    #[error("Unknown transfer ID: {0}")]
    UnknownTransferId(SocketAddr),

    /// Unexpected opcode or block number within a session
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timed out waiting for block {block} after {retries} retries")]
    Timeout { block: u16, retries: u32 },

    /// The handler closed its end of the pipe with an error
    #[error("Handler failure: {0}")]
    HandlerFailure(#[from] PipeError),

    /// The remote peer sent an ERROR packet
    #[error("Peer sent error {code}: {message}")]
    PeerError { code: ErrorCode, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TftpError {
    /// ERROR packet contents to send the peer when a session aborts with this error.
    ///
    /// Returns `None` when the peer must not get a reply: it already sent an
    /// ERROR itself, which terminates the transfer on both ends.
    pub fn wire_error(&self) -> Option<(ErrorCode, String)> {
        match self {
            TftpError::PeerError { .. } => None,
            TftpError::HandlerFailure(e) => Some((e.code(), e.message().to_string())),
            TftpError::ProtocolViolation(msg) => Some((ErrorCode::IllegalOperation, msg.clone())),
            TftpError::UnknownTransferId(_) => {
                Some((ErrorCode::UnknownTid, "Unknown transfer ID".to_string()))
            }
            TftpError::Timeout { .. } => Some((ErrorCode::NotDefined, "Transfer timed out".to_string())),
            other => Some((ErrorCode::NotDefined, other.to_string())),
        }
    }

    /// Reason handed to the handler when its pipe is closed by an aborted session.
    pub fn to_pipe_error(&self) -> PipeError {
        match self {
            TftpError::HandlerFailure(e) => e.clone(),
            TftpError::PeerError { code, message } => PipeError::new(*code, message.clone()),
            other => PipeError::new(ErrorCode::NotDefined, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;
