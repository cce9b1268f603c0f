//! Server-side TFTP (RFC 1350) engine.
//!
//! A [`TftpServer`] listens on the well-known port and hands every accepted
//! read or write request to its own session, running on a fresh UDP port.
//! Sessions stream file contents to and from a [`TransferHandler`] through a
//! bounded [`pipe`], so handlers never see packets, block numbers or timers.

pub mod client;
pub mod config;
pub mod error;
pub mod fs_handler;
pub mod handler;
pub mod netascii;
pub mod packet;
pub mod pipe;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;

pub use client::TftpClient;
pub use config::{
    LogFormat, LoggingConfig, TftpConfig, WriteConfig, load_config, validate_config,
    validate_session_config, write_config,
};
pub use error::{Result, TftpError};
pub use fs_handler::DirectoryHandler;
pub use handler::{TransferHandler, TransferRequest};
pub use packet::{BLOCK_SIZE, ErrorCode, MAX_PACKET_SIZE, Opcode, Packet, TransferMode};
pub use pipe::{PipeError, PipeReader, PipeWriter, pipe};
pub use receiver::Receiver;
pub use sender::Sender;
pub use server::TftpServer;
pub use session::{SessionConfig, TransferSocket, TransferStats};
