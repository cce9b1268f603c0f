use std::net::SocketAddr;

use async_trait::async_trait;

use crate::packet::TransferMode;
use crate::pipe::{PipeReader, PipeWriter};

/// An accepted RRQ/WRQ as seen by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub filename: String,
    pub mode: TransferMode,
    pub peer: SocketAddr,
}

/// Storage behind the server.
///
/// Each call runs on its own task, concurrently with the protocol session it
/// feeds. The pipe is the only link between the two: closing it with an error
/// aborts the transfer and the error is reported to the client.
#[async_trait]
pub trait TransferHandler: Send + Sync + 'static {
    /// Serve a read request: write the file's bytes into `writer`, then
    /// `close()` it, or `close_with_error()` if the file cannot be served.
    async fn produce(&self, request: TransferRequest, writer: PipeWriter);

    /// Serve a write request: drain `reader` until it reports end of data
    /// (success) or an error (the transfer was aborted).
    async fn consume(&self, request: TransferRequest, reader: PipeReader);
}
