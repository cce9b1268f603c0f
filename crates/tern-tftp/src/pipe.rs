//! Bounded byte pipe between a transfer session and its handler
//!
//! The channel holds at most one chunk, so a writer suspends until the other
//! side has taken the previous chunk. Either end can close with an error,
//! which is what the other end observes on its next operation.
//!
//! Closing the writer waits for the reader's verdict: the reader is done
//! once it is dropped, or refuses the data by closing with an error.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::packet::{BLOCK_SIZE, ErrorCode};

/// Failure carried across the pipe, with the TFTP error code to report on the wire
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct PipeError {
    code: ErrorCode,
    message: String,
}

impl PipeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for PipeError {
    fn from(e: io::Error) -> Self {
        let code = match e.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileExists,
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => ErrorCode::DiskFull,
            _ => ErrorCode::NotDefined,
        };
        PipeError::new(code, e.to_string())
    }
}

type Chunk = std::result::Result<Bytes, PipeError>;
type Verdict = std::result::Result<(), PipeError>;

#[derive(Default)]
struct Shared {
    reader_error: Mutex<Option<PipeError>>,
    writer_closed: AtomicBool,
}

/// Create a connected writer/reader pair.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(1);
    let (verdict_tx, verdict_rx) = oneshot::channel();
    let shared = Arc::new(Shared::default());

    (
        PipeWriter {
            tx,
            shared: shared.clone(),
            verdict: verdict_rx,
        },
        PipeReader {
            rx,
            shared,
            pending: Bytes::new(),
            finished: None,
            verdict: Some(verdict_tx),
        },
    )
}

pub struct PipeWriter {
    tx: mpsc::Sender<Chunk>,
    shared: Arc<Shared>,
    verdict: oneshot::Receiver<Verdict>,
}

impl PipeWriter {
    /// Hand one chunk to the reader, waiting until it has room.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), PipeError> {
        let data = data.into();
        if data.is_empty() {
            return if self.tx.is_closed() {
                Err(self.reader_gone())
            } else {
                Ok(())
            };
        }

        self.tx.send(Ok(data)).await.map_err(|_| self.reader_gone())
    }

    /// Copy an async reader into the pipe in block-sized chunks.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64, PipeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            self.write(Bytes::copy_from_slice(&buf[..n])).await?;
            total += n as u64;
        }
    }

    /// Signal a clean end of data and wait until the reader is finished with it.
    ///
    /// Resolves to the error the reader closed with, if it refused the data.
    pub async fn close(self) -> Result<(), PipeError> {
        let PipeWriter {
            tx,
            shared,
            verdict,
        } = self;

        shared.writer_closed.store(true, Ordering::Release);
        drop(tx);
        // The reader always reports on drop; a lost sender counts as done.
        verdict.await.unwrap_or(Ok(()))
    }

    /// Signal failure; the reader sees `err` after any chunk already queued.
    pub async fn close_with_error(self, err: PipeError) {
        // A send error means the reader is gone and nobody is left to tell.
        let _ = self.tx.send(Err(err)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn reader_gone(&self) -> PipeError {
        self.shared
            .reader_error
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_else(|| PipeError::new(ErrorCode::NotDefined, "Reader closed the pipe"))
    }
}

pub struct PipeReader {
    rx: mpsc::Receiver<Chunk>,
    shared: Arc<Shared>,
    pending: Bytes,
    finished: Option<Result<(), PipeError>>,
    verdict: Option<oneshot::Sender<Verdict>>,
}

impl PipeReader {
    /// Next chunk as written, or `None` once the writer closed cleanly.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, PipeError> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        if let Some(finished) = &self.finished {
            return finished.clone().map(|()| None);
        }

        let outcome = match self.rx.recv().await {
            Some(Ok(chunk)) => return Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            None if self.shared.writer_closed.load(Ordering::Acquire) => Ok(()),
            None => Err(PipeError::new(
                ErrorCode::NotDefined,
                "Writer dropped without closing the pipe",
            )),
        };

        self.finished = Some(outcome.clone());
        outcome.map(|()| None)
    }

    /// Read exactly `len` bytes, or fewer only when the writer closed first.
    pub async fn read_block(&mut self, len: usize) -> Result<Bytes, PipeError> {
        let mut block = BytesMut::with_capacity(len);

        while block.len() < len {
            let Some(mut chunk) = self.read_chunk().await? else {
                break;
            };
            let take = (len - block.len()).min(chunk.len());
            block.extend_from_slice(&chunk[..take]);
            chunk.advance(take);
            self.pending = chunk;
        }

        Ok(block.freeze())
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes, PipeError> {
        let mut data = BytesMut::new();
        while let Some(chunk) = self.read_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data.freeze())
    }

    /// Drain the pipe into an async writer, returning the byte count.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> Result<u64, PipeError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;
        while let Some(chunk) = self.read_chunk().await? {
            writer.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(total)
    }

    /// Refuse the data; the writer's next `write` or its `close` fails with `err`.
    pub fn close_with_error(mut self, err: PipeError) {
        if let Ok(mut guard) = self.shared.reader_error.lock() {
            *guard = Some(err.clone());
        }
        self.rx.close();
        if let Some(verdict) = self.verdict.take() {
            let _ = verdict.send(Err(err));
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if let Some(verdict) = self.verdict.take() {
            let _ = verdict.send(Ok(()));
        }
    }
}
