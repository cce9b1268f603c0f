//! Write-request engine: the client pushes DATA, the server acknowledges

use tracing::{debug, info, warn};

use crate::error::{Result, TftpError};
use crate::packet::{BLOCK_SIZE, Packet};
use crate::pipe::PipeWriter;
use crate::session::{SessionConfig, TransferSocket, TransferStats};

pub struct Receiver {
    socket: TransferSocket,
    writer: PipeWriter,
    config: SessionConfig,
    first_block: u16,
}

impl Receiver {
    pub fn new(socket: TransferSocket, writer: PipeWriter, config: SessionConfig) -> Self {
        Self {
            socket,
            writer,
            config,
            first_block: 1,
        }
    }

    #[cfg(test)]
    fn starting_at(mut self, block: u16) -> Self {
        self.first_block = block;
        self
    }

    /// Run the transfer to completion.
    ///
    /// On every exit the pipe is closed exactly once (cleanly on success, with
    /// the abort reason otherwise) and the socket is dropped with `self`. The
    /// final ACK is only sent once the handler has accepted the data.
    pub async fn run(self) -> Result<TransferStats> {
        let Receiver {
            mut socket,
            mut writer,
            config,
            first_block,
        } = self;

        let result = match receive(&mut socket, &mut writer, &config, first_block).await {
            Ok((stats, last_block)) => match writer.close().await {
                Ok(()) => socket
                    .send(&Packet::Ack { block: last_block })
                    .await
                    .map(|()| stats),
                Err(e) => Err(TftpError::HandlerFailure(e)),
            },
            Err(e) => {
                writer.close_with_error(e.to_pipe_error()).await;
                Err(e)
            }
        };

        match result {
            Ok(stats) => {
                info!(blocks = stats.blocks, bytes = stats.bytes, "Write transfer complete");
                Ok(stats)
            }
            Err(e) => {
                warn!("Write transfer aborted: {}", e);
                socket.send_abort(&e).await;
                Err(e)
            }
        }
    }
}

/// Receive up to and including the short block, returning the stats and the
/// block number still to be acknowledged.
async fn receive(
    socket: &mut TransferSocket,
    writer: &mut PipeWriter,
    config: &SessionConfig,
    first_block: u16,
) -> Result<(TransferStats, u16)> {
    let mut stats = TransferStats::default();
    let mut expected = first_block;

    // ACK 0 answers the WRQ and fixes the peer's TID for the rest of the transfer
    let mut last_ack = Packet::Ack {
        block: expected.wrapping_sub(1),
    };
    socket.send(&last_ack).await?;

    let mut retries = 0;
    let mut deadline = config.deadline();

    loop {
        let Some(packet) = socket.recv_until(deadline).await? else {
            if retries >= config.max_retries {
                return Err(TftpError::Timeout {
                    block: expected,
                    retries,
                });
            }
            retries += 1;
            debug!(block = expected, retries, "Timeout waiting for DATA, re-sending last ACK");
            socket.send(&last_ack).await?;
            deadline = config.deadline();
            continue;
        };

        match packet {
            Packet::Data { block, payload } if block == expected => {
                let short = payload.len() < BLOCK_SIZE;
                stats.blocks += 1;
                stats.bytes += payload.len() as u64;

                writer.write(payload).await?;

                // RFC 1350: a block shorter than 512 bytes ends the transfer
                if short {
                    return Ok((stats, block));
                }

                last_ack = Packet::Ack { block };
                socket.send(&last_ack).await?;

                expected = expected.wrapping_add(1);
                retries = 0;
                deadline = config.deadline();
            }
            Packet::Data { block, .. } if block == expected.wrapping_sub(1) => {
                // The peer missed our ACK; acknowledge again without rewriting the data
                debug!(block, "Duplicate DATA, re-sending ACK");
                socket.send(&Packet::Ack { block }).await?;
            }
            Packet::Data { block, .. } => {
                return Err(TftpError::ProtocolViolation(format!(
                    "Unexpected DATA block {} (expected {})",
                    block, expected
                )));
            }
            Packet::Error { code, message } => {
                return Err(TftpError::PeerError { code, message });
            }
            other => {
                return Err(TftpError::ProtocolViolation(format!(
                    "Unexpected {:?} packet during write transfer",
                    other.opcode()
                )));
            }
        }
    }
}
