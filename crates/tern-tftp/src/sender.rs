//! Read-request engine: the server pushes DATA, the client acknowledges

use tracing::{debug, info, warn};

use crate::error::{Result, TftpError};
use crate::packet::{BLOCK_SIZE, Packet};
use crate::pipe::PipeReader;
use crate::session::{SessionConfig, TransferSocket, TransferStats};

pub struct Sender {
    socket: TransferSocket,
    reader: PipeReader,
    config: SessionConfig,
    first_block: u16,
}

impl Sender {
    pub fn new(socket: TransferSocket, reader: PipeReader, config: SessionConfig) -> Self {
        Self {
            socket,
            reader,
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
    /// An aborted transfer closes the pipe with the abort reason so the
    /// handler stops producing; the socket is dropped with `self` either way.
    pub async fn run(self) -> Result<TransferStats> {
        let Sender {
            mut socket,
            mut reader,
            config,
            first_block,
        } = self;

        match send(&mut socket, &mut reader, &config, first_block).await {
            Ok(stats) => {
                info!(blocks = stats.blocks, bytes = stats.bytes, "Read transfer complete");
                Ok(stats)
            }
            Err(e) => {
                warn!("Read transfer aborted: {}", e);
                socket.send_abort(&e).await;
                reader.close_with_error(e.to_pipe_error());
                Err(e)
            }
        }
    }
}

async fn send(
    socket: &mut TransferSocket,
    reader: &mut PipeReader,
    config: &SessionConfig,
    first_block: u16,
) -> Result<TransferStats> {
    let mut stats = TransferStats::default();
    let mut block = first_block;

    loop {
        // Exactly 512 bytes unless the handler closed; a file that is a
        // multiple of 512 therefore ends with an empty block.
        let chunk = reader.read_block(BLOCK_SIZE).await?;
        let len = chunk.len();

        // Encoded once: retransmissions resend these bytes, never re-read the pipe
        let datagram = Packet::Data {
            block,
            payload: chunk,
        }
        .encode();
        socket.send_raw(&datagram).await?;

        wait_for_ack(socket, block, &datagram, config).await?;

        stats.blocks += 1;
        stats.bytes += len as u64;

        // RFC 1350: a block shorter than 512 bytes ends the transfer
        if len < BLOCK_SIZE {
            return Ok(stats);
        }

        // RFC 1350: Block numbers wrap around after 65535
        block = block.wrapping_add(1);
    }
}

async fn wait_for_ack(
    socket: &mut TransferSocket,
    block: u16,
    datagram: &[u8],
    config: &SessionConfig,
) -> Result<()> {
    let mut retries = 0;
    let mut deadline = config.deadline();

    loop {
        match socket.recv_until(deadline).await? {
            None => {
                if retries >= config.max_retries {
                    return Err(TftpError::Timeout { block, retries });
                }
                retries += 1;
                debug!(block, retries, "Timeout waiting for ACK, retransmitting DATA");
                socket.send_raw(datagram).await?;
                deadline = config.deadline();
            }
            Some(Packet::Ack { block: acked }) if acked == block => return Ok(()),
            Some(Packet::Ack { block: acked }) if is_earlier(acked, block) => {
                // Stale or duplicate ACK; keep the current deadline
                debug!(acked, block, "Ignoring stale ACK");
            }
            Some(Packet::Ack { block: acked }) => {
                return Err(TftpError::ProtocolViolation(format!(
                    "ACK for block {} which was never sent (current {})",
                    acked, block
                )));
            }
            Some(Packet::Error { code, message }) => {
                return Err(TftpError::PeerError { code, message });
            }
            Some(other) => {
                return Err(TftpError::ProtocolViolation(format!(
                    "Unexpected {:?} packet during read transfer",
                    other.opcode()
                )));
            }
        }
    }
}

/// Whether `acked` precedes `current` in modulo-65536 block order.
fn is_earlier(acked: u16, current: u16) -> bool {
    let distance = current.wrapping_sub(acked);
    distance != 0 && distance < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ErrorCode;
    use crate::pipe::{PipeError, PipeWriter, pipe};
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::task::JoinHandle;

    struct Harness {
        client: UdpSocket,
        server: SocketAddr,
        engine: JoinHandle<Result<TransferStats>>,
        writer: PipeWriter,
    }

    async fn start(config: SessionConfig) -> Harness {
        start_at(config, 1).await
    }

    async fn start_at(config: SessionConfig, first_block: u16) -> Harness {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = TransferSocket::bind("127.0.0.1".parse().unwrap(), client.local_addr().unwrap())
            .await
            .unwrap();
        let server = socket.local_addr().unwrap();
        let (writer, reader) = pipe();
        let engine = tokio::spawn(
            Sender::new(socket, reader, config)
                .starting_at(first_block)
                .run(),
        );
        Harness {
            client,
            server,
            engine,
            writer,
        }
    }

    async fn recv_raw(client: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("no packet from server")
            .unwrap();
        buf[..n].to_vec()
    }

    async fn recv_data(client: &UdpSocket) -> (u16, Bytes) {
        match Packet::decode(&recv_raw(client).await).unwrap() {
            Packet::Data { block, payload } => (block, payload),
            other => panic!("expected DATA, got {:?}", other),
        }
    }

    async fn ack(client: &UdpSocket, server: SocketAddr, block: u16) {
        client
            .send_to(&Packet::Ack { block }.encode(), server)
            .await
            .unwrap();
    }

    fn produce(mut writer: PipeWriter, data: Vec<u8>) -> JoinHandle<()> {
        tokio::spawn(async move {
            writer.write(data).await.unwrap();
            let _ = writer.close().await;
        })
    }

    #[test]
    fn block_order_wraps() {
        assert!(is_earlier(1, 2));
        assert!(is_earlier(65535, 0));
        assert!(!is_earlier(2, 2));
        assert!(!is_earlier(3, 2));
        assert!(!is_earlier(0, 65535));
    }

    #[tokio::test]
    async fn fragments_stream_into_blocks() {
        let Harness {
            client,
            server,
            engine,
            writer,
        } = start(SessionConfig::default()).await;
        produce(writer, vec![9u8; 1000]);

        let (block, payload) = recv_data(&client).await;
        assert_eq!((block, payload.len()), (1, 512));
        ack(&client, server, 1).await;

        let (block, payload) = recv_data(&client).await;
        assert_eq!((block, payload.len()), (2, 488));
        ack(&client, server, 2).await;

        assert_eq!(
            engine.await.unwrap().unwrap(),
            TransferStats { blocks: 2, bytes: 1000 }
        );
    }

    #[tokio::test]
    async fn exact_multiple_of_block_size_ends_with_empty_block() {
        let Harness {
            client,
            server,
            engine,
            writer,
        } = start(SessionConfig::default()).await;
        produce(writer, vec![1u8; 1024]);

        for expected in 1..=2u16 {
            let (block, payload) = recv_data(&client).await;
            assert_eq!((block, payload.len()), (expected, 512));
            ack(&client, server, block).await;
        }

        let (block, payload) = recv_data(&client).await;
        assert_eq!(block, 3);
        assert!(payload.is_empty());
        ack(&client, server, 3).await;

        assert_eq!(engine.await.unwrap().unwrap().blocks, 3);
    }

    #[tokio::test]
    async fn empty_stream_sends_single_empty_block() {
        let Harness {
            client,
            server,
            engine,
            writer,
        } = start(SessionConfig::default()).await;
        tokio::spawn(writer.close());

        let (block, payload) = recv_data(&client).await;
        assert_eq!(block, 1);
        assert!(payload.is_empty());
        ack(&client, server, 1).await;

        assert_eq!(engine.await.unwrap().unwrap(), TransferStats { blocks: 1, bytes: 0 });
    }

    #[tokio::test]
    async fn block_numbers_wrap_past_65535() {
        let Harness {
            client,
            server,
            engine,
            writer,
        } = start_at(SessionConfig::default(), 65535).await;
        produce(writer, vec![4u8; 1100]);

        let (block, payload) = recv_data(&client).await;
        assert_eq!((block, payload.len()), (65535, 512));
        ack(&client, server, 65535).await;

        let (block, payload) = recv_data(&client).await;
        assert_eq!((block, payload.len()), (0, 512));
        // 65535 precedes 0, so this is stale rather than a future ACK
        ack(&client, server, 65535).await;
        ack(&client, server, 0).await;

        let (block, payload) = recv_data(&client).await;
        assert_eq!((block, payload.len()), (1, 76));
        ack(&client, server, 1).await;

        assert_eq!(
            engine.await.unwrap().unwrap(),
            TransferStats { blocks: 3, bytes: 1100 }
        );
    }

    #[tokio::test]
    async fn producer_close_reports_transfer_outcome() {
        let Harness {
            client,
            server,
            engine,
            mut writer,
        } = start(SessionConfig::default()).await;
        let producer = tokio::spawn(async move {
            writer.write(vec![2u8; 30]).await.unwrap();
            writer.close().await
        });

        let (block, _) = recv_data(&client).await;
        ack(&client, server, block).await;

        engine.await.unwrap().unwrap();
        assert_eq!(producer.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn retransmits_identical_bytes_on_timeout() {
        for config in [
            SessionConfig::new(Duration::from_millis(50), 1),
            SessionConfig::new(Duration::from_millis(100), 3),
        ] {
            let Harness {
                client,
                server,
                engine,
                mut writer,
            } = start(config).await;
            tokio::spawn(async move {
                writer.write(vec![0xA5u8; 512]).await.unwrap();
                writer.write(vec![0x5Au8; 20]).await.unwrap();
                let _ = writer.close().await;
            });

            let first = recv_raw(&client).await;
            let again = recv_raw(&client).await;
            assert_eq!(first, again);
            ack(&client, server, 1).await;

            // The next block comes from the second chunk, not a re-read of the first
            let (block, payload) = recv_data(&client).await;
            assert_eq!(block, 2);
            assert_eq!(&payload[..], &[0x5Au8; 20][..]);
            ack(&client, server, 2).await;

            engine.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn stale_acks_do_not_reset_the_timer() {
        let config = SessionConfig::new(Duration::from_millis(200), 0);
        let Harness {
            client,
            server,
            engine,
            writer,
        } = start(config).await;
        produce(writer, vec![3u8; 600]);

        recv_data(&client).await;
        ack(&client, server, 1).await;
        recv_data(&client).await;

        // Keep sending stale ACKs; the session must still time out on schedule.
        let flood = tokio::spawn(async move {
            for _ in 0..20 {
                ack(&client, server, 1).await;
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        });

        let outcome = tokio::time::timeout(Duration::from_millis(400), engine)
            .await
            .expect("stale ACKs kept the session alive");
        assert!(matches!(
            outcome.unwrap(),
            Err(TftpError::Timeout { block: 2, retries: 0 })
        ));
        flood.abort();
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_closes_stream_with_timeout() {
        for config in [
            SessionConfig::new(Duration::from_millis(50), 1),
            SessionConfig::new(Duration::from_millis(100), 3),
        ] {
            let Harness {
                client,
                engine,
                mut writer,
                ..
            } = start(config).await;
            let producer = tokio::spawn(async move {
                writer.write(vec![0u8; 512]).await.unwrap();
                // Blocks until the session gives up and closes its end
                writer.write(vec![0u8; 512]).await.unwrap();
                writer.write(vec![0u8; 512]).await
            });

            for _ in 0..=config.max_retries {
                assert_eq!(recv_data(&client).await.0, 1);
            }

            match engine.await.unwrap() {
                Err(TftpError::Timeout { block, retries }) => {
                    assert_eq!(block, 1);
                    assert_eq!(retries, config.max_retries);
                }
                other => panic!("expected timeout, got {:?}", other),
            }
            let err = producer.await.unwrap().unwrap_err();
            assert!(err.message().contains("Timed out"));
        }
    }

    #[tokio::test]
    async fn handler_error_becomes_error_packet() {
        let Harness {
            client,
            engine,
            writer,
            ..
        } = start(SessionConfig::default()).await;
        writer
            .close_with_error(PipeError::new(ErrorCode::FileNotFound, "File not found: x.bin"))
            .await;

        assert_eq!(
            Packet::decode(&recv_raw(&client).await).unwrap(),
            Packet::error(ErrorCode::FileNotFound, "File not found: x.bin")
        );
        assert!(matches!(
            engine.await.unwrap(),
            Err(TftpError::HandlerFailure(_))
        ));
    }

    #[tokio::test]
    async fn peer_error_aborts_and_closes_stream() {
        let Harness {
            client,
            server,
            engine,
            mut writer,
        } = start(SessionConfig::default()).await;
        let producer = tokio::spawn(async move {
            writer.write(vec![0u8; 512]).await.unwrap();
            writer.write(vec![0u8; 512]).await.unwrap();
            writer.write(vec![0u8; 512]).await
        });

        recv_data(&client).await;
        client
            .send_to(
                &Packet::error(ErrorCode::DiskFull, "client disk full").encode(),
                server,
            )
            .await
            .unwrap();

        assert!(matches!(
            engine.await.unwrap(),
            Err(TftpError::PeerError { .. })
        ));
        let err = producer.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::DiskFull);
        assert_eq!(err.message(), "client disk full");
    }
}
