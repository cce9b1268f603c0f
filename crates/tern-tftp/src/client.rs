//! Minimal RFC 1350 client for fetching and storing single files

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::error::{Result, TftpError};
use crate::netascii;
use crate::packet::{BLOCK_SIZE, MAX_PACKET_SIZE, Packet, TransferMode};
use crate::session::{SessionConfig, TransferStats, reject_stranger};

pub struct TftpClient {
    server: SocketAddr,
    mode: TransferMode,
    config: SessionConfig,
}

impl TftpClient {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            mode: TransferMode::Octet,
            config: SessionConfig::default(),
        }
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Download `filename` and return its contents.
    pub async fn get(&self, filename: &str) -> Result<Bytes> {
        let mut exchange = Exchange::open(self.server).await?;
        let result = self.fetch(&mut exchange, filename).await;
        if let Err(e) = &result {
            exchange.abort(e).await;
        }

        let data = result?;
        info!(bytes = data.len(), "Downloaded {} from {}", filename, self.server);
        Ok(match self.mode {
            TransferMode::Netascii => Bytes::from(netascii::decode(&data)),
            _ => data,
        })
    }

    /// Upload `data` as `filename`.
    pub async fn put(&self, filename: &str, data: impl Into<Bytes>) -> Result<TransferStats> {
        let data = data.into();
        let data = match self.mode {
            TransferMode::Netascii => Bytes::from(netascii::encode(&data)),
            _ => data,
        };

        let mut exchange = Exchange::open(self.server).await?;
        let result = self.store(&mut exchange, filename, &data).await;
        if let Err(e) = &result {
            exchange.abort(e).await;
        }

        let stats = result?;
        info!(blocks = stats.blocks, bytes = stats.bytes, "Uploaded {} to {}", filename, self.server);
        Ok(stats)
    }

    async fn fetch(&self, exchange: &mut Exchange, filename: &str) -> Result<Bytes> {
        let mut data = BytesMut::new();
        let mut expected: u16 = 1;

        let mut last = Packet::Rrq {
            filename: filename.to_string(),
            mode: self.mode.as_str().to_string(),
        }
        .encode();
        exchange.send(&last).await?;

        let mut retries = 0;
        let mut deadline = self.config.deadline();

        loop {
            let Some(packet) = exchange.recv_until(deadline).await? else {
                if retries >= self.config.max_retries {
                    return Err(TftpError::Timeout {
                        block: expected,
                        retries,
                    });
                }
                retries += 1;
                debug!(block = expected, retries, "Timeout waiting for DATA, retransmitting");
                exchange.send(&last).await?;
                deadline = self.config.deadline();
                continue;
            };

            match packet {
                Packet::Data { block, payload } if block == expected => {
                    data.extend_from_slice(&payload);
                    last = Packet::Ack { block }.encode();
                    exchange.send(&last).await?;

                    if payload.len() < BLOCK_SIZE {
                        return Ok(data.freeze());
                    }
                    expected = expected.wrapping_add(1);
                    retries = 0;
                    deadline = self.config.deadline();
                }
                Packet::Data { block, .. } if block == expected.wrapping_sub(1) => {
                    debug!(block, "Duplicate DATA, re-sending ACK");
                    exchange.send(&Packet::Ack { block }.encode()).await?;
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
                        "Unexpected {:?} packet during download",
                        other.opcode()
                    )));
                }
            }
        }
    }

    async fn store(
        &self,
        exchange: &mut Exchange,
        filename: &str,
        data: &[u8],
    ) -> Result<TransferStats> {
        let request = Packet::Wrq {
            filename: filename.to_string(),
            mode: self.mode.as_str().to_string(),
        }
        .encode();
        exchange.send(&request).await?;
        self.wait_for_ack(exchange, 0, &request).await?;

        let mut stats = TransferStats::default();
        // Always one block more than full blocks, so the last one is short or empty
        let count = data.len() / BLOCK_SIZE + 1;

        for index in 0..count {
            let start = index * BLOCK_SIZE;
            let end = (start + BLOCK_SIZE).min(data.len());
            let block = (index + 1) as u16;

            let datagram = Packet::Data {
                block,
                payload: Bytes::copy_from_slice(&data[start..end]),
            }
            .encode();
            exchange.send(&datagram).await?;
            self.wait_for_ack(exchange, block, &datagram).await?;

            stats.blocks += 1;
            stats.bytes += (end - start) as u64;
        }

        Ok(stats)
    }

    async fn wait_for_ack(&self, exchange: &mut Exchange, block: u16, datagram: &[u8]) -> Result<()> {
        let mut retries = 0;
        let mut deadline = self.config.deadline();

        loop {
            let Some(packet) = exchange.recv_until(deadline).await? else {
                if retries >= self.config.max_retries {
                    return Err(TftpError::Timeout { block, retries });
                }
                retries += 1;
                debug!(block, retries, "Timeout waiting for ACK, retransmitting");
                exchange.send(datagram).await?;
                deadline = self.config.deadline();
                continue;
            };

            match packet {
                Packet::Ack { block: acked } if acked == block => return Ok(()),
                Packet::Ack { block: acked } => {
                    debug!(acked, block, "Ignoring ACK for another block");
                }
                Packet::Error { code, message } => {
                    return Err(TftpError::PeerError { code, message });
                }
                other => {
                    return Err(TftpError::ProtocolViolation(format!(
                        "Unexpected {:?} packet during upload",
                        other.opcode()
                    )));
                }
            }
        }
    }
}

/// Client side of one transfer. The server answers from a fresh port, so the
/// peer is only known after the first reply.
struct Exchange {
    socket: UdpSocket,
    server: SocketAddr,
    peer: Option<SocketAddr>,
    buf: Vec<u8>,
}

impl Exchange {
    async fn open(server: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        Ok(Self {
            socket: UdpSocket::bind(local).await?,
            server,
            peer: None,
            buf: vec![0u8; MAX_PACKET_SIZE + 1],
        })
    }

    async fn send(&self, datagram: &[u8]) -> Result<()> {
        self.socket
            .send_to(datagram, self.peer.unwrap_or(self.server))
            .await?;
        Ok(())
    }

    async fn recv_until(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        loop {
            let (size, from) = match timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await
            {
                Ok(received) => received?,
                Err(_) => return Ok(None),
            };

            let locked = self.peer;
            match locked {
                None if from.ip() == self.server.ip() => {
                    debug!(%from, "Server transfer ID locked");
                    self.peer = Some(from);
                }
                None => {
                    warn!(%from, "Ignoring datagram from unexpected host");
                    continue;
                }
                Some(peer) if peer != from => {
                    warn!(%peer, "{}", TftpError::UnknownTransferId(from));
                    reject_stranger(&self.socket, from).await;
                    continue;
                }
                Some(_) => {}
            }

            match Packet::decode(&self.buf[..size]) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => warn!("Dropping datagram from {}: {}", from, e),
            }
        }
    }

    async fn abort(&self, err: &TftpError) {
        let (Some(peer), Some((code, message))) = (self.peer, err.wire_error()) else {
            return;
        };
        let datagram = Packet::error(code, message).encode();
        if let Err(e) = self.socket.send_to(&datagram, peer).await {
            debug!("Failed to send ERROR to {}: {}", peer, e);
        }
    }
}
