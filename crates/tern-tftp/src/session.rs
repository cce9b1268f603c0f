//! Per-transfer UDP endpoint and retransmission settings

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::error::{Result, TftpError};
use crate::packet::{MAX_PACKET_SIZE, Packet};

pub const DEFAULT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retransmission timer and retry budget applied to every in-flight packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time to wait for the peer before retransmitting
    pub timeout_ms: u64,
    /// Retransmissions of one packet before the session is aborted
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl SessionConfig {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            max_retries,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub(crate) fn deadline(&self) -> Instant {
        Instant::now() + self.timeout()
    }
}

/// Byte and block counts of a finished transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub blocks: u64,
    pub bytes: u64,
}

/// Ephemeral socket owned by exactly one session.
///
/// RFC 1350 §4: the transfer ID is this socket's port plus the peer's address
/// and port. Datagrams from any other source are answered with
/// `ERROR{UnknownTid}` and never surface as session traffic.
pub struct TransferSocket {
    socket: UdpSocket,
    peer: SocketAddr,
    buf: Vec<u8>,
}

impl TransferSocket {
    /// Bind a fresh OS-assigned port on `local_ip` for a transfer with `peer`.
    pub async fn bind(local_ip: IpAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
        Ok(Self::new(socket, peer))
    }

    pub fn new(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            // One spare byte so an oversized DATA is seen as malformed, not truncated
            buf: vec![0u8; MAX_PACKET_SIZE + 1],
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        self.send_raw(&packet.encode()).await
    }

    /// Send pre-encoded bytes, so a retransmission is byte-identical.
    pub async fn send_raw(&self, datagram: &[u8]) -> Result<()> {
        self.socket.send_to(datagram, self.peer).await?;
        Ok(())
    }

    /// Wait for the next packet from the session peer.
    ///
    /// Returns `Ok(None)` once `deadline` passes. Foreign and malformed
    /// datagrams are dropped without moving the deadline.
    pub async fn recv_until(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        loop {
            let (size, from) = match timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await
            {
                Ok(received) => received?,
                Err(_) => return Ok(None),
            };

            if from != self.peer {
                warn!(peer = %self.peer, "{}", TftpError::UnknownTransferId(from));
                reject_stranger(&self.socket, from).await;
                continue;
            }

            match Packet::decode(&self.buf[..size]) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => warn!("Dropping datagram from {}: {}", from, e),
            }
        }
    }

    /// Best-effort ERROR to the peer for a session that is about to abort.
    pub(crate) async fn send_abort(&self, err: &TftpError) {
        let Some((code, message)) = err.wire_error() else {
            return;
        };
        if let Err(e) = self.send(&Packet::error(code, message)).await {
            debug!("Failed to send ERROR to {}: {}", self.peer, e);
        }
    }
}

/// Answer a datagram whose source is not the session peer with `ERROR{UnknownTid}`.
///
/// The session itself carries on untouched.
pub(crate) async fn reject_stranger(socket: &UdpSocket, from: SocketAddr) {
    let Some((code, message)) = TftpError::UnknownTransferId(from).wire_error() else {
        return;
    };
    if let Err(e) = socket.send_to(&Packet::error(code, message).encode(), from).await {
        debug!("Failed to answer unknown transfer ID {}: {}", from, e);
    }
}
