//! Request dispatcher on the well-known port

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::handler::{TransferHandler, TransferRequest};
use crate::packet::{ErrorCode, MAX_PACKET_SIZE, Packet, TransferMode};
use crate::pipe::pipe;
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::session::{SessionConfig, TransferSocket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Read => "read",
            RequestKind::Write => "write",
        }
    }
}

pub struct TftpServer {
    bind_addr: SocketAddr,
    handler: Arc<dyn TransferHandler>,
    session: SessionConfig,
    log: Option<Dispatch>,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl TftpServer {
    pub fn new(bind_addr: SocketAddr, handler: Arc<dyn TransferHandler>) -> Self {
        Self {
            bind_addr,
            handler,
            session: SessionConfig::default(),
            log: None,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Route the server's diagnostics, including every session and handler
    /// task it spawns, to `dispatch` instead of the caller's default subscriber.
    pub fn with_log(mut self, dispatch: Dispatch) -> Self {
        self.log = Some(dispatch);
        self
    }

    /// Cancelling this token stops the listener; active sessions run to completion.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Only a failure to bind is fatal; per-request and per-session failures
    /// are logged and never end the loop.
    pub async fn run(&self) -> Result<()> {
        let socket = UdpSocket::bind(self.bind_addr).await?;
        self.serve(socket).await
    }

    /// Serve on an already bound listening socket.
    pub async fn serve(&self, socket: UdpSocket) -> Result<()> {
        match &self.log {
            Some(dispatch) => self.listen(socket).with_subscriber(dispatch.clone()).await,
            None => self.listen(socket).await,
        }
    }

    async fn listen(&self, socket: UdpSocket) -> Result<()> {
        let local_addr = socket.local_addr()?;
        info!("TFTP server listening on {}", local_addr);

        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let (size, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Error receiving TFTP packet: {}", e);
                        continue;
                    }
                },
            };

            match Packet::decode(&buf[..size]) {
                Ok(Packet::Rrq { filename, mode }) => {
                    self.accept(RequestKind::Read, filename, &mode, peer, local_addr.ip())
                        .await;
                }
                Ok(Packet::Wrq { filename, mode }) => {
                    self.accept(RequestKind::Write, filename, &mode, peer, local_addr.ip())
                        .await;
                }
                Ok(other) => {
                    // Session traffic belongs on the per-transfer sockets
                    debug!("Ignoring {:?} from {} on the listening socket", other.opcode(), peer);
                }
                Err(e) => warn!("Dropping request from {}: {}", peer, e),
            }
        }

        info!(
            active = self.sessions.len(),
            "TFTP server stopping, waiting for active sessions"
        );
        self.sessions.close();
        self.sessions.wait().await;
        Ok(())
    }

    async fn accept(
        &self,
        kind: RequestKind,
        filename: String,
        mode: &str,
        peer: SocketAddr,
        local_ip: IpAddr,
    ) {
        let mode = match mode.parse::<TransferMode>() {
            Ok(TransferMode::Mail) => {
                warn!("MAIL mode requested from {}: obsolete and not supported", peer);
                send_error(local_ip, peer, ErrorCode::IllegalOperation, "MAIL mode not supported")
                    .await;
                return;
            }
            Ok(mode) => mode,
            Err(e) => {
                warn!("Rejecting request from {}: {}", peer, e);
                send_error(local_ip, peer, ErrorCode::IllegalOperation, &e.to_string()).await;
                return;
            }
        };

        // RFC 1350: Each transfer uses a new TID
        let socket = match TransferSocket::bind(local_ip, peer).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Could not start transmission for {}: {}", peer, e);
                return;
            }
        };

        let span = info_span!(
            "session",
            id = %Uuid::new_v4(),
            %peer,
            kind = kind.as_str(),
            filename = %filename,
        );
        if let Ok(addr) = socket.local_addr() {
            info!(parent: &span, port = addr.port(), %mode, "Transfer accepted");
        }

        let request = TransferRequest {
            filename,
            mode,
            peer,
        };
        let handler = self.handler.clone();
        let config = self.session;
        let (writer, reader) = pipe();

        match kind {
            RequestKind::Read => {
                self.sessions.spawn(
                    async move { handler.produce(request, writer).await }
                        .instrument(span.clone())
                        .with_current_subscriber(),
                );
                self.sessions.spawn(
                    async move {
                        let _ = Sender::new(socket, reader, config).run().await;
                    }
                    .instrument(span)
                    .with_current_subscriber(),
                );
            }
            RequestKind::Write => {
                self.sessions.spawn(
                    async move { handler.consume(request, reader).await }
                        .instrument(span.clone())
                        .with_current_subscriber(),
                );
                self.sessions.spawn(
                    async move {
                        let _ = Receiver::new(socket, writer, config).run().await;
                    }
                    .instrument(span)
                    .with_current_subscriber(),
                );
            }
        }
    }
}

/// Refuse a request from a throwaway socket, so no session is created.
async fn send_error(local_ip: IpAddr, peer: SocketAddr, code: ErrorCode, message: &str) {
    let result = async {
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
        socket
            .send_to(&Packet::error(code, message).encode(), peer)
            .await?;
        Ok::<_, std::io::Error>(())
    }
    .await;

    match result {
        Ok(()) => debug!("Sent ERROR packet to {}: code={}, msg={}", peer, code, message),
        Err(e) => warn!("Failed to send ERROR packet to {}: {}", peer, e),
    }
}
