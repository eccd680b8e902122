//! # Port-Ingress Router
//!
//! The relay exposes a single TCP listener on the advertised control port
//! in passive-accept mode: no immediate read, just peek (`spec §4.3`).
//! Connections opening with the `0xFD 0x01` auth-frame prefix go straight
//! to the TCP data-channel manager; everything else is handed, bytes
//! intact, to the axum HTTP/WebSocket server via [`ChannelListener`]. An
//! independent UDP socket bound to the same port number feeds the UDP
//! data-channel manager.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::warn;
use tunnel_protocol::frame;

use crate::data_channel;
use crate::session::SessionRegistry;
use std::sync::Arc;

/// How long to wait for at least 2 bytes to classify a freshly accepted
/// socket before defaulting it to the HTTP/WebSocket path.
const CLASSIFY_DEADLINE: Duration = Duration::from_secs(5);

/// An `axum::serve::Listener` fed by the ingress router rather than
/// accepting directly: sockets classified as HTTP/WebSocket arrive over
/// an internal channel, with their already-peeked bytes left unconsumed.
pub struct ChannelListener {
    rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    local_addr: SocketAddr,
}

impl ChannelListener {
    pub fn new(rx: mpsc::Receiver<(TcpStream, SocketAddr)>, local_addr: SocketAddr) -> Self {
        Self { rx, local_addr }
    }
}

impl axum::serve::Listener for ChannelListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(pair) => pair,
            // The ingress task is gone; there is nothing left to accept.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Runs the control port's TCP accept loop, classifying each connection
/// and routing it to the data-channel manager or the HTTP channel.
pub async fn run_tcp(
    listener: TcpListener,
    sessions: Arc<SessionRegistry>,
    http_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
) {
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "control port accept error");
                continue;
            }
        };
        let sessions = sessions.clone();
        let http_tx = http_tx.clone();
        tokio::spawn(classify_and_route(socket, peer_addr, sessions, http_tx));
    }
}

async fn classify_and_route(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    sessions: Arc<SessionRegistry>,
    http_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
) {
    let mut peek_buf = [0u8; 2];
    let deadline = tokio::time::Instant::now() + CLASSIFY_DEADLINE;
    loop {
        match socket.peek(&mut peek_buf).await {
            Ok(n) if n >= 2 => break,
            Ok(_) => {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(_) => return,
        }
    }

    if peek_buf == frame::AUTH_FRAME_PREFIX {
        data_channel::accept(socket, sessions).await;
    } else {
        let _ = http_tx.send((socket, peer_addr)).await;
    }
}
