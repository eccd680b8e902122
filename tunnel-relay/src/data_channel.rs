//! # TCP Data-Channel Manager (relay side)
//!
//! Handles the auth frame on a freshly opened TCP data-channel socket
//! (`spec §4.1`, §4.5), validates the carried `AgentId` against the
//! session registry, closes any pre-existing data channel for that
//! agent, then runs the reader/writer halves that feed frames to and
//! from each connection's per-port proxy handler.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnel_protocol::frame::{self, FrameParser, AUTH_FRAME_LEN};

use crate::connection::ConnectionOwner;
use crate::error::RelayError;
use crate::session::SessionRegistry;

/// Bound on the outbound (relay → agent) frame queue. A stalled or slow
/// agent fills this and `send_frame` starts blocking its caller, which in
/// turn pauses that caller's upstream socket read — the back-pressure
/// path required by `spec §4.5`/§9 for the relay→agent direction.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// The live TCP data channel for one agent: a sender the per-port proxy
/// handlers use to push outbound frames, backed by a writer task that
/// owns the socket's write half and a reader task that demultiplexes
/// inbound frames to the matching connection record.
pub struct TcpDataChannelHandle {
    outbound_tx: mpsc::Sender<Bytes>,
    generation: u64,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl TcpDataChannelHandle {
    /// Queues a pre-encoded frame for delivery to the agent. Multiple
    /// per-port proxy tasks hold a clone of this handle's sender; they
    /// serialize on the channel rather than the socket directly
    /// (`spec §5`). Blocks while the queue is full, propagating
    /// back-pressure to the caller's own upstream reader.
    pub async fn send_frame(&self, frame: Bytes) -> bool {
        self.outbound_tx.send(frame).await.is_ok()
    }
}

impl Drop for TcpDataChannelHandle {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// Handles a socket that the port-ingress router classified as a TCP
/// data-channel candidate by its `0xFD 0x01` prefix.
pub async fn accept(mut stream: TcpStream, sessions: Arc<SessionRegistry>) {
    let mut auth_buf = [0u8; AUTH_FRAME_LEN];
    if stream.read_exact(&mut auth_buf).await.is_err() {
        return;
    }

    let Some(agent_id) = frame::parse_auth_frame(&auth_buf) else {
        warn!(error = %RelayError::DataChannelAuthFailed, "data channel auth frame malformed");
        let _ = stream.write_all(&[frame::AUTH_REJECT]).await;
        return;
    };

    let Some(session) = sessions.get(&agent_id) else {
        warn!(%agent_id, error = %RelayError::DataChannelAuthFailed, "data channel auth for unknown/unauthenticated agent");
        let _ = stream.write_all(&[frame::AUTH_REJECT]).await;
        return;
    };

    if stream.write_all(&[frame::AUTH_ACCEPT]).await.is_err() {
        return;
    }
    info!(%agent_id, "TCP data channel authenticated");

    let generation = session.bump_data_channel_generation();
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_CAPACITY);

    let writer_task = tokio::spawn(run_writer(write_half, outbound_rx));
    let reader_session = session.clone();
    let reader_task = tokio::spawn(async move {
        run_reader(read_half, reader_session, generation).await;
    });

    let handle = Arc::new(TcpDataChannelHandle {
        outbound_tx,
        generation,
        reader_task,
        writer_task,
    });
    // Replacing drops (and aborts) any previous data channel for this agent.
    let _ = session.replace_data_channel(Some(handle));
}

async fn run_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
}

async fn run_reader(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    session: Arc<crate::session::AgentSession>,
    generation: u64,
) {
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        parser.feed(&buf[..n]);
        loop {
            match parser.next_frame() {
                Ok(Some((conn_id, payload))) => {
                    let Some(record) = session.connections.get(&conn_id) else {
                        debug!(%conn_id, "data frame for unknown/closed connection, dropping");
                        continue;
                    };
                    if let ConnectionOwner::Tcp { to_external, .. } = &record.owner {
                        record.touch();
                        // A full channel here is the connection exerting
                        // backpressure; awaiting it pauses this reader and
                        // thus the entire agent multiplex (spec §4.5, §5).
                        if to_external.send(payload).await.is_err() {
                            debug!(%conn_id, "external socket gone, dropping inbound frame");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "malformed data frame, closing data channel");
                    session.clear_data_channel_if_current(generation);
                    return;
                }
            }
        }
    }
    session.clear_data_channel_if_current(generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::{TcpListener, TcpStream};
    use tunnel_protocol::AgentId;

    #[tokio::test]
    async fn rejects_auth_for_unknown_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sessions = Arc::new(SessionRegistry::new());

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            accept(socket, sessions).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frame = frame::encode_auth_frame(&AgentId::new());
        client.write_all(&frame).await.unwrap();
        let mut status = [0u8; 1];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status[0], frame::AUTH_REJECT);
        server.await.unwrap();
    }
}
