//! # TCP Data-Channel Client (agent side)
//!
//! Opens the mandatory framed TCP data channel to the relay's single
//! control port (`spec §4.6`): connect, send the `0xFD 0x01` auth frame,
//! read the one-byte accept/reject reply, then run reader/writer halves
//! symmetric to the relay's own `data_channel` module.

use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tunnel_protocol::frame::{self, FrameParser};
use tunnel_protocol::AgentId;

use crate::connection::ConnectionTable;
use crate::error::AgentError;

/// Bound on the outbound (agent → relay) frame queue. A stalled relay
/// fills this and `send_frame` starts blocking its caller, pausing that
/// caller's upstream local-socket read (`spec §4.5`/§9).
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub struct TcpDataChannelHandle {
    outbound_tx: mpsc::Sender<Bytes>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl TcpDataChannelHandle {
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

/// Connects to `addr`, authenticates as `agent_id`, and brings up the
/// reader/writer tasks that bridge frames to/from `connections`.
pub async fn connect(
    addr: &str,
    agent_id: AgentId,
    connections: Arc<ConnectionTable>,
) -> Result<TcpDataChannelHandle, AgentError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(AgentError::PeerIoError)?;

    let auth_frame = frame::encode_auth_frame(&agent_id);
    stream
        .write_all(&auth_frame)
        .await
        .map_err(AgentError::PeerIoError)?;

    let mut status = [0u8; 1];
    stream
        .read_exact(&mut status)
        .await
        .map_err(AgentError::PeerIoError)?;
    if status[0] != frame::AUTH_ACCEPT {
        return Err(AgentError::DataChannelAuthFailed);
    }

    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_CAPACITY);

    let writer_task = tokio::spawn(run_writer(write_half, outbound_rx));
    let reader_task = tokio::spawn(run_reader(read_half, connections));

    Ok(TcpDataChannelHandle {
        outbound_tx,
        reader_task,
        writer_task,
    })
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

async fn run_reader(mut read_half: tokio::net::tcp::OwnedReadHalf, connections: Arc<ConnectionTable>) {
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
                    let Some(conn) = connections.get(&conn_id) else {
                        debug!(%conn_id, "data frame for unknown/closed connection, dropping");
                        continue;
                    };
                    conn.touch();
                    // A full channel here is the local bridge exerting
                    // back-pressure; awaiting it pauses this reader and thus
                    // the whole data channel (spec §4.5, §9).
                    if conn.to_local.send(payload).await.is_err() {
                        debug!(%conn_id, "local bridge gone, dropping inbound frame");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "malformed data frame from relay, closing data channel");
                    return;
                }
            }
        }
    }
}
