pub mod hub;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::protocol::Message;
use hub::{ClientHandle, Hub, HubHandle, Outbound};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// How long a closing connection may keep flushing frames already queued.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Frames buffered per client before it is evicted as too slow.
    pub queue_capacity: usize,
    /// Longest accepted inbound line, in bytes, newline excluded.
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

// ─── Server ─────────────────────────────────────────────────────────────────

/// TCP front end: one newline-delimited JSON stream per client, every inbound
/// message fanned out through the hub.
pub struct Server {
    config: ServerConfig,
    hub: HubHandle,
}

impl Server {
    /// Must be called from within a tokio runtime; spawns the hub.
    pub fn new(config: ServerConfig) -> Self {
        let (hub, hub_task) = Hub::spawn();
        tokio::spawn(watch_hub(hub_task));
        Self { config, hub }
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening");
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (conn, peer) = listener.accept().await?;
            let srv = self.clone();
            tokio::spawn(srv.serve_conn(conn, peer));
        }
    }

    async fn serve_conn(self: Arc<Self>, conn: TcpStream, peer: SocketAddr) {
        let (handle, outbound) = ClientHandle::new(self.config.queue_capacity);
        let id = handle.id();

        if self.hub.register(handle).is_err() {
            error!(%peer, "hub stopped, refusing connection");
            return;
        }
        debug!(client = %id, %peer, "connection accepted");

        let (reader, writer) = conn.into_split();
        let mut write_pump = tokio::spawn(write_pump(writer, outbound));

        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let pump_done = loop {
            tokio::select! {
                frame = read_frame(&mut reader, &mut buf, self.config.max_frame_len) => match frame {
                    Ok(Inbound::Frame) => {
                        if buf.trim_ascii().is_empty() {
                            continue;
                        }
                        match Message::decode(&buf) {
                            Ok(msg) => {
                                if self.hub.broadcast(msg).is_err() {
                                    break false;
                                }
                            }
                            Err(e) => warn!(client = %id, error = %e, "dropping malformed frame"),
                        }
                    }
                    Ok(Inbound::TooLarge) => {
                        warn!(client = %id, limit = self.config.max_frame_len, "frame too large, closing");
                        break false;
                    }
                    Ok(Inbound::Eof) => break false,
                    Err(e) => {
                        debug!(client = %id, error = %e, "read failed");
                        break false;
                    }
                },
                // queue closed by the hub, or the peer stopped accepting writes
                _ = &mut write_pump => break true,
            }
        };

        // Unregistering drops the hub's sender, so the pump ends once it has
        // flushed whatever was already queued.
        self.hub.unregister(id).ok();
        if !pump_done && timeout(DRAIN_TIMEOUT, &mut write_pump).await.is_err() {
            debug!(client = %id, "drain timed out");
            write_pump.abort();
        }
        info!(client = %id, %peer, "connection closed");
    }
}

enum Inbound {
    Frame,
    TooLarge,
    Eof,
}

/// Reads one newline-terminated frame into `buf`, giving up once more than
/// `max_len` bytes arrive without a newline.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max_len: usize) -> io::Result<Inbound>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = (max_len as u64).saturating_add(1);
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Inbound::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        return Ok(Inbound::Frame);
    }
    if buf.len() > max_len {
        return Ok(Inbound::TooLarge);
    }
    // final frame without a trailing newline
    Ok(Inbound::Frame)
}

/// Logs the hub task's fate. Returns false if it panicked or was cancelled.
async fn watch_hub(task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "hub task failed, new connections will be refused");
            false
        }
    }
}

/// Drains the outbound queue to the socket until the hub closes it.
async fn write_pump(mut writer: OwnedWriteHalf, mut outbound: Outbound) {
    while let Some(frame) = outbound.recv().await {
        if writer.write_all(&frame).await.is_err() || writer.write_all(b"\n").await.is_err() {
            break;
        }
    }
    writer.shutdown().await.ok();
    debug!(client = %outbound.id(), "write pump ended");
}
