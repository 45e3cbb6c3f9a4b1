//! TCP transport with length-prefixed frames.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes.
//! A destination-ward instance opens one connection per send. A source-ward
//! instance binds its endpoint the first time it is polled and buffers
//! every frame that arrives until `receive` takes it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dcomm_core::{DcommError, DcommResult, Envelope};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::{Direction, Transport, TransportInfo, TransportOptions};

lazy_static! {
    static ref TCP_PAT: Regex =
        Regex::new(r"^tcp://(\[[0-9A-Fa-f:.]+\]|[^\s:/\[\]]+):(\d{1,5})/?$").expect("valid regex");
}

pub(crate) const INFO: TransportInfo = TransportInfo {
    name: "tcp",
    example: "tcp://host:port",
    matches: is_tcp,
    build,
    is_path: false,
};

fn is_tcp(uri: &str) -> bool {
    TCP_PAT.is_match(uri)
}

fn build(uri: &str, direction: Direction, options: &TransportOptions) -> DcommResult<Arc<dyn Transport>> {
    Ok(Arc::new(TcpTransport::new(uri, direction, options.max_message_size)?))
}

type Inbox = Arc<Mutex<VecDeque<(String, Vec<u8>)>>>;

struct Listening {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

pub struct TcpTransport {
    uri: String,
    addr: String,
    direction: Direction,
    max_message_size: usize,
    inbox: Inbox,
    listener: OnceCell<Listening>,
}

impl TcpTransport {
    pub fn new(uri: &str, direction: Direction, max_message_size: usize) -> DcommResult<Self> {
        let caps = TCP_PAT
            .captures(uri)
            .ok_or_else(|| DcommError::Transport(format!("\"{uri}\" is not a tcp://host:port URI")))?;
        let host = caps[1].trim_start_matches('[').trim_end_matches(']');
        let port: u16 = caps[2]
            .parse()
            .map_err(|_| DcommError::Transport(format!("Port out of range in \"{uri}\"")))?;
        let addr = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Ok(Self {
            uri: uri.to_string(),
            addr,
            direction,
            max_message_size,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            listener: OnceCell::new(),
        })
    }

    /// Bind the listening socket if this is the owner's side.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn listen(&self) -> DcommResult<SocketAddr> {
        if self.direction != Direction::Srcward {
            return Err(DcommError::Transport(format!(
                "Only the receiving side of {} listens",
                self.uri
            )));
        }
        let listening = self
            .listener
            .get_or_try_init(|| async {
                let listener = TcpListener::bind(&self.addr)
                    .await
                    .map_err(|e| DcommError::Transport(format!("Failed to bind {}: {}", self.addr, e)))?;
                let local_addr = listener
                    .local_addr()
                    .map_err(|e| DcommError::Transport(format!("Failed to bind {}: {}", self.addr, e)))?;
                tracing::info!(addr = %local_addr, "TCP transport listening");
                let task = tokio::spawn(accept_loop(listener, self.inbox.clone(), self.max_message_size));
                Ok::<_, DcommError>(Listening { local_addr, task })
            })
            .await?;
        Ok(listening.local_addr)
    }

    fn take(&self, filter: Option<&str>) -> Option<Vec<u8>> {
        let mut inbox = self.inbox.lock();
        let pos = inbox
            .iter()
            .position(|(id, _)| filter.map_or(true, |prefix| id.starts_with(prefix)))?;
        inbox.remove(pos).map(|(_, bytes)| bytes)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(listening) = self.listener.get() {
            listening.task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, inbox: Inbox, max_message_size: usize) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(peer = %peer, "New connection");
                let inbox = inbox.clone();
                tokio::spawn(async move {
                    if let Err(e) = read_connection(stream, inbox, max_message_size).await {
                        tracing::warn!(peer = %peer, error = %e, "Connection dropped");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept error");
            }
        }
    }
}

async fn read_connection(mut stream: TcpStream, inbox: Inbox, max_message_size: usize) -> DcommResult<()> {
    while let Some(frame) = read_frame(&mut stream, max_message_size).await? {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(id = %id, bytes = frame.len(), "Received frame");
        inbox.lock().push_back((id, frame));
    }
    tracing::debug!("Client disconnected");
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, max_message_size: usize) -> DcommResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DcommError::Transport(format!("Read error: {}", e))),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_message_size {
        return Err(DcommError::Transport(format!(
            "Message too large: {} > {}",
            len, max_message_size
        )));
    }

    let mut msg_buf = vec![0u8; len];
    reader
        .read_exact(&mut msg_buf)
        .await
        .map_err(|e| DcommError::Transport(format!("Read error: {}", e)))?;
    Ok(Some(msg_buf))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_message_size: usize) -> DcommResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_message_size {
        return Err(DcommError::Transport(format!(
            "Message too large: {} > {}",
            payload.len(),
            max_message_size
        )));
    }
    let len = payload.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| DcommError::Transport(format!("Write error: {}", e)))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| DcommError::Transport(format!("Write error: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| DcommError::Transport(format!("Flush error: {}", e)))?;
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    fn endpoint(&self) -> &str {
        &self.uri
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn send(&self, payload: &[u8], _dest_hint: Option<&str>) -> DcommResult<String> {
        if self.direction == Direction::Srcward {
            return Err(DcommError::Transport(format!(
                "{} has no return channel; replies need an explicit endpoint",
                self.uri
            )));
        }
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| DcommError::Transport(format!("Failed to connect to {}: {}", self.addr, e)))?;
        write_frame(&mut stream, payload, self.max_message_size).await?;
        let _ = stream.shutdown().await;
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(id = %id, addr = %self.addr, bytes = payload.len(), "Sent frame");
        Ok(id)
    }

    async fn receive(&self, filter: Option<&str>) -> DcommResult<Option<Envelope>> {
        if self.direction == Direction::Destward {
            return Ok(None);
        }
        self.listen().await?;
        Ok(self.take(filter).map(Envelope::new))
    }

    async fn peek(&self, filter: Option<&str>) -> DcommResult<bool> {
        if self.direction == Direction::Destward {
            return Ok(false);
        }
        self.listen().await?;
        Ok(self
            .inbox
            .lock()
            .iter()
            .any(|(id, _)| filter.map_or(true, |prefix| id.starts_with(prefix))))
    }
}
