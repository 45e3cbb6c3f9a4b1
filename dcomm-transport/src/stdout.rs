//! Send-only transport that prints each message on its own line.

use std::sync::Arc;

use async_trait::async_trait;
use dcomm_core::{DcommError, DcommResult, Envelope};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{Direction, Transport, TransportInfo, TransportOptions};

pub(crate) const INFO: TransportInfo = TransportInfo {
    name: "stdout",
    example: "stdout",
    matches: is_stdout,
    build,
    is_path: false,
};

fn is_stdout(uri: &str) -> bool {
    matches!(uri, "stdout" | "stdout://" | "-")
}

fn build(uri: &str, direction: Direction, _options: &TransportOptions) -> DcommResult<Arc<dyn Transport>> {
    Ok(Arc::new(StdoutTransport::new(uri, direction)))
}

pub struct StdoutTransport {
    uri: String,
    direction: Direction,
}

impl StdoutTransport {
    pub fn new(uri: &str, direction: Direction) -> Self {
        Self {
            uri: uri.to_string(),
            direction,
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, payload: &[u8]) -> DcommResult<()> {
    out.write_all(payload)
        .await
        .map_err(|e| DcommError::Transport(format!("Write error: {}", e)))?;
    out.write_all(b"\n")
        .await
        .map_err(|e| DcommError::Transport(format!("Write error: {}", e)))?;
    out.flush()
        .await
        .map_err(|e| DcommError::Transport(format!("Flush error: {}", e)))
}

#[async_trait]
impl Transport for StdoutTransport {
    fn endpoint(&self) -> &str {
        &self.uri
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn send(&self, payload: &[u8], _dest_hint: Option<&str>) -> DcommResult<String> {
        write_line(&mut tokio::io::stdout(), payload).await?;
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn receive(&self, _filter: Option<&str>) -> DcommResult<Option<Envelope>> {
        Ok(None)
    }

    async fn peek(&self, _filter: Option<&str>) -> DcommResult<bool> {
        Ok(false)
    }
}
