//! Folder transport: each message is one file in a shared directory.
//!
//! Messages travelling toward the folder's owner end in `.in`; replies end
//! in `.out`. Files are written under a hidden temporary name and renamed
//! into place, so a reader never sees a half-written message. A reader claims
//! a file by renaming it to a hidden name before reading it, so two readers
//! can never both take the same message.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use dcomm_core::{DcommError, DcommResult, Envelope};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{expand_path, Direction, Transport, TransportInfo, TransportOptions};

const INBOUND_EXT: &str = ".in";
const OUTBOUND_EXT: &str = ".out";

pub(crate) const INFO: TransportInfo = TransportInfo {
    name: "folder",
    example: "~/.dcomm/queue",
    matches: is_folder,
    build,
    is_path: true,
};

fn is_folder(uri: &str) -> bool {
    expand_path(uri).is_dir()
}

fn build(uri: &str, direction: Direction, _options: &TransportOptions) -> DcommResult<Arc<dyn Transport>> {
    Ok(Arc::new(FolderTransport::new(uri, direction)?))
}

/// A directory used as a pair of message queues.
pub struct FolderTransport {
    uri: String,
    folder: PathBuf,
    direction: Direction,
    /// Serializes claim-renames among users of this instance.
    claim_lock: Mutex<()>,
}

impl FolderTransport {
    pub fn new(uri: &str, direction: Direction) -> DcommResult<Self> {
        let folder = expand_path(uri);
        if !folder.is_dir() {
            return Err(DcommError::Transport(format!(
                "\"{}\" is not an existing folder",
                folder.display()
            )));
        }
        Ok(Self {
            uri: uri.to_string(),
            folder,
            direction,
            claim_lock: Mutex::new(()),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn write_ext(&self) -> &'static str {
        match self.direction {
            Direction::Destward => INBOUND_EXT,
            Direction::Srcward => OUTBOUND_EXT,
        }
    }

    fn read_ext(&self) -> &'static str {
        match self.direction {
            Direction::Destward => OUTBOUND_EXT,
            Direction::Srcward => INBOUND_EXT,
        }
    }

    /// Visible files with our read extension, oldest first.
    async fn candidates(&self, filter: Option<&str>) -> DcommResult<Vec<(String, PathBuf)>> {
        let ext = self.read_ext();
        let mut entries = tokio::fs::read_dir(&self.folder)
            .await
            .map_err(|e| DcommError::Transport(format!("Failed to list {}: {e}", self.folder.display())))?;

        let mut found: Vec<(SystemTime, String, PathBuf)> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DcommError::Transport(format!("Failed to list {}: {e}", self.folder.display())))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let Some(id) = name.strip_suffix(ext) else {
                continue;
            };
            if let Some(prefix) = filter {
                if !id.starts_with(prefix) {
                    continue;
                }
            }
            // Entries can vanish between listing and stat when another reader claims them.
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, id.to_string(), entry.path()));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(found.into_iter().map(|(_, id, path)| (id, path)).collect())
    }

    async fn claim(&self, filter: Option<&str>) -> DcommResult<Option<(String, PathBuf, PathBuf)>> {
        let _guard = self.claim_lock.lock().await;
        for (id, path) in self.candidates(filter).await? {
            let claimed = self.folder.join(format!(".{id}.claim"));
            match tokio::fs::rename(&path, &claimed).await {
                Ok(()) => return Ok(Some((id, path, claimed))),
                // Someone else got there first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(DcommError::Transport(format!(
                        "Failed to claim {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for FolderTransport {
    fn endpoint(&self) -> &str {
        &self.uri
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn send(&self, payload: &[u8], _dest_hint: Option<&str>) -> DcommResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let tmp = self.folder.join(format!(".{id}.tmp"));
        let target = self.folder.join(format!("{id}{}", self.write_ext()));

        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| DcommError::Transport(format!("Failed to write {}: {e}", tmp.display())))?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(DcommError::Transport(format!(
                "Failed to publish {}: {e}",
                target.display()
            )));
        }
        debug!(id = %id, folder = %self.folder.display(), bytes = payload.len(), "Wrote message");
        Ok(id)
    }

    async fn receive(&self, filter: Option<&str>) -> DcommResult<Option<Envelope>> {
        let Some((id, original, claimed)) = self.claim(filter).await? else {
            return Ok(None);
        };

        let bytes = match tokio::fs::read(&claimed).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(id = %id, error = %e, "Failed to read claimed message, releasing it");
                let _ = tokio::fs::rename(&claimed, &original).await;
                return Err(DcommError::Transport(format!(
                    "Failed to read {}: {e}",
                    original.display()
                )));
            }
        };
        if let Err(e) = tokio::fs::remove_file(&claimed).await {
            warn!(id = %id, error = %e, "Failed to remove consumed message");
        }
        debug!(id = %id, bytes = bytes.len(), "Read message");
        Ok(Some(Envelope::new(bytes)))
    }

    async fn peek(&self, filter: Option<&str>) -> DcommResult<bool> {
        Ok(!self.candidates(filter).await?.is_empty())
    }
}
