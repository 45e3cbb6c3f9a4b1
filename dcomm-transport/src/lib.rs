//! # dcomm-transport
//!
//! Transports move raw message bytes between agents. Every transport offers
//! the same three operations (`send`, `receive`, `peek`); which one handles a
//! given endpoint URI is decided by [`TransportRegistry::load`].
//!
//! ## Example
//!
//! ```no_run
//! use dcomm_transport::{Direction, TransportRegistry};
//!
//! # async fn example() -> dcomm_core::DcommResult<()> {
//! let registry = TransportRegistry::builtin();
//! let outbound = registry.load("ram://relay", Direction::Destward)?;
//! let inbound = registry.load("ram://relay", Direction::Srcward)?;
//!
//! outbound.send(b"{\"hello\": 1}", None).await?;
//! let env = inbound.receive(None).await?.expect("queued");
//! println!("got {}", env);
//! # Ok(())
//! # }
//! ```

pub mod folder;
pub mod ram;
pub mod stdout;
pub mod tcp;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dcomm_core::{DcommError, DcommResult, Envelope, MAX_MESSAGE_SIZE};

pub use folder::FolderTransport;
pub use ram::RamTransport;
pub use stdout::StdoutTransport;
pub use tcp::TcpTransport;

/// Which end of a logical pipe a transport instance sits on.
///
/// A destination-ward instance writes toward the agent that owns the
/// endpoint and reads what that agent sends back. A source-ward instance is
/// the owning agent's view: it reads what arrives and writes replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Destward,
    Srcward,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Self::Destward => Self::Srcward,
            Self::Srcward => Self::Destward,
        }
    }
}

/// Uniform send/receive contract.
///
/// Implementations guard their own storage; callers never need to
/// serialize access. No call blocks waiting for a message to show up:
/// an empty queue is `Ok(None)`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// URI this instance was loaded from.
    fn endpoint(&self) -> &str;

    fn direction(&self) -> Direction;

    /// Deliver `payload`. Returns the id the message was stored under.
    async fn send(&self, payload: &[u8], dest_hint: Option<&str>) -> DcommResult<String>;

    /// Take one message, optionally only one whose id starts with `filter`.
    async fn receive(&self, filter: Option<&str>) -> DcommResult<Option<Envelope>>;

    /// Whether `receive(filter)` would currently find something.
    async fn peek(&self, filter: Option<&str>) -> DcommResult<bool>;
}

/// Settings shared by every transport the registry builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub max_message_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

type Builder = fn(&str, Direction, &TransportOptions) -> DcommResult<Arc<dyn Transport>>;

/// A transport kind the registry knows how to build.
#[derive(Clone)]
pub struct TransportInfo {
    pub name: &'static str,
    pub example: &'static str,
    pub matches: fn(&str) -> bool,
    pub build: Builder,
    /// Filesystem matchers accept almost anything, so they are tried last.
    pub is_path: bool,
}

impl std::fmt::Debug for TransportInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportInfo")
            .field("name", &self.name)
            .field("example", &self.example)
            .finish()
    }
}

/// Explicit table of transport kinds. Built once, then only read.
#[derive(Debug, Clone)]
pub struct TransportRegistry {
    entries: Vec<TransportInfo>,
    options: TransportOptions,
}

impl TransportRegistry {
    /// Empty registry.
    pub fn new(options: TransportOptions) -> Self {
        Self {
            entries: Vec::new(),
            options,
        }
    }

    /// Every transport shipped with this crate.
    pub fn builtin() -> Self {
        Self::builtin_with(TransportOptions::default())
    }

    pub fn builtin_with(options: TransportOptions) -> Self {
        Self::new(options)
            .register(ram::INFO)
            .register(tcp::INFO)
            .register(stdout::INFO)
            .register(folder::INFO)
    }

    pub fn register(mut self, info: TransportInfo) -> Self {
        self.entries.push(info);
        self
    }

    pub fn entries(&self) -> &[TransportInfo] {
        &self.entries
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Build the transport for `uri`.
    ///
    /// Non-path matchers are tried in registration order before any path
    /// matcher. When nothing matches the error lists the accepted forms, and
    /// says so when the URI looks like a folder that does not exist.
    pub fn load(&self, uri: &str, direction: Direction) -> DcommResult<Arc<dyn Transport>> {
        let ordered = self
            .entries
            .iter()
            .filter(|e| !e.is_path)
            .chain(self.entries.iter().filter(|e| e.is_path));
        for entry in ordered {
            if (entry.matches)(uri) {
                tracing::debug!(transport = entry.name, uri, ?direction, "Loading transport");
                return (entry.build)(uri, direction, &self.options);
            }
        }

        let forms = self
            .entries
            .iter()
            .map(|e| format!("{} ({})", e.example, e.name))
            .collect::<Vec<_>>()
            .join(", ");
        let hint = if looks_like_path(uri) {
            " It looks like a filesystem path; make sure the folder exists."
        } else {
            ""
        };
        Err(DcommError::Transport(format!(
            "Can't find a transport that matches \"{uri}\". Expected one of: {forms}.{hint}"
        )))
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn looks_like_path(uri: &str) -> bool {
    uri.starts_with('/')
        || uri.starts_with('~')
        || uri.starts_with('.')
        || uri.starts_with("file://")
        || uri.contains(std::path::MAIN_SEPARATOR)
}

/// Expand a leading `~` and strip a `file://` scheme.
pub fn expand_path(uri: &str) -> PathBuf {
    let uri = uri.strip_prefix("file://").unwrap_or(uri);
    if let Some(rest) = uri.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches(['/', '\\']));
        }
    }
    PathBuf::from(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_prefers_specific_matchers() {
        let registry = TransportRegistry::builtin();
        let t = registry.load("ram://reg-test", Direction::Destward).unwrap();
        assert_eq!(t.endpoint(), "ram://reg-test");
        let t = registry.load("stdout", Direction::Destward).unwrap();
        assert_eq!(t.endpoint(), "stdout");
    }

    #[test]
    fn registry_loads_existing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TransportRegistry::builtin();
        let uri = dir.path().to_string_lossy().to_string();
        let t = registry.load(&uri, Direction::Srcward).unwrap();
        assert_eq!(t.direction(), Direction::Srcward);
    }

    #[test]
    fn missing_folder_gets_a_hint() {
        let registry = TransportRegistry::builtin();
        let err = registry
            .load("/definitely/not/here/dcomm", Direction::Destward)
            .err()
            .unwrap();
        let text = err.to_string();
        assert!(text.contains("Can't find a transport that matches"));
        assert!(text.contains("filesystem path"));

        let err = registry.load("smtp://x", Direction::Destward).err().unwrap();
        assert!(!err.to_string().contains("filesystem path"));
        assert!(err.to_string().contains("ram://"));
    }

    #[test]
    fn tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/queue"), home.join("queue"));
        }
        assert_eq!(expand_path("file:///tmp/q"), PathBuf::from("/tmp/q"));
    }

    #[test]
    fn direction_flip() {
        assert_eq!(Direction::Destward.flipped(), Direction::Srcward);
    }
}
