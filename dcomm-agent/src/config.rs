//! Agent configuration.
//!
//! Values are layered: defaults, then `<folder>/config.toml`, then `DCOMM_*`
//! environment variables, then whatever the CLI sets through the `with_*`
//! builders.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dcomm_core::{DcommError, DcommResult, MAX_MESSAGE_SIZE};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.toml";
pub const STORE_FILE: &str = "interactions.db";
pub const QUEUE_DIR: &str = "queue";
pub const QUARANTINE_DIR: &str = "quarantine";

/// What to do with a message no handler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Unroutable {
    /// Log it and throw it away.
    #[default]
    Drop,
    /// Keep the raw bytes under `<folder>/quarantine/`.
    Quarantine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Poll backoff bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 4000,
        }
    }
}

impl PollConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub retention_days: i64,
    pub cleanup_interval_hours: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_days: dcomm_core::interaction::DEFAULT_RETENTION_DAYS,
            cleanup_interval_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `dcomm_agent=debug`. `RUST_LOG` wins.
    pub level: String,
    pub format: LogFormat,
    /// Log file; relative paths live under the agent folder. Stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// State directory.
    pub folder: PathBuf,
    /// Human-readable name offered in invitations and requests.
    pub label: String,
    /// Key this agent packs and signs with, if any.
    pub verkey: Option<String>,
    /// Transport URIs to poll. Empty means `<folder>/queue`.
    pub endpoints: Vec<String>,
    pub poll: PollConfig,
    pub max_message_size: usize,
    pub store: StoreConfig,
    pub unroutable: Unroutable,
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            label: "dcomm".to_string(),
            verkey: None,
            endpoints: Vec::new(),
            poll: PollConfig::default(),
            max_message_size: MAX_MESSAGE_SIZE,
            store: StoreConfig::default(),
            unroutable: Unroutable::Drop,
            logging: LoggingConfig::default(),
        }
    }
}

/// `~/.dcomm/agent`, or a relative `.dcomm/agent` when there is no home.
pub fn default_folder() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dcomm")
        .join("agent")
}

impl AgentConfig {
    /// Config rooted at `folder`, everything else default.
    pub fn with_folder(folder: impl AsRef<Path>) -> Self {
        Self {
            folder: expand(folder.as_ref()),
            ..Default::default()
        }
    }

    /// Defaults, then `config.toml`, then the process environment.
    ///
    /// The folder comes from `folder`, else `DCOMM_FOLDER`, else the default.
    pub fn load(folder: Option<PathBuf>) -> DcommResult<Self> {
        Self::load_with_env(folder, |key| std::env::var(key).ok())
    }

    /// [`AgentConfig::load`] with an explicit environment lookup.
    pub fn load_with_env<F>(folder: Option<PathBuf>, env: F) -> DcommResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let folder = folder
            .or_else(|| env("DCOMM_FOLDER").map(PathBuf::from))
            .map(|f| expand(&f))
            .unwrap_or_else(default_folder);

        let file = folder.join(CONFIG_FILE);
        let mut config = if file.is_file() {
            let text = std::fs::read_to_string(&file)?;
            toml::from_str::<AgentConfig>(&text)
                .map_err(|e| DcommError::Config(format!("{}: {}", file.display(), e)))?
        } else {
            AgentConfig::default()
        };
        // The file lives in the folder, so the folder itself is not overridable from it.
        config.folder = folder;
        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    /// Overlay `DCOMM_*` variables.
    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(label) = env("DCOMM_LABEL").filter(|s| !s.is_empty()) {
            self.label = label;
        }
        if let Some(verkey) = env("DCOMM_VERKEY").filter(|s| !s.is_empty()) {
            self.verkey = Some(verkey);
        }
        if let Some(endpoints) = env("DCOMM_ENDPOINTS") {
            let list = split_list(&endpoints);
            if !list.is_empty() {
                self.endpoints = list;
            }
        }
        if let Some(level) = env("DCOMM_LOG").filter(|s| !s.is_empty()) {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> DcommResult<()> {
        if self.poll.initial_ms == 0 {
            return Err(DcommError::Config("poll.initial_ms must be positive".to_string()));
        }
        if self.poll.max_ms < self.poll.initial_ms {
            return Err(DcommError::Config(format!(
                "poll.max_ms ({}) is below poll.initial_ms ({})",
                self.poll.max_ms, self.poll.initial_ms
            )));
        }
        if self.max_message_size == 0 {
            return Err(DcommError::Config("max_message_size must be positive".to_string()));
        }
        if self.store.retention_days <= 0 || self.store.cleanup_interval_hours <= 0 {
            return Err(DcommError::Config(
                "store.retention_days and store.cleanup_interval_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_verkey(mut self, verkey: impl Into<String>) -> Self {
        self.verkey = Some(verkey.into());
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_poll(mut self, initial: Duration, max: Duration) -> Self {
        self.poll = PollConfig {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        };
        self
    }

    pub fn with_unroutable(mut self, policy: Unroutable) -> Self {
        self.unroutable = policy;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.logging.format = format;
        self
    }

    pub fn with_log_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.logging.file = Some(file.into());
        self
    }

    /// Transport URIs to poll, with the default queue filled in.
    pub fn resolved_endpoints(&self) -> Vec<String> {
        if self.endpoints.is_empty() {
            vec![self.queue_path().to_string_lossy().to_string()]
        } else {
            self.endpoints.clone()
        }
    }

    /// The endpoint offered to peers: the first polled one.
    pub fn public_endpoint(&self) -> Option<String> {
        self.resolved_endpoints().into_iter().next()
    }

    pub fn store_path(&self) -> PathBuf {
        self.folder.join(STORE_FILE)
    }

    pub fn queue_path(&self) -> PathBuf {
        self.folder.join(QUEUE_DIR)
    }

    pub fn quarantine_path(&self) -> PathBuf {
        self.folder.join(QUARANTINE_DIR)
    }

    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.logging.file.as_ref().map(|f| {
            if f.is_absolute() {
                f.clone()
            } else {
                self.folder.join(f)
            }
        })
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.store.retention_days)
    }

    pub fn cleanup_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.store.cleanup_interval_hours)
    }
}

fn expand(path: &Path) -> PathBuf {
    dcomm_transport::expand_path(&path.to_string_lossy())
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
