//! Configuration types for couchsync.
//!
//! This module provides the [`ReplicationConfig`] struct holding the local
//! database location, the default remote, and the batch tuning of pull and
//! push replication. Configuration is persisted as TOML (typically at
//! `~/.config/couchsync/config.toml` on Unix systems).
//!
//! # Example
//!
//! ```ignore
//! use couchsync_core::config::ReplicationConfig;
//!
//! let mut config = ReplicationConfig::load()?;
//! config.push.attachment_inline = AttachmentInline::Always;
//! config.save()?;
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Path of the local SQLite database
    pub database: PathBuf,

    /// Default remote database URL, e.g. `http://localhost:5984/notes`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    /// Pull replication tuning
    pub pull: PullSettings,

    /// Push replication tuning
    pub push: PushSettings,
}

/// Batch tuning for remote-to-local replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullSettings {
    /// Changes requested from the remote feed per batch
    pub change_limit_per_batch: usize,
    /// Upper bound on batches processed in one run
    pub batch_limit_per_run: usize,
    /// Documents fetched and inserted per local transaction
    pub insert_batch_size: usize,
    /// Request attachment bodies inline with the revision JSON
    pub pull_attachments_inline: bool,
    /// Size of the pool fetching revision histories in parallel
    pub worker_threads: usize,
    /// Optional server-side filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<PullFilter>,
}

/// Batch tuning for local-to-remote replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    /// Local changes read per batch
    pub change_limit_per_batch: usize,
    /// Upper bound on batches processed in one run
    pub batch_limit_per_run: usize,
    /// Documents sent per `_bulk_docs` request
    pub bulk_insert_size: usize,
    /// When attachments are embedded in the revision JSON
    pub attachment_inline: AttachmentInline,
    /// Size limit for [`AttachmentInline::Small`], in bytes
    pub small_attachment_threshold: u64,
}

/// Named server-side filter for the pull changes feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullFilter {
    /// Filter name, `design_doc/filter_name`
    pub name: String,
    /// Query parameters passed to the filter
    #[serde(default)]
    pub params: std::collections::BTreeMap<String, String>,
}

/// Policy for embedding attachments in pushed revisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentInline {
    /// Always base64 inline
    Always,
    /// Always multipart
    Never,
    /// Inline below the size threshold, multipart otherwise
    #[default]
    Small,
}

impl AttachmentInline {
    /// Whether an attachment of `length` bytes goes inline.
    pub fn should_inline(self, length: u64, threshold: u64) -> bool {
        match self {
            AttachmentInline::Always => true,
            AttachmentInline::Never => false,
            AttachmentInline::Small => length < threshold,
        }
    }
}

impl Default for PullSettings {
    fn default() -> Self {
        Self {
            change_limit_per_batch: 1000,
            batch_limit_per_run: 100,
            insert_batch_size: 100,
            pull_attachments_inline: false,
            worker_threads: 4,
            filter: None,
        }
    }
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            change_limit_per_batch: 500,
            batch_limit_per_run: 100,
            bulk_insert_size: 10,
            attachment_inline: AttachmentInline::Small,
            small_attachment_threshold: 64 * 1024,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        let database = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("couchsync")
            .join("couchsync.db");

        Self {
            database,
            remote: None,
            pull: PullSettings::default(),
            push: PushSettings::default(),
        }
    }
}

impl ReplicationConfig {
    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("couchsync").join("config.toml"))
    }

    /// Load config from default location, or return default if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = Self::config_path()
            && path.exists()
        {
            return Self::load_from(&path);
        }
        Ok(Self::default())
    }

    /// Load config from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ReplicationConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or(SyncError::NoConfigDir)?;
        self.save_to(&path)
    }

    /// Save config to a specific file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject zero-sized batches and pools.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("pull.change_limit_per_batch", self.pull.change_limit_per_batch),
            ("pull.batch_limit_per_run", self.pull.batch_limit_per_run),
            ("pull.insert_batch_size", self.pull.insert_batch_size),
            ("pull.worker_threads", self.pull.worker_threads),
            ("push.change_limit_per_batch", self.push.change_limit_per_batch),
            ("push.batch_limit_per_run", self.push.batch_limit_per_run),
            ("push.bulk_insert_size", self.push.bulk_insert_size),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);

        match zero {
            Some((field, _)) => Err(SyncError::InvalidArgument(format!(
                "{field} must be greater than zero"
            ))),
            None => Ok(()),
        }
    }
}
