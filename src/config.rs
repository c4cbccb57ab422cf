use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Failed to create config directory")]
    CreateDirError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ImapSecurity {
    StartTLS,
    SSL,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub imap_server: String,
    pub imap_port: u16,
    pub imap_security: ImapSecurity,
    pub username: String,
    pub password: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            imap_server: "imap.example.com".to_string(),
            imap_port: 993,
            imap_security: ImapSecurity::SSL,
            username: "user@example.com".to_string(),
            password: String::new(),
        }
    }
}

/// Tunables for the sync engine and UID discovery. All fields have working
/// defaults; a config file only needs to name the ones it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// UIDs processed per batch between chunk-boundary flushes.
    pub chunk_size: usize,
    /// Items processed between store commits inside a chunk.
    pub commit_interval: usize,
    /// Progress updates between checkpoint state writes.
    pub checkpoint_save_interval: u32,
    /// Failures tolerated per UID before it is classified permanently failed.
    pub max_uid_retries: u32,
    /// Width of sequence-number ranges for chunked UID discovery.
    pub sequence_chunk_size: u32,
    /// Message count above which sequence-chunked discovery kicks in.
    pub large_mailbox_threshold: u32,
    /// First year scanned by date-chunked discovery.
    pub date_chunk_start_year: i32,
    /// Mailboxes routed straight to date-chunked discovery.
    pub date_chunked_mailboxes: Vec<String>,
    /// Mailboxes routed to sequence-chunked discovery (with date fallback).
    pub sequence_chunked_mailboxes: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            chunk_size: 250,
            commit_interval: 20,
            checkpoint_save_interval: 250,
            max_uid_retries: 3,
            sequence_chunk_size: 10_000,
            large_mailbox_threshold: 10_000,
            date_chunk_start_year: 2004,
            date_chunked_mailboxes: vec!["[Gmail]/All Mail".to_string()],
            sequence_chunked_mailboxes: vec!["[Gmail]/Mail".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    pub database_path: String,
    #[serde(default)]
    pub sync: SyncSettings,
}

impl Default for Config {
    fn default() -> Self {
        let db_path = dirs::data_dir()
            .unwrap_or_default()
            .join("mailstash")
            .join("mail.sqlite3");
        Self {
            account: AccountConfig::default(),
            database_path: db_path.to_string_lossy().into_owned(),
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);

        // If the file doesn't exist, return default config
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;

        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let path = Path::new(path);

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::CreateDirError)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}
