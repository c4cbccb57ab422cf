use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use log::warn;
use rusqlite::{params, Connection, OptionalExtension};

/// Attempts made by [`MailStore::commit_with_retry`] before giving up.
const COMMIT_RETRY_ATTEMPTS: u32 = 3;

/// Terminal (and initial) states of a sync-run audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRunStatus {
    Started,
    Completed,
    CompletedNoChanges,
    CompletedNoNewHeaders,
    Skipped,
    Interrupted,
    Error,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Started => "STARTED",
            SyncRunStatus::Completed => "COMPLETED",
            SyncRunStatus::CompletedNoChanges => "COMPLETED_NO_CHANGES",
            SyncRunStatus::CompletedNoNewHeaders => "COMPLETED_NO_NEW_HEADERS",
            SyncRunStatus::Skipped => "SKIPPED",
            SyncRunStatus::Interrupted => "INTERRUPTED",
            SyncRunStatus::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncRunRow {
    pub id: i64,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: String,
    pub message: Option<String>,
}

/// SQLite-backed record store: header rows, full raw messages with derived
/// attributes, deduplicated attachment blobs, checkpoint state, and the
/// sync-run audit log. All writes from the engine land in one long-lived
/// transaction that is flushed through [`MailStore::commit_with_retry`].
pub struct MailStore {
    conn: Connection,
}

impl MailStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {:?}", db_path))?;

        let store = MailStore { conn };
        store.apply_pragmas()?;
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = MailStore { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;
             PRAGMA cache_size=-50000;",
        )?;
        Ok(())
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS headers (
                uid INTEGER NOT NULL,
                mailbox TEXT NOT NULL,
                msg_from TEXT,
                msg_to TEXT,
                msg_cc TEXT,
                subject TEXT,
                msg_date TEXT,
                PRIMARY KEY(uid, mailbox)
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_headers_mailbox ON headers(mailbox)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_headers_date ON headers(msg_date)",
            [],
        )?;

        // Derived message attributes are VIRTUAL generated columns so they can
        // never drift from the raw bytes they are computed from.
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS full_messages (
                uid INTEGER NOT NULL,
                mailbox TEXT NOT NULL,
                raw_message BLOB NOT NULL,
                fetched_at TEXT NOT NULL,
                has_attachments BOOLEAN GENERATED ALWAYS AS (
                    instr(raw_message, 'Content-Disposition: attachment') > 0
                    OR instr(raw_message, 'Content-Type: image/') > 0
                    OR instr(raw_message, 'Content-Type: application/') > 0
                    OR instr(raw_message, 'Content-Type: audio/') > 0
                    OR instr(raw_message, 'Content-Type: video/') > 0
                    OR (instr(raw_message, 'Content-Disposition: inline') > 0
                        AND instr(raw_message, 'filename=') > 0)
                ) VIRTUAL,
                size_kb INTEGER GENERATED ALWAYS AS (
                    length(raw_message) / 1024
                ) VIRTUAL,
                is_html BOOLEAN GENERATED ALWAYS AS (
                    instr(raw_message, 'Content-Type: text/html') > 0
                ) VIRTUAL,
                is_plain_text BOOLEAN GENERATED ALWAYS AS (
                    instr(raw_message, 'Content-Type: text/plain') > 0
                ) VIRTUAL,
                has_images BOOLEAN GENERATED ALWAYS AS (
                    instr(raw_message, 'Content-Type: image/') > 0
                ) VIRTUAL,
                in_reply_to TEXT GENERATED ALWAYS AS (
                    CASE
                        WHEN instr(raw_message, 'In-Reply-To: ') > 0
                        THEN substr(
                            raw_message,
                            instr(raw_message, 'In-Reply-To: ') + 13,
                            instr(substr(raw_message, instr(raw_message, 'In-Reply-To: ') + 13), CHAR(10)) - 1
                        )
                        ELSE NULL
                    END
                ) VIRTUAL,
                message_id TEXT GENERATED ALWAYS AS (
                    CASE
                        WHEN instr(raw_message, 'Message-ID: ') > 0
                        THEN substr(
                            raw_message,
                            instr(raw_message, 'Message-ID: ') + 12,
                            instr(substr(raw_message, instr(raw_message, 'Message-ID: ') + 12), CHAR(10)) - 1
                        )
                        ELSE NULL
                    END
                ) VIRTUAL,
                PRIMARY KEY(uid, mailbox)
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_full_messages_mailbox ON full_messages(mailbox)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_full_messages_has_attachments
             ON full_messages(has_attachments)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_full_messages_message_id ON full_messages(message_id)",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS attachment_blobs (
                sha256 TEXT PRIMARY KEY,
                content BLOB NOT NULL,
                size INTEGER NOT NULL,
                fetched_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS attachment_mappings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uid INTEGER NOT NULL,
                mailbox TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                filename TEXT,
                fetched_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (sha256) REFERENCES attachment_blobs(sha256),
                UNIQUE(uid, mailbox, sha256, filename)
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_attachment_mappings_uid_mailbox
             ON attachment_mappings(uid, mailbox)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_attachment_mappings_sha256
             ON attachment_mappings(sha256)",
            [],
        )?;

        self.conn.execute(
            "CREATE VIEW IF NOT EXISTS attachment_info AS
             SELECT
                 am.id, am.uid, am.mailbox, am.filename,
                 ab.size, ab.sha256, am.fetched_at,
                 h.msg_date, h.msg_from, h.msg_to, h.subject
             FROM attachment_mappings am
             JOIN attachment_blobs ab ON am.sha256 = ab.sha256
             JOIN headers h ON am.uid = h.uid AND am.mailbox = h.mailbox",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoint_states (
                mode TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                last_uid INTEGER DEFAULT 0,
                in_progress INTEGER DEFAULT 0,
                timestamp TEXT,
                PRIMARY KEY (mode, mailbox)
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoint_failed_uids (
                mode TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                retry_count INTEGER DEFAULT 1,
                PRIMARY KEY (mode, mailbox, uid)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_runs (
                id INTEGER PRIMARY KEY,
                start_time TEXT,
                end_time TEXT,
                status TEXT,
                message TEXT
            )",
            [],
        )?;

        Ok(())
    }

    // --- Transaction control ---

    /// Opens the engine's long-lived transaction. No-op if one is already
    /// active.
    pub fn begin(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// Commits the open transaction with bounded retry and linear backoff,
    /// then opens a fresh one. Returns false (instead of an error) when the
    /// final attempt still fails; callers check the result where data-loss
    /// matters. True when nothing was staged.
    pub fn commit_with_retry(&self) -> bool {
        if self.conn.is_autocommit() {
            return true;
        }
        for attempt in 1..=COMMIT_RETRY_ATTEMPTS {
            match self.conn.execute_batch("COMMIT") {
                Ok(()) => {
                    let _ = self.conn.execute_batch("BEGIN");
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Commit attempt {}/{} failed: {}",
                        attempt, COMMIT_RETRY_ATTEMPTS, e
                    );
                    if attempt < COMMIT_RETRY_ATTEMPTS {
                        thread::sleep(Duration::from_millis(100 * attempt as u64));
                    }
                }
            }
        }
        false
    }

    /// Commits anything still staged and closes the connection.
    pub fn close(self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .context("Failed to close database")?;
        Ok(())
    }

    // --- Header and full-message records ---

    pub fn upsert_header(
        &self,
        uid: u32,
        mailbox: &str,
        from: &str,
        to: &str,
        cc: &str,
        subject: &str,
        date: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO headers (uid, mailbox, msg_from, msg_to, msg_cc, subject, msg_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![uid, mailbox, from, to, cc, subject, date],
        )?;
        Ok(())
    }

    pub fn upsert_full_message(
        &self,
        uid: u32,
        mailbox: &str,
        raw_message: &[u8],
        fetched_at: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO full_messages (uid, mailbox, raw_message, fetched_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![uid, mailbox, raw_message, fetched_at],
        )?;
        Ok(())
    }

    pub fn max_header_uid(&self, mailbox: &str) -> Result<u32> {
        let max: Option<u32> = self.conn.query_row(
            "SELECT MAX(uid) FROM headers WHERE mailbox = ?1",
            params![mailbox],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    pub fn header_uids(&self, mailbox: &str) -> Result<Vec<u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT uid FROM headers WHERE mailbox = ?1 ORDER BY uid")?;
        let uids = stmt
            .query_map(params![mailbox], |row| row.get(0))?
            .collect::<Result<Vec<u32>, _>>()?;
        Ok(uids)
    }

    pub fn full_message_uids(&self, mailbox: &str) -> Result<HashSet<u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT uid FROM full_messages WHERE mailbox = ?1")?;
        let uids = stmt
            .query_map(params![mailbox], |row| row.get(0))?
            .collect::<Result<HashSet<u32>, _>>()?;
        Ok(uids)
    }

    pub fn header_count(&self, mailbox: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM headers WHERE mailbox = ?1",
            params![mailbox],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // --- Attachments ---

    /// Full messages flagged as carrying attachments that have no mapping
    /// rows yet, so repeat extraction runs only touch new messages.
    pub fn full_messages_needing_attachment_scan(
        &self,
        mailbox: &str,
    ) -> Result<Vec<(u32, String, Vec<u8>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT fm.uid, fm.mailbox, fm.raw_message
             FROM full_messages fm
             WHERE fm.mailbox = ?1
               AND fm.has_attachments = 1
               AND NOT EXISTS (
                   SELECT 1 FROM attachment_mappings am
                   WHERE am.uid = fm.uid AND am.mailbox = fm.mailbox
               )
             ORDER BY fm.uid",
        )?;
        let rows = stmt
            .query_map(params![mailbox], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert_blob_if_absent(&self, sha256: &str, content: &[u8], size: usize) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO attachment_blobs (sha256, content, size) VALUES (?1, ?2, ?3)",
            params![sha256, content, size as i64],
        )?;
        Ok(())
    }

    pub fn insert_mapping_if_absent(
        &self,
        uid: u32,
        mailbox: &str,
        sha256: &str,
        filename: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO attachment_mappings (uid, mailbox, sha256, filename)
             VALUES (?1, ?2, ?3, ?4)",
            params![uid, mailbox, sha256, filename],
        )?;
        Ok(())
    }

    pub fn unique_blob_count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM attachment_blobs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn mapping_count(&self, mailbox: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM attachment_mappings WHERE mailbox = ?1",
            params![mailbox],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn mappings_for_blob(&self, sha256: &str) -> Result<Vec<(u32, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, mailbox, filename FROM attachment_mappings WHERE sha256 = ?1",
        )?;
        let rows = stmt
            .query_map(params![sha256], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Checkpoint state ---

    pub fn load_checkpoint_state(
        &self,
        mode: &str,
        mailbox: &str,
    ) -> Result<Option<(u32, bool, Option<String>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT last_uid, in_progress, timestamp FROM checkpoint_states
                 WHERE mode = ?1 AND mailbox = ?2",
                params![mode, mailbox],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, i64>(1)? != 0,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn save_checkpoint_state(
        &self,
        mode: &str,
        mailbox: &str,
        last_uid: u32,
        in_progress: bool,
        timestamp: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO checkpoint_states (mode, mailbox, last_uid, in_progress, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![mode, mailbox, last_uid, in_progress as i64, timestamp],
        )?;
        Ok(())
    }

    pub fn load_failed_uids(&self, mode: &str, mailbox: &str) -> Result<HashMap<u32, u32>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, retry_count FROM checkpoint_failed_uids WHERE mode = ?1 AND mailbox = ?2",
        )?;
        let map = stmt
            .query_map(params![mode, mailbox], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<HashMap<u32, u32>, _>>()?;
        Ok(map)
    }

    pub fn upsert_failed_uid(
        &self,
        mode: &str,
        mailbox: &str,
        uid: u32,
        retry_count: u32,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO checkpoint_failed_uids (mode, mailbox, uid, retry_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![mode, mailbox, uid, retry_count],
        )?;
        Ok(())
    }

    pub fn remove_failed_uid(&self, mode: &str, mailbox: &str, uid: u32) -> Result<()> {
        self.conn.execute(
            "DELETE FROM checkpoint_failed_uids WHERE mode = ?1 AND mailbox = ?2 AND uid = ?3",
            params![mode, mailbox, uid],
        )?;
        Ok(())
    }

    // --- Sync-run audit log ---

    pub fn log_sync_start(&self, message: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_runs (start_time, status, message) VALUES (?1, ?2, ?3)",
            params![
                Local::now().to_rfc3339(),
                SyncRunStatus::Started.as_str(),
                message
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn log_sync_end(&self, run_id: i64, status: SyncRunStatus, message: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_runs SET end_time = ?1, status = ?2, message = ?3 WHERE id = ?4",
            params![Local::now().to_rfc3339(), status.as_str(), message, run_id],
        )?;
        Ok(())
    }

    pub fn recent_sync_runs(&self, limit: usize) -> Result<Vec<SyncRunRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, start_time, end_time, status, message FROM sync_runs
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(SyncRunRow {
                    id: row.get(0)?,
                    start_time: row.get(1)?,
                    end_time: row.get(2)?,
                    status: row.get(3)?,
                    message: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
