use std::collections::HashMap;

use anyhow::Result;
use chrono::Local;

use crate::database::MailStore;

/// Sync modes keep independent checkpoint rows per mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Headers,
    Full,
    Attachments,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Headers => "headers",
            SyncMode::Full => "full",
            SyncMode::Attachments => "attachments",
        }
    }
}

/// Durable progress state for one (mode, mailbox) pair: the highest
/// contiguously-confirmed UID, the failed-UID retry counts, and the
/// in-progress crash marker. The manager is the only writer of these rows;
/// persistence errors propagate to the caller (commit retry lives in the
/// store, not here).
pub struct CheckpointManager<'a> {
    store: &'a MailStore,
    mode: SyncMode,
    mailbox: String,
    last_uid: u32,
    failed_uids: HashMap<u32, u32>,
    in_progress: bool,
    loaded: bool,
    updates_since_save: u32,
    save_interval: u32,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(store: &'a MailStore, mode: SyncMode, mailbox: &str, save_interval: u32) -> Self {
        Self {
            store,
            mode,
            mailbox: mailbox.to_string(),
            last_uid: 0,
            failed_uids: HashMap::new(),
            in_progress: false,
            loaded: false,
            updates_since_save: 0,
            save_interval: save_interval.max(1),
        }
    }

    /// Rebinds the manager to a different mailbox, invalidating the cached
    /// state so the next access loads fresh rows.
    pub fn set_mailbox(&mut self, mailbox: &str) -> Result<()> {
        self.mailbox = mailbox.to_string();
        self.loaded = false;
        self.ensure_loaded()
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        match self
            .store
            .load_checkpoint_state(self.mode.as_str(), &self.mailbox)?
        {
            Some((last_uid, in_progress, _timestamp)) => {
                self.last_uid = last_uid;
                self.in_progress = in_progress;
            }
            None => {
                self.last_uid = 0;
                self.in_progress = false;
            }
        }
        self.failed_uids = self
            .store
            .load_failed_uids(self.mode.as_str(), &self.mailbox)?;
        self.loaded = true;
        Ok(())
    }

    /// Writes the core state row (last_uid, in_progress, timestamp).
    pub fn save_state(&mut self) -> Result<()> {
        self.ensure_loaded()?;
        self.store.save_checkpoint_state(
            self.mode.as_str(),
            &self.mailbox,
            self.last_uid,
            self.in_progress,
            &Local::now().to_rfc3339(),
        )?;
        self.updates_since_save = 0;
        Ok(())
    }

    pub fn mark_start(&mut self) -> Result<()> {
        self.ensure_loaded()?;
        self.in_progress = true;
        self.save_state()
    }

    pub fn mark_complete(&mut self) -> Result<()> {
        self.ensure_loaded()?;
        self.in_progress = false;
        self.save_state()
    }

    /// True when a previous run left its in-progress marker set. Diagnostic
    /// only; resume is driven by last_uid and the failed set.
    pub fn was_interrupted(&mut self) -> Result<bool> {
        self.ensure_loaded()?;
        Ok(self.in_progress)
    }

    pub fn last_uid(&mut self) -> Result<u32> {
        self.ensure_loaded()?;
        Ok(self.last_uid)
    }

    /// Advances last_uid when `uid` is beyond it; smaller or equal UIDs are a
    /// no-op. State is written only every Nth update to bound write
    /// amplification; callers still force `save_state` at run boundaries.
    pub fn update_progress(&mut self, uid: u32) -> Result<()> {
        self.ensure_loaded()?;
        if uid > self.last_uid {
            self.last_uid = uid;
            self.updates_since_save += 1;
            if self.updates_since_save >= self.save_interval {
                self.save_state()?;
            }
        }
        Ok(())
    }

    /// Records one more failure for `uid` (retry_count starts at 1) and
    /// persists immediately.
    pub fn add_failed_uid(&mut self, uid: u32) -> Result<()> {
        self.ensure_loaded()?;
        let count = self.failed_uids.get(&uid).copied().unwrap_or(0) + 1;
        self.failed_uids.insert(uid, count);
        self.store
            .upsert_failed_uid(self.mode.as_str(), &self.mailbox, uid, count)?;
        Ok(())
    }

    /// Drops the failed entry after a successful retry. No write when the UID
    /// was never marked failed.
    pub fn clear_failed_uid(&mut self, uid: u32) -> Result<()> {
        self.ensure_loaded()?;
        if self.failed_uids.remove(&uid).is_some() {
            self.store
                .remove_failed_uid(self.mode.as_str(), &self.mailbox, uid)?;
        }
        Ok(())
    }

    /// Failed UIDs still inside the retry budget, ascending.
    pub fn uids_to_retry(&mut self, max_retries: u32) -> Result<Vec<u32>> {
        self.ensure_loaded()?;
        let mut uids: Vec<u32> = self
            .failed_uids
            .iter()
            .filter(|(_, &count)| count < max_retries)
            .map(|(&uid, _)| uid)
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Failed UIDs that exhausted the retry budget. Surfaced for operator
    /// visibility, never auto-retried.
    pub fn permanently_failed_uids(&mut self, max_retries: u32) -> Result<Vec<u32>> {
        self.ensure_loaded()?;
        let mut uids: Vec<u32> = self
            .failed_uids
            .iter()
            .filter(|(_, &count)| count >= max_retries)
            .map(|(&uid, _)| uid)
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(store: &MailStore) -> CheckpointManager<'_> {
        CheckpointManager::new(store, SyncMode::Headers, "INBOX", 250)
    }

    #[test]
    fn defaults_when_no_state_exists() {
        let store = MailStore::open_in_memory().unwrap();
        let mut cp = manager(&store);
        assert_eq!(cp.last_uid().unwrap(), 0);
        assert!(!cp.was_interrupted().unwrap());
        assert!(cp.uids_to_retry(3).unwrap().is_empty());
    }

    #[test]
    fn update_progress_never_regresses() {
        let store = MailStore::open_in_memory().unwrap();
        let mut cp = manager(&store);
        cp.update_progress(10).unwrap();
        assert_eq!(cp.last_uid().unwrap(), 10);
        cp.update_progress(9).unwrap();
        assert_eq!(cp.last_uid().unwrap(), 10);
        cp.update_progress(10).unwrap();
        assert_eq!(cp.last_uid().unwrap(), 10);
        cp.update_progress(11).unwrap();
        assert_eq!(cp.last_uid().unwrap(), 11);
    }

    #[test]
    fn progress_persists_at_save_interval() {
        let store = MailStore::open_in_memory().unwrap();
        let mut cp = CheckpointManager::new(&store, SyncMode::Headers, "INBOX", 3);
        cp.update_progress(1).unwrap();
        cp.update_progress(2).unwrap();
        // Two updates, interval of three: nothing written yet.
        assert!(store.load_checkpoint_state("headers", "INBOX").unwrap().is_none());
        cp.update_progress(3).unwrap();
        let (last_uid, _, _) = store
            .load_checkpoint_state("headers", "INBOX")
            .unwrap()
            .unwrap();
        assert_eq!(last_uid, 3);
    }

    #[test]
    fn retry_budget_partitions_failed_uids() {
        let store = MailStore::open_in_memory().unwrap();
        let mut cp = manager(&store);
        // UID 5 fails once, UID 7 fails three times.
        cp.add_failed_uid(5).unwrap();
        for _ in 0..3 {
            cp.add_failed_uid(7).unwrap();
        }
        assert_eq!(cp.uids_to_retry(3).unwrap(), vec![5]);
        assert_eq!(cp.permanently_failed_uids(3).unwrap(), vec![7]);
    }

    #[test]
    fn clear_failed_uid_removes_entry() {
        let store = MailStore::open_in_memory().unwrap();
        let mut cp = manager(&store);
        cp.add_failed_uid(12).unwrap();
        cp.clear_failed_uid(12).unwrap();
        // Clearing an absent UID is a no-op.
        cp.clear_failed_uid(12).unwrap();
        assert!(cp.uids_to_retry(3).unwrap().is_empty());
        assert!(cp.permanently_failed_uids(3).unwrap().is_empty());
        assert!(store.load_failed_uids("headers", "INBOX").unwrap().is_empty());
    }

    #[test]
    fn failure_counts_survive_reload() {
        let store = MailStore::open_in_memory().unwrap();
        {
            let mut cp = manager(&store);
            cp.add_failed_uid(42).unwrap();
            cp.add_failed_uid(42).unwrap();
        }
        let mut fresh = manager(&store);
        assert_eq!(fresh.uids_to_retry(3).unwrap(), vec![42]);
        fresh.add_failed_uid(42).unwrap();
        assert_eq!(fresh.permanently_failed_uids(3).unwrap(), vec![42]);
    }

    #[test]
    fn mark_start_and_complete_flip_crash_marker() {
        let store = MailStore::open_in_memory().unwrap();
        {
            let mut cp = manager(&store);
            cp.mark_start().unwrap();
        }
        // A fresh manager simulates the next process observing the marker.
        let mut next = manager(&store);
        assert!(next.was_interrupted().unwrap());
        next.mark_complete().unwrap();
        let mut after = manager(&store);
        assert!(!after.was_interrupted().unwrap());
    }

    #[test]
    fn rebind_invalidates_cached_state() {
        let store = MailStore::open_in_memory().unwrap();
        let mut cp = manager(&store);
        cp.update_progress(50).unwrap();
        cp.save_state().unwrap();

        cp.set_mailbox("Archive").unwrap();
        assert_eq!(cp.last_uid().unwrap(), 0);

        cp.set_mailbox("INBOX").unwrap();
        assert_eq!(cp.last_uid().unwrap(), 50);
    }
}
