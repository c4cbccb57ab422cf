use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Local;
use log::{debug, info, warn};
use thiserror::Error;

use crate::checkpoint::{CheckpointManager, SyncMode};
use crate::config::SyncSettings;
use crate::database::{MailStore, SyncRunStatus};
use crate::discovery::UidDiscovery;
use crate::transport::{FetchKind, MailboxTransport, TransportError};

/// Audit-log messages are capped at this many characters.
const ERROR_MESSAGE_LIMIT: usize = 200;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync interrupted by operator")]
    Interrupted,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Cooperative cancellation signal, observed between UID iterations only.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub saved: usize,
    pub failed: usize,
}

/// One unit of work: a UID and the mailbox it lives in.
#[derive(Debug, Clone)]
struct SyncItem {
    uid: u32,
    mailbox: String,
}

fn truncate_message(message: &str) -> String {
    message.chars().take(ERROR_MESSAGE_LIMIT).collect()
}

/// Drives chunked fetch/process/commit cycles for one mode over one store.
/// Headers and full modes share this shape; they differ only in the per-UID
/// action and the UID universe the callers compute.
pub struct SyncEngine<'a> {
    store: &'a MailStore,
    transport: &'a mut dyn MailboxTransport,
    mode: SyncMode,
    checkpoint: CheckpointManager<'a>,
    settings: SyncSettings,
    cancel: CancelFlag,
    run_id: Option<i64>,
    items_since_commit: usize,
}

impl<'a> SyncEngine<'a> {
    fn new(
        store: &'a MailStore,
        transport: &'a mut dyn MailboxTransport,
        mode: SyncMode,
        mailbox: &str,
        settings: &SyncSettings,
        cancel: CancelFlag,
    ) -> Self {
        let checkpoint =
            CheckpointManager::new(store, mode, mailbox, settings.checkpoint_save_interval);
        Self {
            store,
            transport,
            mode,
            checkpoint,
            settings: settings.clone(),
            cancel,
            run_id: None,
            items_since_commit: 0,
        }
    }

    fn start_run(&mut self, message: &str) -> Result<(), SyncError> {
        self.store.begin()?;
        if self.checkpoint.was_interrupted()? {
            warn!(
                "Previous {} run for {} did not complete cleanly; resuming from checkpoint",
                self.mode.as_str(),
                self.checkpoint.mailbox()
            );
        }
        self.checkpoint.mark_start()?;
        self.run_id = Some(self.store.log_sync_start(message)?);
        Ok(())
    }

    fn finish_run(&mut self, status: SyncRunStatus, message: &str) -> Result<(), SyncError> {
        if let Some(run_id) = self.run_id.take() {
            self.store.log_sync_end(run_id, status, message)?;
        }
        self.checkpoint.mark_complete()?;
        if !self.store.commit_with_retry() {
            warn!("Final commit failed; latest progress may be lost");
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SyncError> {
        self.checkpoint.save_state()?;
        if !self.store.commit_with_retry() {
            warn!("Store commit failed after retries; continuing with staged data");
        }
        self.items_since_commit = 0;
        Ok(())
    }

    /// Headers universe: discovered remote UIDs past the resume point plus
    /// the retry set, ascending.
    fn plan_headers(&mut self, mailbox: &str) -> Result<Vec<SyncItem>, SyncError> {
        if !self.transport.select_mailbox(mailbox)? {
            return Err(anyhow!("Failed to select mailbox {}", mailbox).into());
        }

        // A checkpoint lagging a partially-committed database must never
        // trigger re-fetching already-stored rows, so take the max.
        let last_uid = self
            .checkpoint
            .last_uid()?
            .max(self.store.max_header_uid(mailbox)?);
        info!("Resuming header sync for {} from UID > {}", mailbox, last_uid);

        let retries = self.checkpoint.uids_to_retry(self.settings.max_uid_retries)?;
        if !retries.is_empty() {
            info!(
                "Retrying {} previously failed UIDs for {}",
                retries.len(),
                mailbox
            );
        }
        self.report_permanent_failures()?;

        let server_uids =
            UidDiscovery::new(&self.settings).discover(&mut *self.transport, mailbox)?;

        let mut universe: BTreeSet<u32> =
            server_uids.into_iter().filter(|&uid| uid > last_uid).collect();
        universe.extend(retries);
        Ok(universe
            .into_iter()
            .map(|uid| SyncItem {
                uid,
                mailbox: mailbox.to_string(),
            })
            .collect())
    }

    /// Full universe: header UIDs without a stored full message plus the
    /// retry set (restricted to known headers), ascending.
    fn plan_full(&mut self, mailbox: &str) -> Result<Option<Vec<SyncItem>>, SyncError> {
        let header_uids = self.store.header_uids(mailbox)?;
        if header_uids.is_empty() {
            return Ok(None);
        }
        let known: HashSet<u32> = header_uids.iter().copied().collect();
        let fetched = self.store.full_message_uids(mailbox)?;
        info!(
            "{}: {} headers known, {} full messages already fetched",
            mailbox,
            header_uids.len(),
            fetched.len()
        );

        let retries = self.checkpoint.uids_to_retry(self.settings.max_uid_retries)?;
        self.report_permanent_failures()?;

        let mut universe: BTreeSet<u32> = header_uids
            .into_iter()
            .filter(|uid| !fetched.contains(uid))
            .collect();
        universe.extend(retries.into_iter().filter(|uid| known.contains(uid)));
        Ok(Some(
            universe
                .into_iter()
                .map(|uid| SyncItem {
                    uid,
                    mailbox: mailbox.to_string(),
                })
                .collect(),
        ))
    }

    fn report_permanent_failures(&mut self) -> Result<(), SyncError> {
        let permanent = self
            .checkpoint
            .permanently_failed_uids(self.settings.max_uid_retries)?;
        if !permanent.is_empty() {
            warn!(
                "Skipping {} UIDs for {} that failed {} or more times (first few: {:?})",
                permanent.len(),
                self.checkpoint.mailbox(),
                self.settings.max_uid_retries,
                &permanent[..permanent.len().min(5)]
            );
        }
        Ok(())
    }

    /// Processes the plan and closes the run exactly once, whatever happens:
    /// COMPLETED/COMPLETED_NO_CHANGES on success, INTERRUPTED on operator
    /// cancellation, ERROR on an unexpected failure. Interruption and error
    /// still commit staged progress and clear the in-progress marker before
    /// propagating.
    fn run(&mut self, items: Vec<SyncItem>, what: &str) -> Result<RunSummary, SyncError> {
        match self.run_loop(&items) {
            Ok(summary) => {
                self.checkpoint.save_state()?;
                if summary.saved > 0 {
                    self.finish_run(
                        SyncRunStatus::Completed,
                        &format!("Successfully processed {} {}", summary.saved, what),
                    )?;
                } else {
                    self.finish_run(
                        SyncRunStatus::CompletedNoChanges,
                        &format!(
                            "No new {} saved despite attempting {} UIDs",
                            what, summary.processed
                        ),
                    )?;
                }
                info!(
                    "Run summary for {}: {} saved, {} failed, {} attempted",
                    what, summary.saved, summary.failed, summary.processed
                );
                Ok(summary)
            }
            Err(SyncError::Interrupted) => {
                warn!("Sync interrupted; saving progress");
                if let Err(e) = self.checkpoint.save_state() {
                    warn!("Failed to save checkpoint state on interrupt: {}", e);
                }
                self.finish_run(SyncRunStatus::Interrupted, "Interrupted by operator")?;
                Err(SyncError::Interrupted)
            }
            Err(e) => {
                if let Err(save_err) = self.checkpoint.save_state() {
                    warn!("Failed to save checkpoint state after error: {}", save_err);
                }
                let message = truncate_message(&e.to_string());
                if let Err(finish_err) = self.finish_run(SyncRunStatus::Error, &message) {
                    warn!("Failed to record run error: {}", finish_err);
                }
                Err(e)
            }
        }
    }

    fn run_loop(&mut self, items: &[SyncItem]) -> Result<RunSummary, SyncError> {
        let mut summary = RunSummary::default();

        for chunk in items.chunks(self.settings.chunk_size.max(1)) {
            // Mailboxes whose select failed in this chunk; their UIDs are
            // already marked failed and must not be fetched.
            let mut dead_mailboxes: HashSet<String> = HashSet::new();

            for (idx, item) in chunk.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Err(SyncError::Interrupted);
                }
                if dead_mailboxes.contains(&item.mailbox) {
                    continue;
                }
                if self.checkpoint.mailbox() != item.mailbox {
                    self.checkpoint.save_state()?;
                    self.checkpoint.set_mailbox(&item.mailbox)?;
                }

                let selected = match self.transport.select_mailbox(&item.mailbox) {
                    Ok(selected) => selected,
                    Err(e) => {
                        warn!("Selecting {} failed: {}", item.mailbox, e);
                        false
                    }
                };
                if !selected {
                    // Abort every remaining UID headed for this mailbox in
                    // the chunk, then keep going with the others.
                    for later in &chunk[idx..] {
                        if later.mailbox == item.mailbox {
                            self.checkpoint.add_failed_uid(later.uid)?;
                            summary.processed += 1;
                            summary.failed += 1;
                        }
                    }
                    dead_mailboxes.insert(item.mailbox.clone());
                    continue;
                }

                match self.process_item(item) {
                    Ok(()) => {
                        self.checkpoint.update_progress(item.uid)?;
                        self.checkpoint.clear_failed_uid(item.uid)?;
                        summary.saved += 1;
                    }
                    Err(e) => {
                        debug!(
                            "Failed to process UID {} in {}: {}",
                            item.uid, item.mailbox, e
                        );
                        self.checkpoint.add_failed_uid(item.uid)?;
                        summary.failed += 1;
                    }
                }
                summary.processed += 1;

                self.items_since_commit += 1;
                if self.items_since_commit >= self.settings.commit_interval.max(1) {
                    self.flush()?;
                    debug!(
                        "Progress: {}/{} UIDs attempted",
                        summary.processed,
                        items.len()
                    );
                }
            }

            self.flush()?;
        }

        Ok(summary)
    }

    fn process_item(&mut self, item: &SyncItem) -> anyhow::Result<()> {
        match self.mode {
            SyncMode::Headers => self.process_headers(item.uid, &item.mailbox),
            SyncMode::Full => self.process_full(item.uid, &item.mailbox),
            SyncMode::Attachments => {
                Err(anyhow!("attachment extraction does not run through the sync engine"))
            }
        }
    }

    fn process_headers(&mut self, uid: u32, mailbox: &str) -> anyhow::Result<()> {
        let raw = self
            .transport
            .fetch(uid, FetchKind::Headers)?
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| anyhow!("no header data returned for UID {}", uid))?;
        let fields = parse_header_fields(&raw)
            .ok_or_else(|| anyhow!("unparseable header block for UID {}", uid))?;
        self.store.upsert_header(
            uid,
            mailbox,
            &fields.from,
            &fields.to,
            &fields.cc,
            &fields.subject,
            &fields.date,
        )?;
        Ok(())
    }

    fn process_full(&mut self, uid: u32, mailbox: &str) -> anyhow::Result<()> {
        let raw = self
            .transport
            .fetch(uid, FetchKind::Full)?
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| anyhow!("no message data returned for UID {}", uid))?;
        self.store
            .upsert_full_message(uid, mailbox, &raw, &Local::now().to_rfc3339())?;
        Ok(())
    }
}

/// Syncs header rows for `mailbox`: discover remote UIDs, reconcile against
/// the checkpoint, fetch and parse each header block, upsert.
pub fn sync_headers(
    store: &MailStore,
    transport: &mut dyn MailboxTransport,
    settings: &SyncSettings,
    mailbox: &str,
    cancel: CancelFlag,
) -> Result<RunSummary, SyncError> {
    let mut engine = SyncEngine::new(
        store,
        transport,
        SyncMode::Headers,
        mailbox,
        settings,
        cancel,
    );
    engine.start_run(&format!("Starting header sync for {}", mailbox))?;

    let items = match engine.plan_headers(mailbox) {
        Ok(items) => items,
        Err(e) => {
            engine.finish_run(SyncRunStatus::Error, &truncate_message(&e.to_string()))?;
            return Err(e);
        }
    };

    if items.is_empty() {
        info!("No new headers to fetch or retry for {}", mailbox);
        engine.finish_run(
            SyncRunStatus::CompletedNoNewHeaders,
            &format!("No new headers to fetch or retry for {}", mailbox),
        )?;
        return Ok(RunSummary::default());
    }

    info!("Found {} headers to attempt for {}", items.len(), mailbox);
    engine.run(items, "headers")
}

/// Syncs full raw messages for every header UID that has no stored body yet.
pub fn sync_full(
    store: &MailStore,
    transport: &mut dyn MailboxTransport,
    settings: &SyncSettings,
    mailbox: &str,
    cancel: CancelFlag,
) -> Result<RunSummary, SyncError> {
    let mut engine = SyncEngine::new(store, transport, SyncMode::Full, mailbox, settings, cancel);
    engine.start_run(&format!("Starting full message sync for {}", mailbox))?;

    let items = match engine.plan_full(mailbox) {
        Ok(Some(items)) => items,
        Ok(None) => {
            info!(
                "No headers in store for {}; run a header sync first",
                mailbox
            );
            engine.finish_run(
                SyncRunStatus::Skipped,
                &format!("No headers in store for {}", mailbox),
            )?;
            return Ok(RunSummary::default());
        }
        Err(e) => {
            engine.finish_run(SyncRunStatus::Error, &truncate_message(&e.to_string()))?;
            return Err(e);
        }
    };

    if items.is_empty() {
        info!("No new full messages to fetch or retry for {}", mailbox);
        engine.finish_run(
            SyncRunStatus::CompletedNoChanges,
            &format!("No new full messages to fetch or retry for {}", mailbox),
        )?;
        return Ok(RunSummary::default());
    }

    info!(
        "Found {} full messages to attempt for {}",
        items.len(),
        mailbox
    );
    engine.run(items, "full messages")
}

struct HeaderFields {
    from: String,
    to: String,
    cc: String,
    subject: String,
    date: String,
}

/// Renders an address header the way it is stored: `Name <addr>` entries
/// joined with commas.
fn address_field(value: &mail_parser::HeaderValue) -> String {
    match value {
        mail_parser::HeaderValue::Address(addr) => format_address(addr),
        mail_parser::HeaderValue::AddressList(list) => list
            .iter()
            .map(format_address)
            .collect::<Vec<_>>()
            .join(", "),
        mail_parser::HeaderValue::Text(text) => text.to_string(),
        _ => String::new(),
    }
}

fn format_address(addr: &mail_parser::Addr) -> String {
    let address = addr.address.as_deref().unwrap_or_default();
    match addr.name.as_deref() {
        Some(name) if !name.is_empty() => format!("{} <{}>", name, address),
        _ => address.to_string(),
    }
}

/// Original Date header text, for the best-effort fallback when the date
/// cannot be normalized.
fn raw_date_header(parsed: &mail_parser::Message) -> String {
    for header in parsed.headers() {
        if header.name().to_string().eq_ignore_ascii_case("date") {
            if let Some(text) = header.value().as_text_ref() {
                return text.to_string();
            }
        }
    }
    String::new()
}

/// Parses a raw header block into the stored fields. The date is normalized
/// to ISO-8601 when it parses; otherwise the raw header string is kept rather
/// than dropped.
fn parse_header_fields(raw: &[u8]) -> Option<HeaderFields> {
    let parsed = mail_parser::Message::parse(raw)?;
    let date = match parsed.date() {
        Some(dt) => chrono::DateTime::from_timestamp(dt.to_timestamp(), 0)
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| raw_date_header(&parsed)),
        None => raw_date_header(&parsed),
    };
    Some(HeaderFields {
        from: address_field(parsed.from()),
        to: address_field(parsed.to()),
        cc: address_field(parsed.cc()),
        subject: parsed.subject().unwrap_or_default().to_string(),
        date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::NaiveDate;

    /// Scripted remote mailbox: a UID universe with payloads, per-UID
    /// failure budgets, and select rejection.
    #[derive(Default)]
    struct MockTransport {
        uids: Vec<u32>,
        header_payloads: HashMap<u32, Vec<u8>>,
        full_payloads: HashMap<u32, Vec<u8>>,
        remaining_fetch_failures: HashMap<u32, u32>,
        reject_select: HashSet<String>,
        selected: Option<String>,
        fetch_log: Vec<u32>,
    }

    impl MockTransport {
        fn with_headers(uids: &[u32]) -> Self {
            let mut mock = MockTransport {
                uids: uids.to_vec(),
                ..Default::default()
            };
            for &uid in uids {
                mock.header_payloads.insert(uid, header_block(uid));
            }
            mock
        }
    }

    fn header_block(uid: u32) -> Vec<u8> {
        format!(
            "From: Alice Sender <alice@example.com>\r\n\
             To: bob@example.com\r\n\
             Subject: message {}\r\n\
             Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\r\n",
            uid
        )
        .into_bytes()
    }

    impl MailboxTransport for MockTransport {
        fn select_mailbox(&mut self, mailbox: &str) -> Result<bool, TransportError> {
            if self.reject_select.contains(mailbox) {
                return Ok(false);
            }
            self.selected = Some(mailbox.to_string());
            Ok(true)
        }

        fn message_count(&mut self) -> Result<u32, TransportError> {
            Ok(self.uids.len() as u32)
        }

        fn search_all(&mut self) -> Result<Vec<u32>, TransportError> {
            let mut uids = self.uids.clone();
            uids.sort_unstable();
            Ok(uids)
        }

        fn search_sequence_range(
            &mut self,
            _start: u32,
            _end: u32,
        ) -> Result<Vec<u32>, TransportError> {
            Ok(vec![])
        }

        fn search_date_range(
            &mut self,
            _since: NaiveDate,
            _before: NaiveDate,
        ) -> Result<Vec<u32>, TransportError> {
            Ok(vec![])
        }

        fn fetch(&mut self, uid: u32, kind: FetchKind) -> Result<Option<Vec<u8>>, TransportError> {
            self.fetch_log.push(uid);
            if let Some(remaining) = self.remaining_fetch_failures.get_mut(&uid) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::ImapError("scripted fetch failure".to_string()));
                }
            }
            let payload = match kind {
                FetchKind::Headers => self.header_payloads.get(&uid),
                FetchKind::Full => self.full_payloads.get(&uid),
            };
            Ok(payload.cloned())
        }

        fn list_mailboxes(&mut self) -> Result<Vec<String>, TransportError> {
            Ok(vec!["INBOX".to_string()])
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings::default()
    }

    fn last_run_status(store: &MailStore) -> String {
        store.recent_sync_runs(1).unwrap()[0].status.clone()
    }

    #[test]
    fn headers_sync_processes_uids_beyond_checkpoint() {
        let store = MailStore::open_in_memory().unwrap();
        {
            let mut cp = CheckpointManager::new(&store, SyncMode::Headers, "INBOX", 250);
            cp.update_progress(100).unwrap();
            cp.save_state().unwrap();
        }
        let mut transport = MockTransport::with_headers(&[99, 100, 101, 102, 103, 104, 105]);

        let summary =
            sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();

        assert_eq!(summary.processed, 5);
        assert_eq!(summary.saved, 5);
        assert_eq!(summary.failed, 0);
        assert_eq!(transport.fetch_log, vec![101, 102, 103, 104, 105]);
        assert_eq!(store.header_count("INBOX").unwrap(), 5);
        assert_eq!(last_run_status(&store), "COMPLETED");

        let mut cp = CheckpointManager::new(&store, SyncMode::Headers, "INBOX", 250);
        assert_eq!(cp.last_uid().unwrap(), 105);
        assert!(!cp.was_interrupted().unwrap());
    }

    #[test]
    fn repeat_run_with_no_new_mail_writes_nothing() {
        let store = MailStore::open_in_memory().unwrap();
        let mut transport = MockTransport::with_headers(&[1, 2, 3]);

        sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert_eq!(store.header_count("INBOX").unwrap(), 3);

        transport.fetch_log.clear();
        let summary =
            sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();

        assert_eq!(summary, RunSummary::default());
        assert!(transport.fetch_log.is_empty());
        assert_eq!(store.header_count("INBOX").unwrap(), 3);
        assert_eq!(last_run_status(&store), "COMPLETED_NO_NEW_HEADERS");

        let mut cp = CheckpointManager::new(&store, SyncMode::Headers, "INBOX", 250);
        assert_eq!(cp.last_uid().unwrap(), 3);
    }

    #[test]
    fn lagging_checkpoint_defers_to_database_resume_point() {
        let store = MailStore::open_in_memory().unwrap();
        // Rows committed by an earlier run whose checkpoint write was lost.
        for uid in [49u32, 50] {
            store
                .upsert_header(uid, "INBOX", "a@x", "b@x", "", "old", "")
                .unwrap();
        }
        let mut transport = MockTransport::with_headers(&[49, 50, 51]);

        sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert_eq!(transport.fetch_log, vec![51]);
    }

    #[test]
    fn failing_uid_retries_until_success_then_clears() {
        let store = MailStore::open_in_memory().unwrap();
        let mut transport = MockTransport::with_headers(&[101, 102, 103]);
        // UID 102 fails on the first two fetch attempts, succeeds on the third.
        transport.remaining_fetch_failures.insert(102, 2);

        let summary =
            sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert_eq!(summary.saved, 2);
        assert_eq!(summary.failed, 1);

        let summary =
            sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert_eq!(summary.failed, 1);
        {
            let mut cp = CheckpointManager::new(&store, SyncMode::Headers, "INBOX", 250);
            assert_eq!(cp.uids_to_retry(3).unwrap(), vec![102]);
            assert!(cp.permanently_failed_uids(3).unwrap().is_empty());
        }

        let summary =
            sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert_eq!(summary.saved, 1);
        assert_eq!(last_run_status(&store), "COMPLETED");
        assert_eq!(store.header_count("INBOX").unwrap(), 3);

        let mut cp = CheckpointManager::new(&store, SyncMode::Headers, "INBOX", 250);
        assert!(cp.uids_to_retry(3).unwrap().is_empty());
        assert!(cp.permanently_failed_uids(3).unwrap().is_empty());
    }

    #[test]
    fn exhausted_retry_budget_parks_uid_permanently() {
        let store = MailStore::open_in_memory().unwrap();
        let mut transport = MockTransport::with_headers(&[7]);
        transport.remaining_fetch_failures.insert(7, u32::MAX);

        for _ in 0..3 {
            sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        }
        {
            let mut cp = CheckpointManager::new(&store, SyncMode::Headers, "INBOX", 250);
            assert_eq!(cp.permanently_failed_uids(3).unwrap(), vec![7]);
            assert!(cp.uids_to_retry(3).unwrap().is_empty());
        }

        // A fourth run must not touch the parked UID.
        transport.fetch_log.clear();
        sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert!(transport.fetch_log.is_empty());
        assert_eq!(last_run_status(&store), "COMPLETED_NO_NEW_HEADERS");
    }

    #[test]
    fn full_sync_fetches_only_missing_messages() {
        let store = MailStore::open_in_memory().unwrap();
        for uid in [1u32, 2, 3] {
            store
                .upsert_header(uid, "INBOX", "a@x", "b@x", "", "s", "")
                .unwrap();
        }
        store
            .upsert_full_message(2, "INBOX", b"Subject: s\r\n\r\nalready here", "t")
            .unwrap();

        let mut transport = MockTransport::default();
        for uid in [1u32, 3] {
            transport
                .full_payloads
                .insert(uid, format!("Subject: m{}\r\n\r\nbody", uid).into_bytes());
        }

        let summary =
            sync_full(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert_eq!(summary.saved, 2);
        assert_eq!(transport.fetch_log, vec![1, 3]);
        assert_eq!(store.full_message_uids("INBOX").unwrap().len(), 3);
        assert_eq!(last_run_status(&store), "COMPLETED");
    }

    #[test]
    fn full_sync_without_headers_is_skipped() {
        let store = MailStore::open_in_memory().unwrap();
        let mut transport = MockTransport::default();

        let summary =
            sync_full(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(last_run_status(&store), "SKIPPED");
    }

    #[test]
    fn full_sync_retry_set_is_restricted_to_known_headers() {
        let store = MailStore::open_in_memory().unwrap();
        store
            .upsert_header(1, "INBOX", "a@x", "b@x", "", "s", "")
            .unwrap();
        {
            // Stale failed entry for a UID whose header row never landed.
            let mut cp = CheckpointManager::new(&store, SyncMode::Full, "INBOX", 250);
            cp.add_failed_uid(999).unwrap();
        }
        let mut transport = MockTransport::default();
        transport
            .full_payloads
            .insert(1, b"Subject: s\r\n\r\nbody".to_vec());

        sync_full(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert_eq!(transport.fetch_log, vec![1]);
    }

    #[test]
    fn select_failure_fails_every_uid_for_that_mailbox() {
        let store = MailStore::open_in_memory().unwrap();
        for uid in [1u32, 2, 3] {
            store
                .upsert_header(uid, "INBOX", "a@x", "b@x", "", "s", "")
                .unwrap();
        }
        let mut transport = MockTransport::default();
        transport.reject_select.insert("INBOX".to_string());

        let summary =
            sync_full(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert_eq!(summary.failed, 3);
        assert!(transport.fetch_log.is_empty());
        assert_eq!(last_run_status(&store), "COMPLETED_NO_CHANGES");

        let failed = store.load_failed_uids("full", "INBOX").unwrap();
        assert_eq!(failed.len(), 3);
        assert!(failed.values().all(|&count| count == 1));
    }

    #[test]
    fn rejected_mailbox_select_fails_header_run() {
        let store = MailStore::open_in_memory().unwrap();
        let mut transport = MockTransport::with_headers(&[1]);
        transport.reject_select.insert("INBOX".to_string());

        let result =
            sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new());
        assert!(result.is_err());
        assert_eq!(last_run_status(&store), "ERROR");

        // The in-progress marker must not wedge.
        let mut cp = CheckpointManager::new(&store, SyncMode::Headers, "INBOX", 250);
        assert!(!cp.was_interrupted().unwrap());
    }

    #[test]
    fn cancellation_records_interrupted_and_unwinds() {
        let store = MailStore::open_in_memory().unwrap();
        let mut transport = MockTransport::with_headers(&[1, 2, 3]);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = sync_headers(&store, &mut transport, &settings(), "INBOX", cancel);
        assert!(matches!(result, Err(SyncError::Interrupted)));
        assert!(transport.fetch_log.is_empty());
        assert_eq!(last_run_status(&store), "INTERRUPTED");

        let mut cp = CheckpointManager::new(&store, SyncMode::Headers, "INBOX", 250);
        assert!(!cp.was_interrupted().unwrap());
    }

    #[test]
    fn uids_are_processed_in_numeric_order() {
        let store = MailStore::open_in_memory().unwrap();
        let mut transport = MockTransport::with_headers(&[100, 9, 10]);

        sync_headers(&store, &mut transport, &settings(), "INBOX", CancelFlag::new()).unwrap();
        assert_eq!(transport.fetch_log, vec![9, 10, 100]);
    }

    #[test]
    fn header_dates_normalize_to_iso8601() {
        let fields = parse_header_fields(
            b"From: a@example.com\r\nSubject: x\r\nDate: Mon, 1 Jan 2024 10:30:00 +0000\r\n\r\n",
        )
        .unwrap();
        assert!(fields.date.starts_with("2024-01-01T10:30:00"));
    }

    #[test]
    fn unparseable_date_keeps_raw_string() {
        let fields = parse_header_fields(
            b"From: a@example.com\r\nSubject: x\r\nDate: sometime last tuesday\r\n\r\n",
        )
        .unwrap();
        assert_eq!(fields.date, "sometime last tuesday");
    }

    #[test]
    fn address_headers_render_name_and_angle_form() {
        let fields = parse_header_fields(
            b"From: Alice Sender <alice@example.com>\r\n\
              To: bob@example.com, Carol <carol@example.com>\r\n\r\n",
        )
        .unwrap();
        assert_eq!(fields.from, "Alice Sender <alice@example.com>");
        assert_eq!(fields.to, "bob@example.com, Carol <carol@example.com>");
        assert_eq!(fields.cc, "");
    }

    #[test]
    fn error_messages_are_truncated_for_the_audit_log() {
        let long = "x".repeat(500);
        assert_eq!(truncate_message(&long).len(), ERROR_MESSAGE_LIMIT);
        assert_eq!(truncate_message("short"), "short");
    }
}
