use chrono::{Datelike, Local, NaiveDate};
use log::{debug, info, warn};

use crate::config::SyncSettings;
use crate::transport::{MailboxTransport, TransportError};

/// How to enumerate the UIDs of a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStrategy {
    /// Single `UID SEARCH ALL`; ordinary mailboxes.
    Direct,
    /// UID-only fetches over fixed-width sequence ranges; mailboxes whose
    /// message count exceeds the configured threshold.
    SequenceChunked,
    /// Month-by-month date-range searches; mailboxes so large that even a
    /// sequence-chunked response risks being oversized.
    DateChunked,
}

/// Picks and runs a UID-enumeration strategy based on mailbox identity and
/// size.
pub struct UidDiscovery<'a> {
    settings: &'a SyncSettings,
}

impl<'a> UidDiscovery<'a> {
    pub fn new(settings: &'a SyncSettings) -> Self {
        Self { settings }
    }

    pub fn strategy_for(&self, mailbox: &str) -> DiscoveryStrategy {
        if self
            .settings
            .date_chunked_mailboxes
            .iter()
            .any(|m| m == mailbox)
        {
            DiscoveryStrategy::DateChunked
        } else if self
            .settings
            .sequence_chunked_mailboxes
            .iter()
            .any(|m| m == mailbox)
            || mailbox.contains("All Mail")
        {
            DiscoveryStrategy::SequenceChunked
        } else {
            DiscoveryStrategy::Direct
        }
    }

    /// Enumerates the remote UIDs of the currently selected mailbox,
    /// ascending and deduplicated.
    pub fn discover(
        &self,
        transport: &mut dyn MailboxTransport,
        mailbox: &str,
    ) -> Result<Vec<u32>, TransportError> {
        match self.strategy_for(mailbox) {
            DiscoveryStrategy::Direct => transport.search_all(),
            DiscoveryStrategy::DateChunked => self.search_by_date_chunks(transport),
            DiscoveryStrategy::SequenceChunked => {
                match self.search_sequence_chunked(transport) {
                    Ok(uids) => Ok(uids),
                    Err(e) => {
                        warn!(
                            "Sequence-chunked discovery failed for {}: {}. Falling back to date-chunked.",
                            mailbox, e
                        );
                        self.search_by_date_chunks(transport)
                    }
                }
            }
        }
    }

    fn search_sequence_chunked(
        &self,
        transport: &mut dyn MailboxTransport,
    ) -> Result<Vec<u32>, TransportError> {
        let count = match transport.message_count() {
            Ok(count) => count,
            Err(e) => {
                warn!("Could not read message count: {}. Using direct search.", e);
                return transport.search_all();
            }
        };
        if count < self.settings.large_mailbox_threshold {
            return transport.search_all();
        }

        info!(
            "Large mailbox detected ({} messages). Using sequence-chunked discovery.",
            count
        );
        let width = self.settings.sequence_chunk_size.max(1);
        let mut all_uids = Vec::with_capacity(count as usize);
        let mut start = 1u32;
        while start <= count {
            let end = start.saturating_add(width - 1).min(count);
            match transport.search_sequence_range(start, end) {
                Ok(mut uids) => all_uids.append(&mut uids),
                // A failed range is retried implicitly on the next run.
                Err(e) => warn!("Failed to fetch UIDs for range {}:{}: {}", start, end, e),
            }
            if end == u32::MAX {
                break;
            }
            start = end + 1;
        }
        all_uids.sort_unstable();
        all_uids.dedup();
        Ok(all_uids)
    }

    /// Best-effort month-by-month enumeration. Failed months are skipped;
    /// remote state does not change underneath us, so they are rediscovered
    /// on the next run.
    fn search_by_date_chunks(
        &self,
        transport: &mut dyn MailboxTransport,
    ) -> Result<Vec<u32>, TransportError> {
        let today = Local::now().date_naive();
        let start_year = self.settings.date_chunk_start_year.min(today.year());
        info!(
            "Date-chunked discovery from {} through {}-{:02}",
            start_year,
            today.year(),
            today.month()
        );

        let mut all_uids = Vec::new();
        for year in start_year..=today.year() {
            for month in 1..=12u32 {
                if year == today.year() && month > today.month() {
                    break;
                }
                let since = match NaiveDate::from_ymd_opt(year, month, 1) {
                    Some(d) => d,
                    None => continue,
                };
                let before = next_month_start(year, month);
                match transport.search_date_range(since, before) {
                    Ok(uids) => {
                        if !uids.is_empty() {
                            debug!("Found {} messages for {}-{:02}", uids.len(), year, month);
                            all_uids.extend(uids);
                        }
                    }
                    Err(e) => {
                        warn!("Date search {} to {} failed: {}", since, before, e);
                    }
                }
            }
        }
        all_uids.sort_unstable();
        all_uids.dedup();
        Ok(all_uids)
    }
}

fn next_month_start(year: i32, month: u32) -> NaiveDate {
    let (y, m) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    // The 1st of any month always exists.
    NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(NaiveDate::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Scripted transport for discovery tests: fixed UID universe plus
    /// switches to make individual operations fail.
    struct ScriptedTransport {
        all_uids: Vec<u32>,
        count: Result<u32, ()>,
        failing_ranges: Vec<(u32, u32)>,
        range_calls: Vec<(u32, u32)>,
        date_calls: Vec<(NaiveDate, NaiveDate)>,
        uids_by_month: HashMap<(i32, u32), Vec<u32>>,
        failing_months: Vec<(i32, u32)>,
    }

    impl ScriptedTransport {
        fn new(all_uids: Vec<u32>) -> Self {
            Self {
                all_uids,
                count: Err(()),
                failing_ranges: Vec::new(),
                range_calls: Vec::new(),
                date_calls: Vec::new(),
                uids_by_month: HashMap::new(),
                failing_months: Vec::new(),
            }
        }
    }

    impl MailboxTransport for ScriptedTransport {
        fn select_mailbox(&mut self, _mailbox: &str) -> Result<bool, TransportError> {
            Ok(true)
        }

        fn message_count(&mut self) -> Result<u32, TransportError> {
            self.count
                .map_err(|_| TransportError::ImapError("STATUS failed".to_string()))
        }

        fn search_all(&mut self) -> Result<Vec<u32>, TransportError> {
            Ok(self.all_uids.clone())
        }

        fn search_sequence_range(
            &mut self,
            start: u32,
            end: u32,
        ) -> Result<Vec<u32>, TransportError> {
            self.range_calls.push((start, end));
            if self.failing_ranges.contains(&(start, end)) {
                return Err(TransportError::ImapError("range fetch failed".to_string()));
            }
            // Sequence number n maps to UID 1000 + n in this script.
            Ok((start..=end).map(|n| 1000 + n).collect())
        }

        fn search_date_range(
            &mut self,
            since: NaiveDate,
            before: NaiveDate,
        ) -> Result<Vec<u32>, TransportError> {
            self.date_calls.push((since, before));
            let key = (since.year(), since.month());
            if self.failing_months.contains(&key) {
                return Err(TransportError::ImapError("date search failed".to_string()));
            }
            Ok(self.uids_by_month.get(&key).cloned().unwrap_or_default())
        }

        fn fetch(
            &mut self,
            _uid: u32,
            _kind: crate::transport::FetchKind,
        ) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(None)
        }

        fn list_mailboxes(&mut self) -> Result<Vec<String>, TransportError> {
            Ok(vec![])
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            // Current year keeps the date scan short in tests.
            date_chunk_start_year: Local::now().year(),
            ..SyncSettings::default()
        }
    }

    #[test]
    fn selection_policy_routes_by_mailbox_name() {
        let settings = settings();
        let discovery = UidDiscovery::new(&settings);
        assert_eq!(
            discovery.strategy_for("[Gmail]/All Mail"),
            DiscoveryStrategy::DateChunked
        );
        assert_eq!(
            discovery.strategy_for("[Gmail]/Mail"),
            DiscoveryStrategy::SequenceChunked
        );
        assert_eq!(
            discovery.strategy_for("Archive/All Mail Copy"),
            DiscoveryStrategy::SequenceChunked
        );
        assert_eq!(discovery.strategy_for("INBOX"), DiscoveryStrategy::Direct);
    }

    #[test]
    fn small_mailbox_falls_back_to_direct_search() {
        let settings = settings();
        let discovery = UidDiscovery::new(&settings);
        let mut transport = ScriptedTransport::new(vec![3, 1, 2]);
        transport.count = Ok(50);

        let uids = discovery.discover(&mut transport, "[Gmail]/Mail").unwrap();
        assert_eq!(uids, vec![3, 1, 2]);
        assert!(transport.range_calls.is_empty());
    }

    #[test]
    fn failed_count_query_falls_back_to_direct_search() {
        let settings = settings();
        let discovery = UidDiscovery::new(&settings);
        let mut transport = ScriptedTransport::new(vec![7, 8]);

        let uids = discovery.discover(&mut transport, "[Gmail]/Mail").unwrap();
        assert_eq!(uids, vec![7, 8]);
    }

    #[test]
    fn large_mailbox_iterates_sequence_ranges() {
        let settings = settings();
        let discovery = UidDiscovery::new(&settings);
        let mut transport = ScriptedTransport::new(vec![]);
        transport.count = Ok(25_000);

        let uids = discovery.discover(&mut transport, "[Gmail]/Mail").unwrap();
        assert_eq!(
            transport.range_calls,
            vec![(1, 10_000), (10_001, 20_000), (20_001, 25_000)]
        );
        assert_eq!(uids.len(), 25_000);
        assert_eq!(uids[0], 1001);
        assert_eq!(*uids.last().unwrap(), 26_000);
    }

    #[test]
    fn failed_sequence_range_is_skipped_not_fatal() {
        let settings = settings();
        let discovery = UidDiscovery::new(&settings);
        let mut transport = ScriptedTransport::new(vec![]);
        transport.count = Ok(25_000);
        transport.failing_ranges.push((10_001, 20_000));

        let uids = discovery.discover(&mut transport, "[Gmail]/Mail").unwrap();
        assert_eq!(uids.len(), 15_000);
        assert!(!uids.contains(&(1000 + 15_000)));
    }

    #[test]
    fn date_chunks_cover_months_with_exclusive_upper_bound() {
        let settings = settings();
        let discovery = UidDiscovery::new(&settings);
        let mut transport = ScriptedTransport::new(vec![]);
        let today = Local::now().date_naive();
        transport
            .uids_by_month
            .insert((today.year(), 1), vec![10, 9]);

        let uids = discovery
            .discover(&mut transport, "[Gmail]/All Mail")
            .unwrap();
        assert_eq!(uids, vec![9, 10]);
        assert_eq!(transport.date_calls.len() as u32, today.month());

        let (since, before) = transport.date_calls[0];
        assert_eq!(since, NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap());
        assert_eq!(before, NaiveDate::from_ymd_opt(today.year(), 2, 1).unwrap());
    }

    #[test]
    fn failed_month_is_skipped_not_fatal() {
        let mut settings = settings();
        let last_year = Local::now().year() - 1;
        settings.date_chunk_start_year = last_year;
        let discovery = UidDiscovery::new(&settings);
        let mut transport = ScriptedTransport::new(vec![]);
        transport.failing_months.push((last_year, 5));
        transport.uids_by_month.insert((last_year, 6), vec![42]);

        let uids = discovery
            .discover(&mut transport, "[Gmail]/All Mail")
            .unwrap();
        assert_eq!(uids, vec![42]);
    }

    #[test]
    fn december_rolls_over_to_january() {
        assert_eq!(
            next_month_start(2023, 12),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
        assert_eq!(
            next_month_start(2024, 6),
            NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
        );
    }
}
