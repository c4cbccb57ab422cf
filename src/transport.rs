use std::net::TcpStream;

use chrono::NaiveDate;
use imap::Session;
use log::{debug, warn};
use native_tls::{TlsConnector, TlsStream};
use thiserror::Error;

use crate::config::AccountConfig;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IMAP error: {0}")]
    ImapError(String),

    #[error("TLS error: {0}")]
    TlsError(#[from] native_tls::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("No mailbox selected")]
    NoMailboxSelected,
}

/// What to pull for a single UID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Headers,
    Full,
}

impl FetchKind {
    fn query(&self) -> &'static str {
        match self {
            FetchKind::Headers => "(UID BODY.PEEK[HEADER])",
            FetchKind::Full => "(UID BODY.PEEK[])",
        }
    }
}

/// The thin remote-mailbox contract the sync engine depends on. Methods may
/// block the calling worker thread; cancellation happens between calls, never
/// mid-call.
pub trait MailboxTransport {
    /// Selects `mailbox` read-only. Ok(false) means the server rejected the
    /// mailbox (missing, unselectable); hard connection failures are errors.
    fn select_mailbox(&mut self, mailbox: &str) -> Result<bool, TransportError>;

    /// Message count of the currently selected mailbox.
    fn message_count(&mut self) -> Result<u32, TransportError>;

    /// All UIDs in the selected mailbox, ascending.
    fn search_all(&mut self) -> Result<Vec<u32>, TransportError>;

    /// UIDs of the messages at sequence numbers `start..=end`.
    fn search_sequence_range(&mut self, start: u32, end: u32) -> Result<Vec<u32>, TransportError>;

    /// UIDs of messages received on or after `since` and before `before`.
    fn search_date_range(
        &mut self,
        since: NaiveDate,
        before: NaiveDate,
    ) -> Result<Vec<u32>, TransportError>;

    /// Fetches one message section. Ok(None) when the server returned no data
    /// for the UID (expunged or otherwise unavailable).
    fn fetch(&mut self, uid: u32, kind: FetchKind) -> Result<Option<Vec<u8>>, TransportError>;

    fn list_mailboxes(&mut self) -> Result<Vec<String>, TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

/// Real transport over the `imap` crate with a TLS session.
pub struct ImapTransport {
    session: Session<TlsStream<TcpStream>>,
    current_mailbox: Option<String>,
}

impl ImapTransport {
    pub fn connect(account: &AccountConfig) -> Result<Self, TransportError> {
        let domain = &account.imap_server;
        let port = account.imap_port;

        let tls = TlsConnector::builder().build()?;
        let client = imap::connect((domain.as_str(), port), domain, &tls)
            .map_err(|e| TransportError::ImapError(e.to_string()))?;

        let session = client
            .login(&account.username, &account.password)
            .map_err(|e| TransportError::ImapError(e.0.to_string()))?;

        debug!("Connected to {}:{} as {}", domain, port, account.username);
        Ok(Self {
            session,
            current_mailbox: None,
        })
    }

    fn selected_mailbox(&self) -> Result<&str, TransportError> {
        self.current_mailbox
            .as_deref()
            .ok_or(TransportError::NoMailboxSelected)
    }
}

/// IMAP date syntax, e.g. `01-Jan-2024`.
fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

impl MailboxTransport for ImapTransport {
    fn select_mailbox(&mut self, mailbox: &str) -> Result<bool, TransportError> {
        if self.current_mailbox.as_deref() == Some(mailbox) {
            return Ok(true);
        }
        // Read-only select; the mirror never mutates remote state.
        match self.session.examine(mailbox) {
            Ok(_) => {
                self.current_mailbox = Some(mailbox.to_string());
                Ok(true)
            }
            Err(imap::Error::No(reason)) | Err(imap::Error::Bad(reason)) => {
                warn!("Failed to select mailbox {}: {}", mailbox, reason);
                Ok(false)
            }
            Err(e) => Err(TransportError::ImapError(e.to_string())),
        }
    }

    fn message_count(&mut self) -> Result<u32, TransportError> {
        let mailbox = self.selected_mailbox()?.to_string();
        let status = self
            .session
            .examine(&mailbox)
            .map_err(|e| TransportError::ImapError(e.to_string()))?;
        Ok(status.exists)
    }

    fn search_all(&mut self) -> Result<Vec<u32>, TransportError> {
        let uids = self
            .session
            .uid_search("ALL")
            .map_err(|e| TransportError::ImapError(e.to_string()))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn search_sequence_range(&mut self, start: u32, end: u32) -> Result<Vec<u32>, TransportError> {
        let fetches = self
            .session
            .fetch(format!("{}:{}", start, end), "(UID)")
            .map_err(|e| TransportError::ImapError(e.to_string()))?;
        Ok(fetches.iter().filter_map(|f| f.uid).collect())
    }

    fn search_date_range(
        &mut self,
        since: NaiveDate,
        before: NaiveDate,
    ) -> Result<Vec<u32>, TransportError> {
        let query = format!("SINCE {} BEFORE {}", imap_date(since), imap_date(before));
        let uids = self
            .session
            .uid_search(&query)
            .map_err(|e| TransportError::ImapError(e.to_string()))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch(&mut self, uid: u32, kind: FetchKind) -> Result<Option<Vec<u8>>, TransportError> {
        let fetches = self
            .session
            .uid_fetch(uid.to_string(), kind.query())
            .map_err(|e| TransportError::ImapError(e.to_string()))?;
        for fetch in fetches.iter() {
            let data = match kind {
                FetchKind::Headers => fetch.header(),
                FetchKind::Full => fetch.body(),
            };
            if let Some(bytes) = data {
                return Ok(Some(bytes.to_vec()));
            }
        }
        Ok(None)
    }

    fn list_mailboxes(&mut self) -> Result<Vec<String>, TransportError> {
        let names = self
            .session
            .list(None, Some("*"))
            .map_err(|e| TransportError::ImapError(e.to_string()))?;
        Ok(names
            .iter()
            .map(|n| String::from_utf8_lossy(n.name().as_bytes()).into_owned())
            .collect())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.session
            .logout()
            .map_err(|e| TransportError::ImapError(e.to_string()))?;
        self.current_mailbox = None;
        Ok(())
    }
}
