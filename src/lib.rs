pub mod attachments;
pub mod checkpoint;
pub mod config;
pub mod database;
pub mod discovery;
pub mod sync;
pub mod transport;

pub use attachments::{extract_attachments, ExtractionStats};
pub use checkpoint::{CheckpointManager, SyncMode};
pub use config::{AccountConfig, Config, ImapSecurity, SyncSettings};
pub use database::{MailStore, SyncRunStatus};
pub use discovery::{DiscoveryStrategy, UidDiscovery};
pub use sync::{sync_full, sync_headers, CancelFlag, RunSummary, SyncError};
pub use transport::{FetchKind, ImapTransport, MailboxTransport, TransportError};
