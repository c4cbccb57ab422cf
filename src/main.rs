use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};

use mailstash::{
    extract_attachments, sync_full, sync_headers, CancelFlag, Config, ImapTransport, MailStore,
    MailboxTransport, SyncError, SyncMode,
};

/// Incremental IMAP mailbox mirror: headers first, full messages second,
/// deduplicated attachments third, all resumable mid-mailbox.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file
    #[clap(short, long, default_value = "~/.config/mailstash/config.json")]
    config: String,

    /// Override the database path from the config file
    #[clap(long)]
    db: Option<String>,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config file to edit by hand
    Setup,

    /// Fetch header rows for messages not yet mirrored
    Headers {
        /// Mailbox to sync
        #[clap(short, long, default_value = "INBOX")]
        mailbox: String,
    },

    /// Fetch full raw messages for every known header
    Full {
        /// Mailbox to sync
        #[clap(short, long, default_value = "INBOX")]
        mailbox: String,
    },

    /// Extract and deduplicate attachments from stored full messages
    Attachments {
        /// Mailbox to scan
        #[clap(short, long, default_value = "INBOX")]
        mailbox: String,
    },

    /// List mailboxes on the server
    ListMailboxes,

    /// Show mirror progress and recent run history
    Status {
        /// Mailbox to report on
        #[clap(short, long, default_value = "INBOX")]
        mailbox: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let config_path = shellexpand::tilde(&args.config).into_owned();

    if let Commands::Setup = args.command {
        if Path::new(&config_path).exists() {
            println!("Config already exists at {}", config_path);
            return Ok(());
        }
        let config = Config::default();
        config.save(&config_path)?;
        println!("Wrote default config to {}", config_path);
        println!("Edit it with your IMAP server and credentials, then run:");
        println!("  mailstash headers");
        return Ok(());
    }

    let config = Config::load(&config_path)?;
    let db_path = shellexpand::tilde(args.db.as_deref().unwrap_or(&config.database_path))
        .into_owned();

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; finishing the current message and saving progress");
                cancel.cancel();
            }
        });
    }

    let command = args.command;
    let result = tokio::task::spawn_blocking(move || {
        run_command(command, &config, Path::new(&db_path), cancel)
    })
    .await?;

    match result {
        Ok(()) => Ok(()),
        Err(SyncError::Interrupted) => {
            info!("Stopped at operator request; progress was saved");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_command(
    command: Commands,
    config: &Config,
    db_path: &Path,
    cancel: CancelFlag,
) -> Result<(), SyncError> {
    match command {
        Commands::Setup => unreachable!("handled before connecting"),
        Commands::Headers { mailbox } => {
            let store = MailStore::open(db_path)?;
            let mut transport = ImapTransport::connect(&config.account)?;
            let outcome = sync_headers(&store, &mut transport, &config.sync, &mailbox, cancel);
            if let Err(e) = transport.close() {
                warn!("IMAP logout failed: {}", e);
            }
            let summary = outcome?;
            store.close()?;
            println!(
                "Headers: {} saved, {} failed, {} attempted",
                summary.saved, summary.failed, summary.processed
            );
        }
        Commands::Full { mailbox } => {
            let store = MailStore::open(db_path)?;
            let mut transport = ImapTransport::connect(&config.account)?;
            let outcome = sync_full(&store, &mut transport, &config.sync, &mailbox, cancel);
            if let Err(e) = transport.close() {
                warn!("IMAP logout failed: {}", e);
            }
            let summary = outcome?;
            store.close()?;
            println!(
                "Full messages: {} saved, {} failed, {} attempted",
                summary.saved, summary.failed, summary.processed
            );
        }
        Commands::Attachments { mailbox } => {
            let store = MailStore::open(db_path)?;
            let stats = extract_attachments(&store, &config.sync, &mailbox, cancel)?;
            store.close()?;
            println!(
                "Attachments: {} mappings ({} new blobs) from {} messages, {} failed",
                stats.new_mappings, stats.new_blobs, stats.scanned, stats.failed
            );
        }
        Commands::ListMailboxes => {
            let mut transport = ImapTransport::connect(&config.account)?;
            for name in transport.list_mailboxes()? {
                println!("{}", name);
            }
            if let Err(e) = transport.close() {
                warn!("IMAP logout failed: {}", e);
            }
        }
        Commands::Status { mailbox } => {
            let store = MailStore::open(db_path)?;
            print_status(&store, &mailbox, config.sync.max_uid_retries)?;
            store.close()?;
        }
    }
    Ok(())
}

fn print_status(store: &MailStore, mailbox: &str, max_retries: u32) -> Result<(), SyncError> {
    println!("Mailbox: {}", mailbox);
    println!("  headers:       {}", store.header_count(mailbox)?);
    println!(
        "  full messages: {}",
        store.full_message_uids(mailbox)?.len()
    );
    println!("  attachments:   {} mappings", store.mapping_count(mailbox)?);
    println!("  unique blobs:  {} (store-wide)", store.unique_blob_count()?);

    for mode in [SyncMode::Headers, SyncMode::Full, SyncMode::Attachments] {
        if let Some((last_uid, in_progress, updated_at)) =
            store.load_checkpoint_state(mode.as_str(), mailbox)?
        {
            let failed = store.load_failed_uids(mode.as_str(), mailbox)?;
            let mut permanent: Vec<u32> = failed
                .iter()
                .filter(|(_, &count)| count >= max_retries)
                .map(|(&uid, _)| uid)
                .collect();
            permanent.sort_unstable();
            println!(
                "  {:<12} last UID {}, {} failed UIDs{}{}",
                format!("{}:", mode.as_str()),
                last_uid,
                failed.len(),
                if in_progress {
                    " (interrupted mid-run)"
                } else {
                    ""
                },
                updated_at
                    .map(|t| format!(", updated {}", t))
                    .unwrap_or_default()
            );
            if !permanent.is_empty() {
                println!("    permanently failed (>= {} tries): {:?}", max_retries, permanent);
            }
        }
    }

    let runs = store.recent_sync_runs(10)?;
    if !runs.is_empty() {
        println!("Recent runs:");
        for run in runs {
            println!(
                "  [{}] {} {} {}",
                run.id,
                run.start_time,
                run.status,
                run.message.unwrap_or_default()
            );
        }
    }
    Ok(())
}
