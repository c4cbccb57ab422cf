use anyhow::anyhow;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::checkpoint::{CheckpointManager, SyncMode};
use crate::config::SyncSettings;
use crate::database::{MailStore, SyncRunStatus};
use crate::sync::{CancelFlag, SyncError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionStats {
    pub scanned: usize,
    pub new_blobs: usize,
    pub new_mappings: usize,
    pub failed: usize,
}

/// One attachment lifted out of a MIME part, before hashing.
struct ExtractedPart {
    filename: String,
    data: Vec<u8>,
}

/// Scans stored full messages that are flagged as carrying attachments and
/// have no mapping rows yet, and files each attachment payload under its
/// SHA-256. Identical payloads across messages or mailboxes share one blob
/// row; the mapping table records every (message, filename) occurrence.
pub fn extract_attachments(
    store: &MailStore,
    settings: &SyncSettings,
    mailbox: &str,
    cancel: CancelFlag,
) -> Result<ExtractionStats, SyncError> {
    store.begin()?;
    let mut checkpoint = CheckpointManager::new(
        store,
        SyncMode::Attachments,
        mailbox,
        settings.checkpoint_save_interval,
    );
    if checkpoint.was_interrupted()? {
        warn!(
            "Previous attachment extraction for {} did not complete cleanly",
            mailbox
        );
    }
    checkpoint.mark_start()?;
    let run_id = store.log_sync_start(&format!("Starting attachment extraction for {}", mailbox))?;

    let result = extract_loop(store, settings, mailbox, &cancel, &mut checkpoint);

    match result {
        Ok(stats) => {
            checkpoint.save_state()?;
            let (status, message) = if stats.new_mappings > 0 {
                (
                    SyncRunStatus::Completed,
                    format!(
                        "Extracted {} attachments ({} new blobs) from {} messages",
                        stats.new_mappings, stats.new_blobs, stats.scanned
                    ),
                )
            } else {
                (
                    SyncRunStatus::CompletedNoChanges,
                    format!("No new attachments found in {}", mailbox),
                )
            };
            store.log_sync_end(run_id, status, &message)?;
            checkpoint.mark_complete()?;
            if !store.commit_with_retry() {
                warn!("Final commit failed; latest extraction progress may be lost");
            }
            info!("{}", message);
            Ok(stats)
        }
        Err(SyncError::Interrupted) => {
            warn!("Attachment extraction interrupted; saving progress");
            if let Err(e) = checkpoint.save_state() {
                warn!("Failed to save checkpoint state on interrupt: {}", e);
            }
            store.log_sync_end(run_id, SyncRunStatus::Interrupted, "Interrupted by operator")?;
            checkpoint.mark_complete()?;
            store.commit_with_retry();
            Err(SyncError::Interrupted)
        }
        Err(e) => {
            let message: String = e.to_string().chars().take(200).collect();
            if let Err(log_err) = store.log_sync_end(run_id, SyncRunStatus::Error, &message) {
                warn!("Failed to record extraction error: {}", log_err);
            }
            if let Err(cp_err) = checkpoint.mark_complete() {
                warn!("Failed to clear in-progress marker: {}", cp_err);
            }
            store.commit_with_retry();
            Err(e)
        }
    }
}

fn extract_loop(
    store: &MailStore,
    settings: &SyncSettings,
    mailbox: &str,
    cancel: &CancelFlag,
    checkpoint: &mut CheckpointManager,
) -> Result<ExtractionStats, SyncError> {
    let permanent = checkpoint.permanently_failed_uids(settings.max_uid_retries)?;
    if !permanent.is_empty() {
        warn!(
            "Skipping {} messages in {} that repeatedly failed to parse",
            permanent.len(),
            mailbox
        );
    }

    let candidates = store.full_messages_needing_attachment_scan(mailbox)?;
    info!(
        "{} stored messages in {} need an attachment scan",
        candidates.len(),
        mailbox
    );

    let mut stats = ExtractionStats::default();
    let mut since_commit = 0usize;

    for (uid, msg_mailbox, raw) in candidates {
        if cancel.is_cancelled() {
            return Err(SyncError::Interrupted);
        }
        if permanent.binary_search(&uid).is_ok() {
            continue;
        }

        match scan_message(&raw) {
            Ok(parts) => {
                stats.scanned += 1;
                for part in parts {
                    let sha256 = hex::encode(Sha256::digest(&part.data));
                    let blobs_before = store.unique_blob_count()?;
                    store.insert_blob_if_absent(&sha256, &part.data, part.data.len())?;
                    if store.unique_blob_count()? > blobs_before {
                        stats.new_blobs += 1;
                    } else {
                        debug!(
                            "Blob {} already stored; adding mapping only",
                            &sha256[..12]
                        );
                    }
                    store.insert_mapping_if_absent(uid, &msg_mailbox, &sha256, &part.filename)?;
                    stats.new_mappings += 1;
                }
                checkpoint.update_progress(uid)?;
                checkpoint.clear_failed_uid(uid)?;
            }
            Err(e) => {
                debug!("Failed to scan UID {} in {}: {}", uid, msg_mailbox, e);
                checkpoint.add_failed_uid(uid)?;
                stats.failed += 1;
            }
        }

        since_commit += 1;
        if since_commit >= settings.commit_interval.max(1) {
            checkpoint.save_state()?;
            if !store.commit_with_retry() {
                warn!("Store commit failed after retries; continuing with staged data");
            }
            since_commit = 0;
        }
    }

    Ok(stats)
}

fn scan_message(raw: &[u8]) -> anyhow::Result<Vec<ExtractedPart>> {
    let parsed = mail_parser::Message::parse(raw)
        .ok_or_else(|| anyhow!("message bytes did not parse as MIME"))?;

    let mut extracted = Vec::new();
    for (index, part) in parsed.parts.iter().enumerate() {
        if let Some(part) = extract_part(part, index) {
            extracted.push(part);
        }
    }
    Ok(extracted)
}

/// Pulls the payload out of one MIME part if it looks like an attachment:
/// an explicit attachment disposition, or a named non-container part.
/// Container parts and empty payloads yield nothing.
fn extract_part(part: &mail_parser::MessagePart, index: usize) -> Option<ExtractedPart> {
    let mut filename: Option<String> = None;
    let mut content_type = String::from("application/octet-stream");
    let mut is_attachment = false;

    for header in &part.headers {
        let name = header.name().to_string().to_lowercase();
        if let mail_parser::HeaderValue::ContentType(ct) = &header.value {
            if name == "content-disposition" {
                let disposition = ct.ctype().to_lowercase();
                if disposition == "attachment" || disposition == "inline" {
                    is_attachment = disposition == "attachment";
                    if let Some(value) = ct.attribute("filename") {
                        filename = Some(value.to_string());
                    }
                }
            } else if name == "content-type" {
                content_type = match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                };
                if filename.is_none() {
                    if let Some(value) = ct.attribute("name") {
                        filename = Some(value.to_string());
                    }
                }
            }
        }
    }

    let data = match &part.body {
        mail_parser::PartType::Binary(bytes) | mail_parser::PartType::InlineBinary(bytes) => {
            bytes.to_vec()
        }
        // Textual parts are only attachments when the disposition or a
        // filename says so; otherwise they are the message body.
        mail_parser::PartType::Text(text) if is_attachment || filename.is_some() => {
            text.as_bytes().to_vec()
        }
        mail_parser::PartType::Html(html) if is_attachment || filename.is_some() => {
            html.as_bytes().to_vec()
        }
        _ => return None,
    };
    if data.is_empty() {
        return None;
    }
    if !is_attachment && filename.is_none() {
        return None;
    }

    let filename = filename.unwrap_or_else(|| {
        let extension = content_type.rsplit('/').next().unwrap_or("bin");
        format!("attachment_{}.{}", index, extension)
    });
    Some(ExtractedPart { filename, data })
}
