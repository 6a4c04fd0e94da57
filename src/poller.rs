//! Mailbox ingestion poller.
//!
//! Runs as a long-lived async task on a fixed tick. Each tick iterates the
//! connections due for sync sequentially; one connection's failure is logged
//! and never aborts the tick for the others. The ledger's uniqueness
//! constraint makes overlapping cycles safe without application locking.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::classify::Classifier;
use crate::db::ledger::LedgerOutcome;
use crate::db::{DbConnection, DbTenant, TaskDb};
use crate::executor::process_message;
use crate::mailbox::{
    is_system_sender, normalize_subject, ImapMailbox, Mailbox, MailSummary,
};
use crate::notify::EmailSender;
use crate::state::AppState;

/// Poll loop tick.
pub const POLL_TICK_SECS: u64 = 60;

/// Look-back window for the mailbox search. Read flags are unreliable across
/// forwarding rules, so everything recent is a candidate and the ledger
/// decides.
pub const LOOKBACK_DAYS: i64 = 7;

/// Upper bound on messages classified per connection per cycle, newest first.
pub const BATCH_CAP: usize = 20;

/// Counts for one connection's poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub items_seen: usize,
    pub items_processed: usize,
    pub duplicates_skipped: usize,
}

/// A connection is due when its sync interval has elapsed since the last
/// stamp. Never-synced connections are always due.
pub fn connection_due(conn: &DbConnection, now: DateTime<Utc>) -> bool {
    match conn
        .last_sync_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        Some(last) => {
            now >= last.with_timezone(&Utc) + Duration::minutes(conn.sync_frequency_mins)
        }
        None => true,
    }
}

/// Candidate selection for one cycle, applied to the listed envelopes:
/// subtract ledger hits, collapse same-cycle near-duplicate subjects, order
/// newest-first, cap the batch.
///
/// Returns (to_process, to_ledger_only) where the second list is the
/// same-cycle subject duplicates that get ledger-marked without
/// classification.
fn select_candidates(
    summaries: Vec<MailSummary>,
    already_processed: &HashSet<String>,
) -> (Vec<MailSummary>, Vec<MailSummary>) {
    let mut fresh: Vec<MailSummary> = summaries
        .into_iter()
        .filter(|s| {
            let by_message_id = s
                .message_id
                .as_deref()
                .map(|id| already_processed.contains(id))
                .unwrap_or(false);
            let by_server_id = already_processed.contains(&s.server_id.to_string());
            !by_message_id && !by_server_id
        })
        .collect();

    // Newest first, so the batch cap drops the oldest candidates.
    fresh.sort_by(|a, b| b.received_at.cmp(&a.received_at));

    let mut seen_subjects: HashSet<String> = HashSet::new();
    let mut to_process = Vec::new();
    let mut subject_dupes = Vec::new();

    for summary in fresh {
        let normalized = normalize_subject(&summary.subject);
        if !normalized.is_empty() && !seen_subjects.insert(normalized) {
            // A re-forward of something this same cycle already covers.
            subject_dupes.push(summary);
            continue;
        }
        if to_process.len() < BATCH_CAP {
            to_process.push(summary);
        }
    }

    (to_process, subject_dupes)
}

/// Run one poll cycle for one connection over an already-open mailbox.
///
/// Every candidate — classified, failed to fetch, or skipped as duplicate —
/// ends up in the ledger exactly once. `last_sync_at` is stamped by the
/// caller unconditionally.
pub async fn poll_connection(
    db: &TaskDb,
    tenant: &DbTenant,
    conn: &DbConnection,
    mailbox: &mut dyn Mailbox,
    classifier: &dyn Classifier,
    mailer: &dyn EmailSender,
    base_url: &str,
    now: DateTime<Utc>,
) -> Result<PollStats, String> {
    let since = (now - Duration::days(LOOKBACK_DAYS)).date_naive();
    let summaries = mailbox
        .list_since(since)
        .await
        .map_err(|e| format!("Mailbox listing failed: {e}"))?;

    let mut stats = PollStats {
        items_seen: summaries.len(),
        ..Default::default()
    };

    let already = db.processed_identifiers(&conn.id)?;
    let (candidates, subject_dupes) = select_candidates(summaries, &already);

    // Near-duplicate forwards: ledger-marked, never classified.
    for dupe in &subject_dupes {
        let identifier = dupe
            .message_id
            .clone()
            .unwrap_or_else(|| dupe.server_id.to_string());
        db.record_processed_item(
            Some(&conn.id),
            &identifier,
            Some(&dupe.server_id.to_string()),
            Some(&dupe.sender),
            Some(&dupe.subject),
        )?;
        stats.duplicates_skipped += 1;
    }

    // Mail from the relay inbox itself (our own confirmations and reminders
    // bouncing back) is skipped; the tenant's personal addresses are not —
    // that is where forwarded tasks come from.
    let own_senders = vec![conn.mailbox_address.to_lowercase()];
    let transcription_senders = tenant.transcription_sender_list();

    for candidate in &candidates {
        // Automated senders are recorded but not worth a classification call.
        if is_system_sender(&candidate.sender, &own_senders, &transcription_senders) {
            let identifier = candidate
                .message_id
                .clone()
                .unwrap_or_else(|| candidate.server_id.to_string());
            db.record_processed_item(
                Some(&conn.id),
                &identifier,
                Some(&candidate.server_id.to_string()),
                Some(&candidate.sender),
                Some(&candidate.subject),
            )?;
            stats.duplicates_skipped += 1;
            continue;
        }

        let message = match mailbox.fetch_message(candidate.server_id).await {
            Ok(message) => message,
            Err(e) => {
                log::warn!(
                    "Fetch failed for item {} on {}: {e}",
                    candidate.server_id,
                    conn.mailbox_address
                );
                // Synthetic identifier so a permanently broken item is never
                // retried forever.
                let synthetic =
                    format!("fetch-failed:{}@{}", candidate.server_id, conn.id);
                db.record_processed_item(
                    Some(&conn.id),
                    &synthetic,
                    Some(&candidate.server_id.to_string()),
                    Some(&candidate.sender),
                    Some(&candidate.subject),
                )?;
                continue;
            }
        };

        // Record first: re-runs must see this item as handled even if
        // processing below fails mid-way. A conflict means an overlapping
        // cycle won the insert — this item is theirs, skip it.
        let outcome = db.record_processed_item(
            Some(&conn.id),
            &message.message_id,
            Some(&message.server_id.to_string()),
            Some(&message.sender_address),
            Some(&message.subject),
        )?;
        if outcome == LedgerOutcome::AlreadyProcessed {
            stats.duplicates_skipped += 1;
            continue;
        }

        match process_message(db, tenant, classifier, mailer, base_url, &message, now).await {
            Ok(outcome) => {
                log::info!(
                    "Processed '{}': {} auto, {} queued",
                    message.subject,
                    outcome.auto_executed,
                    outcome.queued_for_approval
                );
                stats.items_processed += 1;
            }
            Err(e) => {
                log::warn!("Processing failed for '{}': {e}", message.subject);
            }
        }

        if let Err(e) = mailbox.mark_seen(candidate.server_id).await {
            log::debug!("Could not flag item {} seen: {e}", candidate.server_id);
        }
    }

    Ok(stats)
}

/// The long-lived poll loop: every tick, sync the due connections.
///
/// Each tick opens its own database handle; background loops never share a
/// connection, the storage layer's constraints do the coordinating.
pub async fn run_poller(state: Arc<AppState>) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(POLL_TICK_SECS)).await;

        let db = match TaskDb::open() {
            Ok(db) => db,
            Err(e) => {
                log::error!("Poller could not open database: {e}");
                continue;
            }
        };

        let now = Utc::now();
        if let Err(e) = poll_due_connections(&db, &state, now).await {
            log::error!("Poll tick failed: {e}");
        }
    }
}

/// One poll tick: iterate due connections sequentially.
async fn poll_due_connections(
    db: &TaskDb,
    state: &AppState,
    now: DateTime<Utc>,
) -> Result<(), String> {
    let connections = db.get_active_connections()?;

    for conn in connections.into_iter().filter(|c| connection_due(c, now)) {
        let Some(tenant) = db.get_tenant(&conn.tenant_id)? else {
            log::warn!("Connection {} has no tenant {}", conn.id, conn.tenant_id);
            continue;
        };

        match ImapMailbox::connect(&conn).await {
            Ok(mut mailbox) => {
                let result = poll_connection(
                    db,
                    &tenant,
                    &conn,
                    &mut mailbox,
                    state.classifier.as_ref(),
                    state.mailer.as_ref(),
                    &state.config.base_url,
                    now,
                )
                .await;
                match result {
                    Ok(stats) => {
                        log::info!(
                            "Polled {}: {} seen, {} processed, {} duplicates",
                            conn.mailbox_address,
                            stats.items_seen,
                            stats.items_processed,
                            stats.duplicates_skipped
                        );
                    }
                    Err(e) => {
                        log::warn!("Poll failed for {}: {e}", conn.mailbox_address);
                    }
                }
                let _ = mailbox.logout().await;
            }
            Err(e) => {
                let err = crate::error::PipelineError::from(e);
                if err.is_transient() {
                    // Skipped this tick, retried next tick.
                    log::warn!("Could not open mailbox {}: {err}", conn.mailbox_address);
                } else {
                    log::error!("Mailbox {} failed: {err}", conn.mailbox_address);
                }
            }
        }

        // Stamp unconditionally, even on failure or zero-result cycles, so
        // the next-due calculation advances.
        db.stamp_last_sync(&conn.id, now)?;
    }

    Ok(())
}

#[cfg(test)]
pub mod test_utils {
    use async_trait::async_trait;
    use chrono::NaiveDate;

    use crate::mailbox::{Mailbox, MailboxError, MailMessage, MailSummary};

    /// In-memory mailbox fake for driving the poller.
    pub struct FakeMailbox {
        pub summaries: Vec<MailSummary>,
        pub messages: Vec<MailMessage>,
        /// Server ids whose body fetch should fail.
        pub broken: Vec<u32>,
        pub seen: Vec<u32>,
    }

    impl FakeMailbox {
        pub fn new(summaries: Vec<MailSummary>, messages: Vec<MailMessage>) -> Self {
            Self {
                summaries,
                messages,
                broken: Vec::new(),
                seen: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Mailbox for FakeMailbox {
        async fn list_since(
            &mut self,
            _since: NaiveDate,
        ) -> Result<Vec<MailSummary>, MailboxError> {
            Ok(self.summaries.clone())
        }

        async fn fetch_message(&mut self, server_id: u32) -> Result<MailMessage, MailboxError> {
            if self.broken.contains(&server_id) {
                return Err(MailboxError::Fetch(server_id));
            }
            self.messages
                .iter()
                .find(|m| m.server_id == server_id)
                .cloned()
                .ok_or(MailboxError::Fetch(server_id))
        }

        async fn mark_seen(&mut self, server_id: u32) -> Result<(), MailboxError> {
            self.seen.push(server_id);
            Ok(())
        }

        async fn logout(&mut self) -> Result<(), MailboxError> {
            Ok(())
        }
    }
}
