//! Tiered execution of classified actions.
//!
//! For one inbound message: classify, resolve the counterpart against
//! existing open tasks, downgrade duplicate creates to note-appends, execute
//! the auto tier immediately, and queue the approval tier behind single-use
//! tokens bundled into one approval email.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::actions::{ActionCommon, ActionRecord, ActionTier, ExtractedAction};
use crate::classify::{classify_message, Classifier};
use crate::db::tasks::NewTask;
use crate::db::{DbTenant, TaskDb};
use crate::mailbox::MailMessage;
use crate::matcher::find_existing_task;
use crate::notify::{
    approval_email_html, confirmation_email_html, send_spacing, EmailSender, QueuedApproval,
};

/// Counts for one processed message.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessOutcome {
    pub auto_executed: usize,
    pub queued_for_approval: usize,
}

/// Generate a single-use approval token: 32 hex chars (128 bits) derived from
/// 16 random bytes, a fresh UUID, and the current instant.
pub fn generate_token() -> String {
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);

    let mut hasher = Sha256::new();
    hasher.update(random);
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.update(Utc::now().to_rfc3339().as_bytes());
    let digest = hasher.finalize();

    hex::encode(digest)[..32].to_string()
}

/// Next business day from `date`, skipping Saturday and Sunday.
fn next_business_day(date: NaiveDate) -> NaiveDate {
    let mut next = date + Duration::days(1);
    while matches!(next.weekday(), Weekday::Sat | Weekday::Sun) {
        next += Duration::days(1);
    }
    next
}

/// Default due slot for a new task without one: today 09:00 when it is still
/// before 09:00 tenant-local, otherwise the next business day 09:00.
fn default_due(tz: Tz, now: DateTime<Utc>) -> (String, String) {
    use chrono::Timelike;
    let local = now.with_timezone(&tz);
    let date = if local.hour() < 9 {
        local.date_naive()
    } else {
        next_business_day(local.date_naive())
    };
    (date.format("%Y-%m-%d").to_string(), "09:00".to_string())
}

/// Process one already-fetched message end to end.
///
/// Classification cannot fail (fallback inside); individual action failures
/// are logged and do not abort the rest of the message's actions.
pub async fn process_message(
    db: &TaskDb,
    tenant: &DbTenant,
    classifier: &dyn Classifier,
    mailer: &dyn EmailSender,
    base_url: &str,
    message: &MailMessage,
    now: DateTime<Utc>,
) -> Result<ProcessOutcome, String> {
    let sender_tasks = db.open_tasks_by_address(&tenant.id, &message.sender_address)?;
    let classification =
        classify_message(classifier, tenant, message, &sender_tasks, now).await;

    if classification.actions.is_empty() {
        log::info!("No actionable items in '{}'", message.subject);
        return Ok(ProcessOutcome::default());
    }

    let counterpart_name = classification
        .counterpart
        .as_ref()
        .and_then(|c| c.name.clone())
        .unwrap_or_else(|| message.sender_name.clone());
    let counterpart_address = classification
        .counterpart
        .as_ref()
        .and_then(|c| c.address.clone())
        .unwrap_or_else(|| message.sender_address.clone());

    let mut outcome = ProcessOutcome::default();
    let mut approvals: Vec<(String, ActionRecord)> = Vec::new();

    for record in &classification.actions {
        let matched = find_existing_task(
            db,
            tenant,
            Some(&counterpart_address),
            Some(&counterpart_name),
            &record.keywords,
        )?;

        let mut action: ExtractedAction = record.clone().into();

        // An open task for the same counterpart means this is a follow-up:
        // thread it as a note instead of creating a duplicate.
        let downgraded = match (&action, &matched) {
            (ExtractedAction::CreateTask(common), Some(_)) => {
                Some(ExtractedAction::UpdateTaskNotes {
                    note: if common.description.is_empty() {
                        common.title.clone()
                    } else {
                        common.description.clone()
                    },
                    common: common.clone(),
                })
            }
            _ => None,
        };
        if let Some(replacement) = downgraded {
            action = replacement;
        }

        match action.tier() {
            ActionTier::Auto => {
                match execute_auto(db, tenant, mailer, &action, matched.as_ref().map(|t| t.id.as_str()), message, now).await {
                    Ok(()) => outcome.auto_executed += 1,
                    Err(e) => {
                        log::warn!("Auto action '{}' failed: {e}", action.common().title);
                    }
                }
            }
            ActionTier::Approval => {
                let token = generate_token();
                let payload = serde_json::to_string(record)
                    .map_err(|e| format!("Failed to serialize action payload: {e}"))?;
                db.insert_pending_action(
                    &token,
                    &tenant.id,
                    action.kind(),
                    &payload,
                    Some(&message.subject),
                )?;
                approvals.push((token, record.clone()));
            }
        }
    }

    if !approvals.is_empty() {
        let queued: Vec<QueuedApproval<'_>> = approvals
            .iter()
            .map(|(token, action)| QueuedApproval {
                token: token.as_str(),
                action,
            })
            .collect();
        let html = approval_email_html(
            base_url,
            &message.subject,
            &message.sender_address,
            &classification.summary,
            &queued,
        );
        let subject = format!("Approval needed: {}", message.subject);

        match mailer.send(&tenant.notify_address, &subject, &html).await {
            Ok(()) => {
                log::info!(
                    "Approval email sent for {} action(s) from '{}'",
                    approvals.len(),
                    message.subject
                );
            }
            Err(e) => {
                // Pending rows stay queued; the edit/view link still works.
                log::warn!("Failed to send approval email: {e}");
            }
        }
        send_spacing().await;
        outcome.queued_for_approval = approvals.len();
    }

    Ok(outcome)
}

/// Execute a Tier 1 action immediately.
async fn execute_auto(
    db: &TaskDb,
    tenant: &DbTenant,
    mailer: &dyn EmailSender,
    action: &ExtractedAction,
    matched_task_id: Option<&str>,
    message: &MailMessage,
    now: DateTime<Utc>,
) -> Result<(), String> {
    match action {
        ExtractedAction::UpdateTaskNotes { common, note } => {
            match matched_task_id {
                Some(task_id) => {
                    let content = format!("{note}\n\n(from email: {})", message.subject);
                    db.append_note(task_id, &content, "email")?;
                    log::info!("Note appended to task {task_id}");
                    Ok(())
                }
                // The service asked for a note but there is nothing to thread
                // onto; a task is the safe landing spot.
                None => {
                    let task = insert_from_common(db, tenant, common, now)?;
                    log::info!("Task created: {} ({})", task.title, task.id);
                    send_confirmation(mailer, tenant, &task).await;
                    Ok(())
                }
            }
        }
        ExtractedAction::CreateTask(common)
        | ExtractedAction::SetCallback(common)
        | ExtractedAction::SetReminder(common) => {
            // Final re-check inside one transaction: another action in this
            // batch (or an overlapping cycle) may have just created the same
            // task, and the check must not race the insert.
            let created = db.with_transaction(|db| {
                let already = find_existing_task(
                    db,
                    tenant,
                    common.counterpart_address.as_deref(),
                    common.counterpart_name.as_deref(),
                    &[],
                )?;
                match already {
                    Some(task) => {
                        let content = format!(
                            "{}\n\n(from email: {})",
                            if common.description.is_empty() {
                                &common.title
                            } else {
                                &common.description
                            },
                            message.subject
                        );
                        db.append_note(&task.id, &content, "email")?;
                        log::info!(
                            "Duplicate create collapsed into note on task {}",
                            task.id
                        );
                        Ok(None)
                    }
                    None => Ok(Some(insert_from_common(db, tenant, common, now)?)),
                }
            })?;

            if let Some(task) = created {
                log::info!("Task created: {} ({})", task.title, task.id);
                send_confirmation(mailer, tenant, &task).await;
            }
            Ok(())
        }
        other => Err(format!(
            "Action type '{}' is not auto-executable",
            other.kind()
        )),
    }
}

/// Insert a task from an action's common fields, defaulting the due slot.
fn insert_from_common(
    db: &TaskDb,
    tenant: &DbTenant,
    common: &ActionCommon,
    now: DateTime<Utc>,
) -> Result<crate::db::DbTask, String> {
    let tz: Tz = tenant.timezone.parse().unwrap_or(chrono_tz::UTC);

    let (due_date, due_time) = match (&common.due_date, &common.due_time) {
        (Some(date), Some(time)) => (Some(date.clone()), Some(time.clone())),
        (Some(date), None) => (Some(date.clone()), Some("09:00".to_string())),
        (None, _) => {
            let (date, time) = default_due(tz, now);
            (Some(date), Some(time))
        }
    };

    db.insert_task(&NewTask {
        tenant_id: tenant.id.clone(),
        title: common.title.clone(),
        description: common.description.clone(),
        counterpart_name: common.counterpart_name.clone(),
        counterpart_address: common.counterpart_address.clone(),
        due_date,
        due_time,
        priority: common.priority.clone(),
    })
}

/// Send the task-created confirmation. Failures never fail the action.
async fn send_confirmation(mailer: &dyn EmailSender, tenant: &DbTenant, task: &crate::db::DbTask) {
    let (subject, html) = confirmation_email_html(task);
    if let Err(e) = mailer.send(&tenant.notify_address, &subject, &html).await {
        log::warn!("Failed to send confirmation email for {}: {e}", task.id);
    }
    send_spacing().await;
}
