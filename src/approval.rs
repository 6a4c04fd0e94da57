//! Pending-action approval state machine.
//!
//! `pending → {approved | rejected | failed}` via the click handlers,
//! `pending → expired` only via the scheduler's GC. Every transition is an
//! atomic conditional update, so a double-click observes a non-pending status
//! and gets an "already processed" outcome with no side effects.

use chrono::Utc;

use crate::actions::{ActionRecord, ExtractedAction};
use crate::crm::{push_note, CrmConnector};
use crate::db::tasks::NewTask;
use crate::db::{DbPendingAction, DbTenant, TaskDb};

/// Outcome of an approve/reject click, rendered by the web layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    Approved { message: String },
    Rejected,
    Failed { message: String },
    /// The token exists but was already taken out of `pending`; the stored
    /// status is returned verbatim. Not an error.
    AlreadyProcessed { status: String },
    NotFound,
}

/// Read-only snapshot of a queued action for the edit/view page.
#[derive(Debug, Clone)]
pub struct ActionView {
    pub action_type: String,
    pub title: String,
    pub description: String,
    pub counterpart_name: Option<String>,
    pub status: String,
    /// Approve/Reject buttons render only while the action is still pending.
    pub actionable: bool,
}

fn parse_payload(row: &DbPendingAction) -> ActionRecord {
    serde_json::from_str(&row.action_data).unwrap_or_else(|e| {
        log::warn!("Corrupt pending payload for token {}: {e}", row.token);
        ActionRecord {
            action_type: row.action_type.clone(),
            title: "Stored action".to_string(),
            ..Default::default()
        }
    })
}

/// Approve a queued action: execute its type-specific effect, then transition
/// to approved or failed based on the outcome. Idempotent per token.
pub async fn approve(
    db: &TaskDb,
    crm: Option<&dyn CrmConnector>,
    token: &str,
) -> Result<ApprovalOutcome, String> {
    let Some(row) = db.get_pending_action(token)? else {
        return Ok(ApprovalOutcome::NotFound);
    };
    if row.status != "pending" {
        return Ok(ApprovalOutcome::AlreadyProcessed { status: row.status });
    }

    let Some(tenant) = db.get_tenant(&row.tenant_id)? else {
        return Err(format!("Tenant {} not found for token", row.tenant_id));
    };

    let record = parse_payload(&row);
    let (success, message) = execute_approved(db, &tenant, crm, &record).await;

    let to_status = if success { "approved" } else { "failed" };
    // The conditional update is the real guard: if a concurrent click won the
    // race between our status read and here, record nothing twice.
    if !db.transition_pending_action(token, to_status)? {
        let current = db
            .get_pending_action(token)?
            .map(|r| r.status)
            .unwrap_or_else(|| "unknown".to_string());
        return Ok(ApprovalOutcome::AlreadyProcessed { status: current });
    }

    if success {
        Ok(ApprovalOutcome::Approved { message })
    } else {
        Ok(ApprovalOutcome::Failed { message })
    }
}

/// Reject a queued action. No side effect beyond the transition.
pub fn reject(db: &TaskDb, token: &str) -> Result<ApprovalOutcome, String> {
    let Some(row) = db.get_pending_action(token)? else {
        return Ok(ApprovalOutcome::NotFound);
    };
    if row.status != "pending" {
        return Ok(ApprovalOutcome::AlreadyProcessed { status: row.status });
    }

    if !db.transition_pending_action(token, "rejected")? {
        let current = db
            .get_pending_action(token)?
            .map(|r| r.status)
            .unwrap_or_else(|| "unknown".to_string());
        return Ok(ApprovalOutcome::AlreadyProcessed { status: current });
    }
    Ok(ApprovalOutcome::Rejected)
}

/// Load the stored payload for the edit/view page.
pub fn view(db: &TaskDb, token: &str) -> Result<Option<ActionView>, String> {
    let Some(row) = db.get_pending_action(token)? else {
        return Ok(None);
    };
    let record = parse_payload(&row);
    Ok(Some(ActionView {
        action_type: record.action_type,
        title: record.title,
        description: record.description,
        counterpart_name: record.counterpart_name,
        actionable: row.status == "pending",
        status: row.status,
    }))
}

/// Execute the type-specific effect of an approved action.
///
/// CRM updates go through the connector seam and degrade to a reminder task
/// when no connector is configured or the push fails. Email, calendar, and
/// deal-status actions materialize as follow-up tasks pending full external
/// integration. Returns (success, operator-facing message).
async fn execute_approved(
    db: &TaskDb,
    tenant: &DbTenant,
    crm: Option<&dyn CrmConnector>,
    record: &ActionRecord,
) -> (bool, String) {
    let counterpart = record
        .counterpart_name
        .clone()
        .unwrap_or_else(|| "Unknown".to_string());
    let today = Utc::now().format("%Y-%m-%d").to_string();

    let action: ExtractedAction = record.clone().into();
    match &action {
        ExtractedAction::UpdateCrm { crm_notes, common } => {
            if let Some(connector) = crm {
                let outcome = push_note(
                    connector,
                    &counterpart,
                    common.counterpart_address.as_deref(),
                    crm_notes,
                )
                .await;
                if outcome.success {
                    return (true, outcome.message);
                }
                log::warn!("CRM push failed, falling back to task: {}", outcome.message);
            }

            // Graceful degradation: remind the operator to do it by hand.
            let fallback = make_task(
                db,
                tenant,
                &format!("CRM Update: {counterpart}"),
                &format!("Add to CRM notes:\n{crm_notes}"),
                record,
                Some(today),
            );
            match fallback {
                Ok(()) => (true, format!("CRM update task created for {counterpart}")),
                Err(e) => (false, e),
            }
        }
        ExtractedAction::SendEmail(_) => {
            match make_task(
                db,
                tenant,
                &format!("Send email to {counterpart}"),
                &record.description,
                record,
                Some(today),
            ) {
                Ok(()) => (true, format!("Email task created for {counterpart}")),
                Err(e) => (false, e),
            }
        }
        ExtractedAction::CreateCalendarEvent { calendar_details, .. } => {
            match make_task(
                db,
                tenant,
                &format!("Calendar: {}", record.title),
                &format!("Counterpart: {counterpart}\nDetails: {calendar_details}"),
                record,
                None,
            ) {
                Ok(()) => (true, format!("Calendar event task created for {counterpart}")),
                Err(e) => (false, e),
            }
        }
        ExtractedAction::ChangeDealStatus(_) => {
            match make_task(
                db,
                tenant,
                &format!("Deal Update: {counterpart}"),
                &record.description,
                record,
                Some(today),
            ) {
                Ok(()) => (true, format!("Deal status task created for {counterpart}")),
                Err(e) => (false, e),
            }
        }
        // delete_task and unrecognized types: the stored payload becomes a
        // plain task so nothing silently disappears.
        _ => match make_task(db, tenant, &record.title, &record.description, record, None) {
            Ok(()) => (true, format!("Created task: {}", record.title)),
            Err(e) => (false, e),
        },
    }
}

fn make_task(
    db: &TaskDb,
    tenant: &DbTenant,
    title: &str,
    description: &str,
    record: &ActionRecord,
    due_today: Option<String>,
) -> Result<(), String> {
    db.insert_task(&NewTask {
        tenant_id: tenant.id.clone(),
        title: title.to_string(),
        description: description.to_string(),
        counterpart_name: record.counterpart_name.clone(),
        counterpart_address: record.counterpart_address.clone(),
        due_date: due_today.or_else(|| record.due_date.clone()),
        due_time: record.due_time.clone(),
        priority: "high".to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::test_utils::FakeCrm;
    use crate::db::test_utils::{seed_tenant, test_db};

    fn queue(db: &TaskDb, token: &str, action_type: &str) {
        let record = ActionRecord {
            action_type: action_type.to_string(),
            title: format!("{action_type} for Dave"),
            description: "Details here".to_string(),
            counterpart_name: Some("Dave Jones".to_string()),
            crm_notes: Some("Went with option B".to_string()),
            ..Default::default()
        };
        db.insert_pending_action(
            token,
            "acme",
            action_type,
            &serde_json::to_string(&record).expect("serialize"),
            Some("Re: Quote"),
        )
        .expect("queue");
    }

    fn task_count(db: &TaskDb) -> i32 {
        db.conn_ref()
            .query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))
            .expect("count")
    }

    #[tokio::test]
    async fn test_approve_is_idempotent() {
        let db = test_db();
        seed_tenant(&db, "acme");
        queue(&db, "tok-1", "send_email");

        let first = approve(&db, None, "tok-1").await.expect("approve");
        assert!(matches!(first, ApprovalOutcome::Approved { .. }));
        assert_eq!(task_count(&db), 1);

        // Second click: status unchanged, no second task.
        let second = approve(&db, None, "tok-1").await.expect("approve");
        assert_eq!(
            second,
            ApprovalOutcome::AlreadyProcessed { status: "approved".to_string() }
        );
        assert_eq!(task_count(&db), 1, "exactly one side effect");
    }

    #[tokio::test]
    async fn test_reject_has_no_side_effect() {
        let db = test_db();
        seed_tenant(&db, "acme");
        queue(&db, "tok-1", "update_crm");

        let outcome = reject(&db, "tok-1").expect("reject");
        assert_eq!(outcome, ApprovalOutcome::Rejected);
        assert_eq!(task_count(&db), 0);

        let again = reject(&db, "tok-1").expect("reject");
        assert_eq!(
            again,
            ApprovalOutcome::AlreadyProcessed { status: "rejected".to_string() }
        );
    }

    #[tokio::test]
    async fn test_approve_after_reject_is_already_processed() {
        let db = test_db();
        seed_tenant(&db, "acme");
        queue(&db, "tok-1", "send_email");

        reject(&db, "tok-1").expect("reject");
        let outcome = approve(&db, None, "tok-1").await.expect("approve");
        assert_eq!(
            outcome,
            ApprovalOutcome::AlreadyProcessed { status: "rejected".to_string() }
        );
        assert_eq!(task_count(&db), 0, "no execution after rejection");
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let db = test_db();
        seed_tenant(&db, "acme");
        let outcome = approve(&db, None, "nope").await.expect("approve");
        assert_eq!(outcome, ApprovalOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_crm_approve_uses_connector() {
        let db = test_db();
        seed_tenant(&db, "acme");
        queue(&db, "tok-1", "update_crm");

        let crm = FakeCrm::with_contact("Dave Jones");
        let outcome = approve(&db, Some(&crm), "tok-1").await.expect("approve");
        assert!(matches!(outcome, ApprovalOutcome::Approved { .. }));

        let notes = crm.notes.lock().expect("lock");
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].1, "Went with option B");
        assert_eq!(task_count(&db), 0, "no fallback task when the push lands");
    }

    #[tokio::test]
    async fn test_crm_unavailable_falls_back_to_task() {
        let db = test_db();
        seed_tenant(&db, "acme");
        queue(&db, "tok-1", "update_crm");

        let outcome = approve(&db, None, "tok-1").await.expect("approve");
        match outcome {
            ApprovalOutcome::Approved { message } => {
                assert!(message.contains("CRM update task created"));
            }
            other => panic!("Expected Approved, got {:?}", other),
        }
        assert_eq!(task_count(&db), 1);

        let title: String = db
            .conn_ref()
            .query_row("SELECT title FROM tasks", [], |r| r.get(0))
            .expect("q");
        assert_eq!(title, "CRM Update: Dave Jones");
    }

    #[tokio::test]
    async fn test_crm_outage_falls_back_to_task() {
        let db = test_db();
        seed_tenant(&db, "acme");
        queue(&db, "tok-1", "update_crm");

        let mut crm = FakeCrm::with_contact("Dave Jones");
        crm.fail_notes = true;
        let outcome = approve(&db, Some(&crm), "tok-1").await.expect("approve");
        assert!(matches!(outcome, ApprovalOutcome::Approved { .. }));
        assert_eq!(task_count(&db), 1, "degraded to a reminder task");
    }

    #[tokio::test]
    async fn test_view_renders_while_pending_only() {
        let db = test_db();
        seed_tenant(&db, "acme");
        queue(&db, "tok-1", "change_deal_status");

        let before = view(&db, "tok-1").expect("view").expect("found");
        assert!(before.actionable);
        assert_eq!(before.action_type, "change_deal_status");
        assert_eq!(before.counterpart_name.as_deref(), Some("Dave Jones"));

        approve(&db, None, "tok-1").await.expect("approve");
        let after = view(&db, "tok-1").expect("view").expect("found");
        assert!(!after.actionable);
        assert_eq!(after.status, "approved");

        assert!(view(&db, "missing").expect("view").is_none());
    }

    #[tokio::test]
    async fn test_expired_token_is_already_processed() {
        let db = test_db();
        seed_tenant(&db, "acme");
        queue(&db, "tok-1", "send_email");
        db.conn_ref()
            .execute(
                "UPDATE pending_actions SET status = 'expired' WHERE token = 'tok-1'",
                [],
            )
            .expect("expire");

        let outcome = approve(&db, None, "tok-1").await.expect("approve");
        assert_eq!(
            outcome,
            ApprovalOutcome::AlreadyProcessed { status: "expired".to_string() }
        );
    }
}
