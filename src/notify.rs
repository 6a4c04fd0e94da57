//! Outbound email: the send seam, the HTTP sender, and the HTML builders for
//! approval requests, reminders, daily digests, and task confirmations.

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::actions::ActionRecord;
use crate::db::DbTask;

/// Fixed spacing between outbound sends, respecting provider quotas.
pub const SEND_SPACING_MS: u64 = 600;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Send request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Email API returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), SendError>;
}

/// JSON email API client ({from, to, subject, html} with a bearer key).
pub struct HttpEmailSender {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from_address: String,
}

impl HttpEmailSender {
    pub fn new(endpoint: String, api_key: String, from_address: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            from_address,
        }
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), SendError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "from": self.from_address,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SendError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Pause between consecutive sends.
pub async fn send_spacing() {
    tokio::time::sleep(std::time::Duration::from_millis(SEND_SPACING_MS)).await;
}

// ============================================================================
// HTML builders
// ============================================================================

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn action_description(action: &ActionRecord) -> String {
    match action.action_type.as_str() {
        "update_crm" => format!(
            "Add to CRM notes: <em>\"{}\"</em>",
            escape(action.crm_notes.as_deref().unwrap_or("No notes specified"))
        ),
        "send_email" => format!(
            "Draft and send email to {}: {}",
            escape(action.counterpart_name.as_deref().unwrap_or("counterpart")),
            escape(&action.description)
        ),
        "create_calendar_event" => format!(
            "Create calendar event on {}{}: {}",
            action.due_date.as_deref().unwrap_or("TBD"),
            action
                .due_time
                .as_deref()
                .map(|t| format!(" at {t}"))
                .unwrap_or_default(),
            escape(action.calendar_details.as_deref().unwrap_or(""))
        ),
        "change_deal_status" => format!(
            "Change deal status for {}: {}",
            escape(action.counterpart_name.as_deref().unwrap_or("counterpart")),
            escape(&action.description)
        ),
        "delete_task" => format!("Delete task: {}", escape(&action.description)),
        _ => escape(&action.description),
    }
}

/// One queued action plus its approval token, for the bundled email.
pub struct QueuedApproval<'a> {
    pub token: &'a str,
    pub action: &'a ActionRecord,
}

/// Build the approval-request email bundling every queued action from one
/// source message. Each block carries Approve/Edit/Reject links keyed by that
/// action's token.
pub fn approval_email_html(
    base_url: &str,
    source_subject: &str,
    source_sender: &str,
    summary: &str,
    queued: &[QueuedApproval<'_>],
) -> String {
    let mut blocks = String::new();
    for item in queued {
        let approve = format!("{base_url}/action/approve?token={}", item.token);
        let edit = format!("{base_url}/action/edit?token={}", item.token);
        let reject = format!("{base_url}/action/reject?token={}", item.token);
        let label = item.action.action_type.replace('_', " ").to_uppercase();
        let counterpart = item
            .action
            .counterpart_name
            .as_deref()
            .map(|n| format!(" — {}", escape(n)))
            .unwrap_or_default();

        blocks.push_str(&format!(
            r#"<div style="border: 1px solid #ddd; border-radius: 8px; padding: 16px; margin: 12px 0; background: #fafafa;">
  <div style="font-size: 14px; color: #666; margin-bottom: 4px;">{label}{counterpart}</div>
  <div style="font-size: 16px; font-weight: bold; margin-bottom: 8px;">{title}</div>
  <div style="font-size: 14px; color: #444; margin-bottom: 12px;">{description}</div>
  <div>
    <a href="{approve}" style="display: inline-block; padding: 8px 20px; background: #22c55e; color: white; text-decoration: none; border-radius: 6px; margin-right: 8px; font-weight: bold;">Approve</a>
    <a href="{edit}" style="display: inline-block; padding: 8px 20px; background: #3b82f6; color: white; text-decoration: none; border-radius: 6px; margin-right: 8px; font-weight: bold;">Edit</a>
    <a href="{reject}" style="display: inline-block; padding: 8px 20px; background: #ef4444; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">Skip</a>
  </div>
</div>"#,
            title = escape(&item.action.title),
            description = action_description(item.action),
        ));
    }

    format!(
        r#"<div style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif; max-width: 600px; margin: 0 auto;">
  <div style="background: #1e3a5f; color: white; padding: 16px 20px; border-radius: 8px 8px 0 0;">
    <h2 style="margin: 0; font-size: 18px;">Actions Need Your Approval</h2>
  </div>
  <div style="padding: 20px; border: 1px solid #ddd; border-top: none; border-radius: 0 0 8px 8px;">
    <div style="font-size: 14px; color: #666; margin-bottom: 16px;">
      <strong>From:</strong> {sender}<br>
      <strong>Subject:</strong> {subject}<br>
      <strong>Summary:</strong> {summary}
    </div>
    <h3 style="font-size: 16px; color: #333; margin-bottom: 8px;">{count} action(s) need your approval:</h3>
    {blocks}
  </div>
</div>"#,
        sender = escape(source_sender),
        subject = escape(source_subject),
        summary = escape(summary),
        count = queued.len(),
    )
}

/// Build a reminder email. `overdue` selects the catch-up variant.
pub fn reminder_email_html(task: &DbTask, overdue: bool) -> (String, String) {
    let (accent, heading) = if overdue {
        ("#ef4444", "Overdue Task")
    } else {
        ("#f59e0b", "Task Reminder")
    };

    let counterpart = task
        .counterpart_name
        .as_deref()
        .map(|n| format!("<div style=\"margin: 5px 0;\"><strong>Counterpart:</strong> {}</div>", escape(n)))
        .unwrap_or_default();

    let subject = format!(
        "{}: {}",
        if overdue { "Overdue" } else { "Reminder" },
        task.title
    );

    let html = format!(
        r#"<div style="font-family: -apple-system, sans-serif; max-width: 600px; margin: 0 auto;">
  <div style="background: #fff; border-left: 4px solid {accent}; padding: 20px; border-radius: 8px;">
    <h2 style="margin: 0 0 12px 0;">{heading}</h2>
    <div style="font-size: 18px; font-weight: bold; margin: 10px 0;">{title}</div>
    <div style="margin: 15px 0; padding: 15px; background: #f9fafb; border-radius: 5px;">
      <div style="margin: 5px 0;"><strong>Due:</strong> {due_date} {due_time}</div>
      {counterpart}
    </div>
  </div>
</div>"#,
        title = escape(&task.title),
        due_date = task.due_date.as_deref().unwrap_or("today"),
        due_time = task.due_time.as_deref().unwrap_or(""),
    );

    (subject, html)
}

/// Open tasks bucketed for the daily digest.
#[derive(Debug, Default)]
pub struct DigestBuckets {
    pub overdue: Vec<DbTask>,
    pub due_today: Vec<DbTask>,
    pub upcoming: Vec<DbTask>,
}

/// Bucket a tenant's open tasks against the tenant-local `today`.
pub fn bucket_tasks(tasks: Vec<DbTask>, today: NaiveDate) -> DigestBuckets {
    let mut buckets = DigestBuckets::default();
    for task in tasks {
        let due = task
            .due_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
        match due {
            Some(date) if date < today => buckets.overdue.push(task),
            Some(date) if date == today => buckets.due_today.push(task),
            _ => buckets.upcoming.push(task),
        }
    }
    buckets.upcoming.truncate(10);
    buckets
}

fn digest_section(heading: &str, color: &str, background: &str, tasks: &[DbTask]) -> String {
    if tasks.is_empty() {
        return String::new();
    }
    let mut rows = String::new();
    for task in tasks {
        let detail = task
            .due_time
            .as_deref()
            .or(task.due_date.as_deref())
            .unwrap_or("");
        rows.push_str(&format!(
            r#"<div style="padding: 12px; background: {background}; border-radius: 8px; margin-bottom: 8px;">
  <strong>{title}</strong>
  <div style="font-size: 12px; color: {color};">{detail}</div>
</div>"#,
            title = escape(&task.title),
        ));
    }
    format!(
        r#"<div style="margin-bottom: 24px;">
  <h3 style="color: {color}; font-size: 14px; margin-bottom: 12px;">{heading}</h3>
  {rows}
</div>"#,
    )
}

/// Build the daily digest email.
pub fn digest_email_html(
    tenant_name: &str,
    date_line: &str,
    buckets: &DigestBuckets,
) -> (String, String) {
    let total =
        buckets.overdue.len() + buckets.due_today.len() + buckets.upcoming.len();

    let body = if total == 0 {
        r#"<div style="text-align: center; padding: 24px; color: #6B7280;">
  <p>No pending tasks. You're all caught up!</p>
</div>"#
            .to_string()
    } else {
        format!(
            "{}{}{}",
            digest_section("OVERDUE", "#EF4444", "#FEE2E2", &buckets.overdue),
            digest_section("DUE TODAY", "#6366F1", "#EEF2FF", &buckets.due_today),
            digest_section("COMING UP", "#6B7280", "#F3F4F6", &buckets.upcoming),
        )
    };

    let subject = format!("Your Daily Summary - {date_line}");
    let html = format!(
        r#"<div style="font-family: -apple-system, sans-serif; max-width: 600px; margin: 0 auto;">
  <div style="background: #6366F1; padding: 24px; border-radius: 12px 12px 0 0;">
    <h1 style="color: white; margin: 0 0 8px 0; font-size: 24px;">Daily Summary</h1>
    <p style="color: rgba(255,255,255,0.9); margin: 0;">{date_line}</p>
  </div>
  <div style="background: white; padding: 24px; border: 1px solid #E5E7EB; border-top: none; border-radius: 0 0 12px 12px;">
    <p style="color: #374151;">Good morning, {name}!</p>
    <p style="color: #6B7280; font-size: 14px;">{total} pending task(s).</p>
    {body}
  </div>
</div>"#,
        name = escape(tenant_name),
    );

    (subject, html)
}

/// Build the task-created confirmation email.
pub fn confirmation_email_html(task: &DbTask) -> (String, String) {
    let subject = format!("Task Set: {}", task.title);
    let html = format!(
        r#"<div style="font-family: -apple-system, sans-serif; max-width: 600px; margin: 0 auto;">
  <div style="background: #ecfdf5; border-left: 4px solid #10b981; padding: 20px; border-radius: 8px;">
    <h2 style="color: #065f46; margin: 0 0 15px 0;">Task Created</h2>
    <div style="font-size: 18px; font-weight: bold; margin: 10px 0;">{title}</div>
    <div style="margin: 15px 0; padding: 15px; background: white; border-radius: 5px;">
      <div style="margin: 5px 0;"><strong>Due:</strong> {due_date} {due_time}</div>
      <div style="margin: 5px 0;"><strong>Priority:</strong> {priority}</div>
    </div>
    <p style="color: #6b7280; font-size: 14px;">You will receive a reminder shortly before this is due.</p>
  </div>
</div>"#,
        title = escape(&task.title),
        due_date = task.due_date.as_deref().unwrap_or("unscheduled"),
        due_time = task.due_time.as_deref().unwrap_or(""),
        priority = task.priority,
    );
    (subject, html)
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn task(title: &str, due_date: Option<&str>) -> DbTask {
        DbTask {
            id: "t-1".to_string(),
            tenant_id: "acme".to_string(),
            title: title.to_string(),
            description: String::new(),
            counterpart_name: Some("Dave".to_string()),
            counterpart_address: None,
            due_date: due_date.map(str::to_string),
            due_time: Some("09:00".to_string()),
            priority: "medium".to_string(),
            status: "pending".to_string(),
            reminder_sent_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_approval_email_carries_all_tokens() {
        let a1 = ActionRecord {
            action_type: "update_crm".to_string(),
            title: "Update CRM for Dave".to_string(),
            crm_notes: Some("Went with option B".to_string()),
            ..Default::default()
        };
        let a2 = ActionRecord {
            action_type: "send_email".to_string(),
            title: "Send revised quote".to_string(),
            counterpart_name: Some("Dave".to_string()),
            ..Default::default()
        };
        let queued = vec![
            QueuedApproval { token: "tok-a", action: &a1 },
            QueuedApproval { token: "tok-b", action: &a2 },
        ];

        let html = approval_email_html(
            "https://relay.test",
            "Re: Quote",
            "dave@client.test",
            "Dave accepted option B",
            &queued,
        );

        assert!(html.contains("https://relay.test/action/approve?token=tok-a"));
        assert!(html.contains("https://relay.test/action/reject?token=tok-a"));
        assert!(html.contains("https://relay.test/action/edit?token=tok-b"));
        assert!(html.contains("2 action(s)"));
        assert!(html.contains("Went with option B"));
        assert!(html.contains("UPDATE CRM"));
    }

    #[test]
    fn test_reminder_variants() {
        let (subject, html) = reminder_email_html(&task("Call Dave", Some("2026-08-06")), false);
        assert!(subject.starts_with("Reminder:"));
        assert!(html.contains("Task Reminder"));

        let (subject, html) = reminder_email_html(&task("Call Dave", Some("2026-08-06")), true);
        assert!(subject.starts_with("Overdue:"));
        assert!(html.contains("Overdue Task"));
    }

    #[test]
    fn test_bucket_tasks() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 6).expect("date");
        let tasks = vec![
            task("Yesterday", Some("2026-08-05")),
            task("Today", Some("2026-08-06")),
            task("Tomorrow", Some("2026-08-07")),
            task("Undated", None),
        ];
        let buckets = bucket_tasks(tasks, today);
        assert_eq!(buckets.overdue.len(), 1);
        assert_eq!(buckets.due_today.len(), 1);
        assert_eq!(buckets.upcoming.len(), 2, "undated tasks land in upcoming");
    }

    #[test]
    fn test_digest_empty_state() {
        let (_, html) = digest_email_html("Acme", "Thursday, August 6", &DigestBuckets::default());
        assert!(html.contains("all caught up"));
    }

    #[test]
    fn test_html_escaping() {
        let mut t = task("Quote <urgent> & more", Some("2026-08-06"));
        t.counterpart_name = Some("A <b>".to_string());
        let (_, html) = reminder_email_html(&t, false);
        assert!(html.contains("Quote &lt;urgent&gt; &amp; more"));
        assert!(!html.contains("Quote <urgent>"));
    }
}
