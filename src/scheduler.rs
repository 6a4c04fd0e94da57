//! Reminder & summary scheduler.
//!
//! Runs independently of the ingestion poller on a short fixed tick. The tick
//! body is a pure function of "now" and the pending tasks / digest-eligible
//! tenants, so a missed tick or a process restart changes nothing: firing is
//! gated by the per-occurrence stamps (`reminder_sent_at`,
//! `last_summary_sent_at`), and the catch-up window picks up anything a dead
//! process failed to send — bounded by a ceiling so ancient tasks stay quiet.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::db::{DbTask, DbTenant, TaskDb};
use crate::notify::{
    bucket_tasks, digest_email_html, reminder_email_html, send_spacing, EmailSender,
};
use crate::state::AppState;

/// Scheduler loop tick.
pub const SCHEDULER_TICK_SECS: u64 = 60;

/// Reminders fire this many minutes ahead of the due instant.
pub const UPCOMING_WINDOW_MINS: i64 = 20;

/// Overdue catch-up fires until this long after the due instant. Beyond it
/// the occurrence is considered stale and stays silent.
pub const CATCHUP_CEILING_MINS: i64 = 1440;

/// Width of the daily digest firing window.
pub const DIGEST_WINDOW_MINS: i64 = 5;

/// Pending-action expiry sweep cadence, in hours.
const EXPIRY_SWEEP_HOURS: i64 = 24;

/// Which reminder variant an occurrence gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    Upcoming,
    Overdue,
}

fn parse_due_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

fn parse_local_date(timestamp: &str, tz: Tz) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|dt| dt.with_timezone(&tz).date_naive())
}

/// Decide whether a reminder fires for this task at this instant.
///
/// The due instant is the task's due date (or today when unset) at its due
/// time, in the owner's timezone. Two windows fire: upcoming
/// (0..=UPCOMING_WINDOW ahead) and catch-up (down to the ceiling behind).
/// Firing is gated by `reminder_sent_at`: once a send is recorded on or after
/// the due date, this occurrence stays quiet.
pub fn reminder_due(task: &DbTask, tz: Tz, now: DateTime<Utc>) -> Option<ReminderKind> {
    let due_time = parse_due_time(task.due_time.as_deref()?)?;
    let now_local = now.with_timezone(&tz);

    let occurrence_date = task
        .due_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .unwrap_or_else(|| now_local.date_naive());

    let due_instant = tz
        .from_local_datetime(&occurrence_date.and_time(due_time))
        .earliest()?;

    // Already acknowledged for this occurrence?
    if let Some(sent) = task
        .reminder_sent_at
        .as_deref()
        .and_then(|s| parse_local_date(s, tz))
    {
        if sent >= occurrence_date {
            return None;
        }
    }

    let delta_mins = (due_instant - now_local).num_minutes();
    if (0..=UPCOMING_WINDOW_MINS).contains(&delta_mins) {
        Some(ReminderKind::Upcoming)
    } else if (-CATCHUP_CEILING_MINS..0).contains(&delta_mins) {
        Some(ReminderKind::Overdue)
    } else {
        None
    }
}

/// Decide whether the tenant's daily digest fires at this instant: inside the
/// firing window at the configured summary time, and not already sent today
/// (tenant-local calendar date).
pub fn digest_due(tenant: &DbTenant, now: DateTime<Utc>) -> bool {
    if !tenant.summary_enabled {
        return false;
    }
    let Ok(tz) = tenant.timezone.parse::<Tz>() else {
        return false;
    };
    let Some(summary_time) = parse_due_time(&tenant.summary_time) else {
        return false;
    };

    let now_local = now.with_timezone(&tz);
    let elapsed =
        (now_local.time() - summary_time).num_minutes();
    if !(0..DIGEST_WINDOW_MINS).contains(&elapsed) {
        return false;
    }

    // Idempotent per calendar day.
    match tenant
        .last_summary_sent_at
        .as_deref()
        .and_then(|s| parse_local_date(s, tz))
    {
        Some(last_date) => last_date < now_local.date_naive(),
        None => true,
    }
}

/// One scheduler tick: send due reminders and due digests.
pub async fn run_tick(
    db: &TaskDb,
    mailer: &dyn EmailSender,
    now: DateTime<Utc>,
) -> Result<(), String> {
    for task in db.pending_tasks_with_due_time()? {
        let Some(tenant) = db.get_tenant(&task.tenant_id)? else {
            continue;
        };
        let tz: Tz = tenant.timezone.parse().unwrap_or(chrono_tz::UTC);

        let Some(kind) = reminder_due(&task, tz, now) else {
            continue;
        };

        let (subject, html) = reminder_email_html(&task, kind == ReminderKind::Overdue);
        match mailer.send(&tenant.notify_address, &subject, &html).await {
            Ok(()) => {
                // Stamp only after a successful send: a failed send is
                // retried next tick (or caught up after a restart).
                db.stamp_reminder_sent(&task.id, now)?;
                log::info!("Reminder sent for '{}' ({:?})", task.title, kind);
            }
            Err(e) => {
                log::warn!("Reminder send failed for '{}': {e}", task.title);
            }
        }
        send_spacing().await;
    }

    for tenant in db.get_digest_tenants()? {
        if !digest_due(&tenant, now) {
            continue;
        }
        let tz: Tz = tenant.timezone.parse().unwrap_or(chrono_tz::UTC);
        let now_local = now.with_timezone(&tz);

        let buckets = bucket_tasks(db.open_tasks(&tenant.id)?, now_local.date_naive());
        let date_line = now_local.format("%A, %B %-d, %Y").to_string();
        let (subject, html) = digest_email_html(&tenant.name, &date_line, &buckets);

        match mailer.send(&tenant.notify_address, &subject, &html).await {
            Ok(()) => {
                db.stamp_summary_sent(&tenant.id, now)?;
                log::info!("Daily digest sent for tenant {}", tenant.id);
            }
            Err(e) => {
                log::warn!("Digest send failed for tenant {}: {e}", tenant.id);
            }
        }
        send_spacing().await;
    }

    Ok(())
}

/// The long-lived scheduler loop. Also sweeps expired pending actions once a
/// day.
pub async fn run_scheduler(state: Arc<AppState>) {
    let mut last_expiry_sweep = Utc::now();

    loop {
        tokio::time::sleep(std::time::Duration::from_secs(SCHEDULER_TICK_SECS)).await;

        let db = match TaskDb::open() {
            Ok(db) => db,
            Err(e) => {
                log::error!("Scheduler could not open database: {e}");
                continue;
            }
        };

        let now = Utc::now();
        if let Err(e) = run_tick(&db, state.mailer.as_ref(), now).await {
            log::error!("Scheduler tick failed: {e}");
        }

        if (now - last_expiry_sweep).num_hours() >= EXPIRY_SWEEP_HOURS {
            match db.expire_stale_pending_actions(now) {
                Ok(count) if count > 0 => {
                    log::info!("Expired {count} stale pending action(s)");
                }
                Ok(_) => {}
                Err(e) => log::warn!("Pending-action expiry sweep failed: {e}"),
            }
            last_expiry_sweep = now;
        }
    }
}
