use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use super::*;

/// How long a queued action stays approvable before the GC expires it.
pub const PENDING_ACTION_TTL_DAYS: i64 = 7;

const PENDING_COLUMNS: &str = "token, tenant_id, action_type, action_data,
        source_subject, status, created_at, processed_at, expires_at";

fn map_pending_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbPendingAction> {
    Ok(DbPendingAction {
        token: row.get(0)?,
        tenant_id: row.get(1)?,
        action_type: row.get(2)?,
        action_data: row.get(3)?,
        source_subject: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        processed_at: row.get(7)?,
        expires_at: row.get(8)?,
    })
}

impl TaskDb {
    /// Queue an action for approval under a freshly generated token.
    pub fn insert_pending_action(
        &self,
        token: &str,
        tenant_id: &str,
        action_type: &str,
        action_data: &str,
        source_subject: Option<&str>,
    ) -> Result<(), String> {
        let now = Utc::now();
        let expires = now + Duration::days(PENDING_ACTION_TTL_DAYS);

        self.conn
            .execute(
                "INSERT INTO pending_actions
                    (token, tenant_id, action_type, action_data, source_subject,
                     status, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
                params![
                    token,
                    tenant_id,
                    action_type,
                    action_data,
                    source_subject,
                    now.to_rfc3339(),
                    expires.to_rfc3339(),
                ],
            )
            .map_err(|e| format!("Failed to queue pending action: {e}"))?;
        Ok(())
    }

    pub fn get_pending_action(&self, token: &str) -> Result<Option<DbPendingAction>, String> {
        self.conn
            .query_row(
                &format!("SELECT {PENDING_COLUMNS} FROM pending_actions WHERE token = ?1"),
                params![token],
                map_pending_row,
            )
            .optional()
            .map_err(|e| format!("Failed to load pending action: {e}"))
    }

    /// Atomically transition an action out of `pending`.
    ///
    /// Returns true when this call performed the transition, false when the
    /// action was no longer pending (a concurrent click already handled it).
    /// The guard is the storage layer's conditional update; there is no
    /// application-level lock.
    pub fn transition_pending_action(&self, token: &str, to_status: &str) -> Result<bool, String> {
        let rows = self
            .conn
            .execute(
                "UPDATE pending_actions
                 SET status = ?1, processed_at = ?2
                 WHERE token = ?3 AND status = 'pending'",
                params![to_status, Utc::now().to_rfc3339(), token],
            )
            .map_err(|e| format!("Failed to transition pending action: {e}"))?;
        Ok(rows == 1)
    }

    /// Expire pending actions whose `expires_at` has passed. Returns the
    /// number of rows expired. Only the GC takes actions to `expired`; the
    /// click handlers never do.
    pub fn expire_stale_pending_actions(&self, now: DateTime<Utc>) -> Result<usize, String> {
        self.conn
            .execute(
                "UPDATE pending_actions
                 SET status = 'expired', processed_at = ?1
                 WHERE status = 'pending' AND expires_at < ?1",
                params![now.to_rfc3339()],
            )
            .map_err(|e| format!("Failed to expire pending actions: {e}"))
    }
}
