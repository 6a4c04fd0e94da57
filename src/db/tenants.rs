use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::*;

fn map_tenant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbTenant> {
    Ok(DbTenant {
        id: row.get(0)?,
        name: row.get(1)?,
        notify_address: row.get(2)?,
        timezone: row.get(3)?,
        summary_time: row.get(4)?,
        summary_enabled: row.get::<_, i32>(5)? != 0,
        last_summary_sent_at: row.get(6)?,
        self_addresses: row.get(7)?,
        transcription_senders: row.get(8)?,
        prompt_context: row.get(9)?,
        categories: row.get(10)?,
    })
}

const TENANT_COLUMNS: &str = "id, name, notify_address, timezone, summary_time,
        summary_enabled, last_summary_sent_at, self_addresses,
        transcription_senders, prompt_context, categories";

impl TaskDb {
    /// Load one tenant by id.
    pub fn get_tenant(&self, tenant_id: &str) -> Result<Option<DbTenant>, String> {
        self.conn
            .query_row(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
                params![tenant_id],
                map_tenant_row,
            )
            .optional()
            .map_err(|e| format!("Failed to load tenant {tenant_id}: {e}"))
    }

    /// All tenants with the daily digest enabled.
    pub fn get_digest_tenants(&self) -> Result<Vec<DbTenant>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TENANT_COLUMNS} FROM tenants WHERE summary_enabled = 1"
            ))
            .map_err(|e| format!("Failed to prepare digest tenant query: {e}"))?;

        let rows = stmt
            .query_map([], map_tenant_row)
            .map_err(|e| format!("Failed to query digest tenants: {e}"))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| format!("Failed to read tenant row: {e}"))?);
        }
        Ok(results)
    }

    /// Stamp `last_summary_sent_at` for a tenant after its digest went out.
    pub fn stamp_summary_sent(
        &self,
        tenant_id: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE tenants SET last_summary_sent_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), tenant_id],
            )
            .map_err(|e| format!("Failed to stamp summary sent for {tenant_id}: {e}"))?;
        Ok(())
    }
}
