use chrono::{DateTime, Utc};
use rusqlite::params;

use super::*;

fn map_connection_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbConnection> {
    Ok(DbConnection {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        mailbox_address: row.get(2)?,
        imap_host: row.get(3)?,
        imap_port: row.get::<_, i64>(4)? as u16,
        imap_username: row.get(5)?,
        imap_password: row.get(6)?,
        sync_frequency_mins: row.get(7)?,
        last_sync_at: row.get(8)?,
        is_active: row.get::<_, i32>(9)? != 0,
    })
}

impl TaskDb {
    /// All active mailbox connections, oldest-synced first.
    pub fn get_active_connections(&self) -> Result<Vec<DbConnection>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, tenant_id, mailbox_address, imap_host, imap_port,
                        imap_username, imap_password, sync_frequency_mins,
                        last_sync_at, is_active
                 FROM connections
                 WHERE is_active = 1
                 ORDER BY last_sync_at ASC NULLS FIRST",
            )
            .map_err(|e| format!("Failed to prepare connections query: {e}"))?;

        let rows = stmt
            .query_map([], map_connection_row)
            .map_err(|e| format!("Failed to query connections: {e}"))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| format!("Failed to read connection row: {e}"))?);
        }
        Ok(results)
    }

    /// Stamp `last_sync_at` after a poll cycle. Always called, even for
    /// zero-result cycles, so the next-due calculation advances.
    pub fn stamp_last_sync(&self, connection_id: &str, now: DateTime<Utc>) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE connections SET last_sync_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), connection_id],
            )
            .map_err(|e| format!("Failed to stamp last_sync_at for {connection_id}: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::db::test_utils::{seed_connection, seed_tenant, test_db};

    #[test]
    fn test_active_connections_only() {
        let db = test_db();
        seed_tenant(&db, "acme");
        seed_connection(&db, "c-1", "acme");
        seed_connection(&db, "c-2", "acme");
        db.conn_ref()
            .execute("UPDATE connections SET is_active = 0 WHERE id = 'c-2'", [])
            .expect("deactivate");

        let conns = db.get_active_connections().expect("query");
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].id, "c-1");
        assert_eq!(conns[0].sync_frequency_mins, 15);
        assert!(conns[0].last_sync_at.is_none());
    }

    #[test]
    fn test_stamp_last_sync() {
        let db = test_db();
        seed_tenant(&db, "acme");
        seed_connection(&db, "c-1", "acme");

        let now = Utc::now();
        db.stamp_last_sync("c-1", now).expect("stamp");

        let conns = db.get_active_connections().expect("query");
        assert_eq!(
            conns[0].last_sync_at.as_deref(),
            Some(now.to_rfc3339().as_str())
        );
    }
}
