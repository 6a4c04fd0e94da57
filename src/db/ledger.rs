use std::collections::HashSet;

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::*;

/// Outcome of a ledger insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// The item was newly recorded.
    Recorded,
    /// The (connection, message-identifier) pair already existed. Expected
    /// under overlapping poll cycles; not an error.
    AlreadyProcessed,
}

impl TaskDb {
    /// Record a processed mailbox item.
    ///
    /// The unique index on (connection_id, message_identifier) is the dedup
    /// mechanism: a conflicting insert is reported as `AlreadyProcessed`, and
    /// the original row is left untouched.
    pub fn record_processed_item(
        &self,
        connection_id: Option<&str>,
        message_identifier: &str,
        server_item_id: Option<&str>,
        sender: Option<&str>,
        subject: Option<&str>,
    ) -> Result<LedgerOutcome, String> {
        let result = self.conn.execute(
            "INSERT INTO processed_items
                (id, connection_id, message_identifier, server_item_id,
                 sender, subject, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                connection_id,
                message_identifier,
                server_item_id,
                sender,
                subject,
                Utc::now().to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(LedgerOutcome::Recorded),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(LedgerOutcome::AlreadyProcessed)
            }
            Err(e) => Err(format!(
                "Failed to record processed item {message_identifier}: {e}"
            )),
        }
    }

    /// Load the set of already-handled identifiers for one connection: every
    /// message_identifier and server_item_id in the ledger. Batch-loaded once
    /// per poll cycle so candidate subtraction is a set lookup.
    pub fn processed_identifiers(
        &self,
        connection_id: &str,
    ) -> Result<HashSet<String>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT message_identifier, server_item_id
                 FROM processed_items
                 WHERE connection_id = ?1 OR connection_id IS NULL",
            )
            .map_err(|e| format!("Failed to prepare ledger query: {e}"))?;

        let rows = stmt
            .query_map(params![connection_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                ))
            })
            .map_err(|e| format!("Failed to query ledger: {e}"))?;

        let mut seen = HashSet::new();
        for row in rows {
            let (message_id, server_id) =
                row.map_err(|e| format!("Failed to read ledger row: {e}"))?;
            seen.insert(message_id);
            if let Some(server_id) = server_id {
                seen.insert(server_id);
            }
        }
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::LedgerOutcome;
    use crate::db::test_utils::{seed_connection, seed_tenant, test_db};

    #[test]
    fn test_record_then_duplicate() {
        let db = test_db();
        seed_tenant(&db, "acme");
        seed_connection(&db, "c-1", "acme");

        let first = db
            .record_processed_item(
                Some("c-1"),
                "<msg-1@mail.test>",
                Some("101"),
                Some("alice@client.test"),
                Some("Quote for Jones"),
            )
            .expect("first insert");
        assert_eq!(first, LedgerOutcome::Recorded);

        let second = db
            .record_processed_item(Some("c-1"), "<msg-1@mail.test>", Some("101"), None, None)
            .expect("duplicate insert is not an error");
        assert_eq!(second, LedgerOutcome::AlreadyProcessed);

        let count: i32 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM processed_items", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1, "exactly one ledger row");
    }

    #[test]
    fn test_same_message_id_different_connection_is_distinct() {
        let db = test_db();
        seed_tenant(&db, "acme");
        seed_connection(&db, "c-1", "acme");
        seed_connection(&db, "c-2", "acme");

        let a = db
            .record_processed_item(Some("c-1"), "<shared@mail.test>", None, None, None)
            .expect("insert");
        let b = db
            .record_processed_item(Some("c-2"), "<shared@mail.test>", None, None, None)
            .expect("insert");
        assert_eq!(a, LedgerOutcome::Recorded);
        assert_eq!(b, LedgerOutcome::Recorded);
    }

    #[test]
    fn test_processed_identifiers_includes_server_ids() {
        let db = test_db();
        seed_tenant(&db, "acme");
        seed_connection(&db, "c-1", "acme");

        db.record_processed_item(Some("c-1"), "<m1@x>", Some("41"), None, None)
            .expect("insert");
        db.record_processed_item(Some("c-1"), "<m2@x>", None, None, None)
            .expect("insert");

        let seen = db.processed_identifiers("c-1").expect("query");
        assert!(seen.contains("<m1@x>"));
        assert!(seen.contains("41"));
        assert!(seen.contains("<m2@x>"));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_legacy_rows_visible_to_all_connections() {
        let db = test_db();
        seed_tenant(&db, "acme");
        seed_connection(&db, "c-1", "acme");

        // Legacy single-tenant row with NULL connection_id
        db.record_processed_item(None, "<legacy@x>", None, None, None)
            .expect("insert");

        let seen = db.processed_identifiers("c-1").expect("query");
        assert!(seen.contains("<legacy@x>"));
    }
}
