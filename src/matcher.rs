//! Counterpart → existing-task resolution.
//!
//! Finds an open task for the same counterpart so inbound mail threads onto
//! it instead of creating a duplicate. Strategy order: exact address match,
//! then keyword search confirmed by address or name. The tenant's own
//! addresses never match as a counterpart.

use crate::db::{DbTask, DbTenant, TaskDb};

/// Find an existing open task for a counterpart.
///
/// Match priority:
/// (a) exact counterpart-address match on an open task;
/// (b) keyword hit on open-task titles/descriptions, confirmed by address
///     equality or case-insensitive name containment.
/// Ambiguous keyword ties break toward the most recently updated task.
pub fn find_existing_task(
    db: &TaskDb,
    tenant: &DbTenant,
    counterpart_address: Option<&str>,
    counterpart_name: Option<&str>,
    keywords: &[String],
) -> Result<Option<DbTask>, String> {
    // Never match the tenant's own outbound identities as a counterpart.
    if let Some(address) = counterpart_address {
        let address = address.to_lowercase();
        if tenant.self_address_list().contains(&address) {
            return Ok(None);
        }

        let matches = db.open_tasks_by_address(&tenant.id, &address)?;
        if let Some(task) = matches.into_iter().next() {
            return Ok(Some(task));
        }
    }

    for keyword in keywords {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            continue;
        }

        let candidates = db.open_tasks_by_keyword(&tenant.id, keyword)?;
        for task in candidates {
            if confirms_counterpart(&task, counterpart_address, counterpart_name) {
                log::debug!("Matched task {} by keyword '{keyword}'", task.id);
                return Ok(Some(task));
            }
        }
    }

    Ok(None)
}

/// A keyword hit alone is not enough: confirm the task belongs to the same
/// counterpart by address, or by name containment either way.
fn confirms_counterpart(
    task: &DbTask,
    counterpart_address: Option<&str>,
    counterpart_name: Option<&str>,
) -> bool {
    if let (Some(task_addr), Some(addr)) =
        (task.counterpart_address.as_deref(), counterpart_address)
    {
        if task_addr.eq_ignore_ascii_case(addr) {
            return true;
        }
    }

    if let (Some(task_name), Some(name)) = (task.counterpart_name.as_deref(), counterpart_name) {
        let task_name = task_name.to_lowercase();
        let name = name.to_lowercase();
        if !name.is_empty() && (task_name.contains(&name) || name.contains(&task_name)) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tasks::NewTask;
    use crate::db::test_utils::{seed_tenant, test_db};

    fn tenant(db: &TaskDb) -> DbTenant {
        seed_tenant(db, "acme");
        db.get_tenant("acme").expect("query").expect("row")
    }

    fn insert(db: &TaskDb, title: &str, name: Option<&str>, address: Option<&str>) -> DbTask {
        db.insert_task(&NewTask {
            tenant_id: "acme".to_string(),
            title: title.to_string(),
            counterpart_name: name.map(str::to_string),
            counterpart_address: address.map(str::to_string),
            priority: "medium".to_string(),
            ..Default::default()
        })
        .expect("insert")
    }

    #[test]
    fn test_exact_address_match_wins() {
        let db = test_db();
        let tenant = tenant(&db);
        insert(&db, "Other client", Some("Sue"), Some("sue@other.test"));
        let expected = insert(&db, "Jones quote", Some("Dave"), Some("dave@client.test"));

        let found = find_existing_task(&db, &tenant, Some("DAVE@client.test"), None, &[])
            .expect("match")
            .expect("found");
        assert_eq!(found.id, expected.id);
    }

    #[test]
    fn test_keyword_match_requires_confirmation() {
        let db = test_db();
        let tenant = tenant(&db);
        insert(&db, "Battery quote for Sue", Some("Sue Smith"), Some("sue@other.test"));

        // Same keyword, different counterpart: no match
        let found = find_existing_task(
            &db,
            &tenant,
            Some("dave@client.test"),
            Some("Dave Jones"),
            &["battery".to_string()],
        )
        .expect("match");
        assert!(found.is_none(), "keyword alone must not match");

        // Name containment confirms
        let found = find_existing_task(
            &db,
            &tenant,
            None,
            Some("Sue"),
            &["battery".to_string()],
        )
        .expect("match")
        .expect("found");
        assert_eq!(found.counterpart_name.as_deref(), Some("Sue Smith"));
    }

    #[test]
    fn test_keyword_tie_breaks_most_recent() {
        let db = test_db();
        let tenant = tenant(&db);
        let older = insert(&db, "Battery quote A", Some("Dave"), Some("dave@client.test"));
        let newer = insert(&db, "Battery quote B", Some("Dave"), Some("dave@client.test"));
        db.conn_ref()
            .execute(
                "UPDATE tasks SET updated_at = '2020-01-01T00:00:00Z', counterpart_address = NULL
                 WHERE id = ?1",
                [&older.id],
            )
            .expect("backdate");
        db.conn_ref()
            .execute(
                "UPDATE tasks SET counterpart_address = NULL WHERE id = ?1",
                [&newer.id],
            )
            .expect("clear address");

        let found = find_existing_task(
            &db,
            &tenant,
            None,
            Some("Dave"),
            &["battery".to_string()],
        )
        .expect("match")
        .expect("found");
        assert_eq!(found.id, newer.id);
    }

    #[test]
    fn test_self_addresses_never_match() {
        let db = test_db();
        let tenant = tenant(&db);
        insert(&db, "Internal follow-up", Some("Owner"), Some("owner@acme.test"));

        let found = find_existing_task(&db, &tenant, Some("owner@acme.test"), None, &[])
            .expect("match");
        assert!(found.is_none(), "own addresses are excluded from matching");
    }

    #[test]
    fn test_no_match_routes_to_create() {
        let db = test_db();
        let tenant = tenant(&db);
        let found = find_existing_task(
            &db,
            &tenant,
            Some("new@client.test"),
            Some("New Person"),
            &["anything".to_string()],
        )
        .expect("match");
        assert!(found.is_none());
    }

    #[test]
    fn test_completed_tasks_are_invisible() {
        let db = test_db();
        let tenant = tenant(&db);
        let task = insert(&db, "Closed out", Some("Dave"), Some("dave@client.test"));
        db.conn_ref()
            .execute("UPDATE tasks SET status = 'completed' WHERE id = ?1", [&task.id])
            .expect("complete");

        let found = find_existing_task(&db, &tenant, Some("dave@client.test"), None, &[])
            .expect("match");
        assert!(found.is_none());
    }
}
