use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::*;

const TASK_COLUMNS: &str = "id, tenant_id, title, description, counterpart_name,
        counterpart_address, due_date, due_time, priority, status,
        reminder_sent_at, created_at, updated_at";

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbTask> {
    Ok(DbTask {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        counterpart_name: row.get(4)?,
        counterpart_address: row.get(5)?,
        due_date: row.get(6)?,
        due_time: row.get(7)?,
        priority: row.get(8)?,
        status: row.get(9)?,
        reminder_sent_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

/// Fields for a new task. Id and timestamps are assigned on insert.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub tenant_id: String,
    pub title: String,
    pub description: String,
    pub counterpart_name: Option<String>,
    pub counterpart_address: Option<String>,
    pub due_date: Option<String>,
    pub due_time: Option<String>,
    pub priority: String,
}

impl TaskDb {
    /// Insert a new pending task. Returns the stored row.
    pub fn insert_task(&self, new: &NewTask) -> Result<DbTask, String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let priority = if new.priority.is_empty() {
            "medium"
        } else {
            &new.priority
        };

        self.conn
            .execute(
                "INSERT INTO tasks
                    (id, tenant_id, title, description, counterpart_name,
                     counterpart_address, due_date, due_time, priority, status,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, ?10)",
                params![
                    id,
                    new.tenant_id,
                    new.title,
                    new.description,
                    new.counterpart_name,
                    new.counterpart_address.as_deref().map(str::to_lowercase),
                    new.due_date,
                    new.due_time,
                    priority,
                    now,
                ],
            )
            .map_err(|e| format!("Failed to insert task '{}': {e}", new.title))?;

        self.get_task(&id)?
            .ok_or_else(|| format!("Task {id} vanished after insert"))
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<DbTask>, String> {
        self.conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id],
                map_task_row,
            )
            .optional()
            .map_err(|e| format!("Failed to load task {task_id}: {e}"))
    }

    /// Append a note to a task and touch the task's `updated_at`.
    pub fn append_note(&self, task_id: &str, content: &str, source: &str) -> Result<DbNote, String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO notes (id, task_id, content, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, task_id, content, source, now],
            )
            .map_err(|e| format!("Failed to append note to task {task_id}: {e}"))?;

        self.conn
            .execute(
                "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
                params![now, task_id],
            )
            .map_err(|e| format!("Failed to touch task {task_id}: {e}"))?;

        Ok(DbNote {
            id,
            task_id: task_id.to_string(),
            content: content.to_string(),
            source: source.to_string(),
            created_at: now,
        })
    }

    pub fn get_notes(&self, task_id: &str) -> Result<Vec<DbNote>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, content, source, created_at
                 FROM notes WHERE task_id = ?1 ORDER BY created_at",
            )
            .map_err(|e| format!("Failed to prepare notes query: {e}"))?;

        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(DbNote {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    content: row.get(2)?,
                    source: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(|e| format!("Failed to query notes: {e}"))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| format!("Failed to read note row: {e}"))?);
        }
        Ok(results)
    }

    /// Open tasks for a counterpart address, most recently updated first.
    pub fn open_tasks_by_address(
        &self,
        tenant_id: &str,
        address: &str,
    ) -> Result<Vec<DbTask>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE tenant_id = ?1 AND status = 'pending'
                   AND counterpart_address = ?2
                 ORDER BY updated_at DESC"
            ))
            .map_err(|e| format!("Failed to prepare address match query: {e}"))?;

        let rows = stmt
            .query_map(params![tenant_id, address.to_lowercase()], map_task_row)
            .map_err(|e| format!("Failed to query tasks by address: {e}"))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| format!("Failed to read task row: {e}"))?);
        }
        Ok(results)
    }

    /// Open tasks whose title or description contains the keyword
    /// (case-insensitive), most recently updated first.
    pub fn open_tasks_by_keyword(
        &self,
        tenant_id: &str,
        keyword: &str,
    ) -> Result<Vec<DbTask>, String> {
        let pattern = format!("%{}%", keyword.to_lowercase());
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE tenant_id = ?1 AND status = 'pending'
                   AND (lower(title) LIKE ?2 OR lower(description) LIKE ?2)
                 ORDER BY updated_at DESC"
            ))
            .map_err(|e| format!("Failed to prepare keyword match query: {e}"))?;

        let rows = stmt
            .query_map(params![tenant_id, pattern], map_task_row)
            .map_err(|e| format!("Failed to query tasks by keyword: {e}"))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| format!("Failed to read task row: {e}"))?);
        }
        Ok(results)
    }

    /// All open tasks for a tenant, ordered by due date then time. Used by the
    /// digest builder.
    pub fn open_tasks(&self, tenant_id: &str) -> Result<Vec<DbTask>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE tenant_id = ?1 AND status = 'pending'
                 ORDER BY due_date ASC NULLS LAST, due_time ASC NULLS LAST"
            ))
            .map_err(|e| format!("Failed to prepare open tasks query: {e}"))?;

        let rows = stmt
            .query_map(params![tenant_id], map_task_row)
            .map_err(|e| format!("Failed to query open tasks: {e}"))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| format!("Failed to read task row: {e}"))?);
        }
        Ok(results)
    }

    /// Pending tasks that carry a due_time, across all tenants. The reminder
    /// scheduler scans these each tick.
    pub fn pending_tasks_with_due_time(&self) -> Result<Vec<DbTask>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status = 'pending' AND due_time IS NOT NULL"
            ))
            .map_err(|e| format!("Failed to prepare due-time query: {e}"))?;

        let rows = stmt
            .query_map([], map_task_row)
            .map_err(|e| format!("Failed to query due-time tasks: {e}"))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| format!("Failed to read task row: {e}"))?);
        }
        Ok(results)
    }

    /// Stamp `reminder_sent_at` after a reminder went out for this task's
    /// current due occurrence.
    pub fn stamp_reminder_sent(
        &self,
        task_id: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE tasks SET reminder_sent_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), task_id],
            )
            .map_err(|e| format!("Failed to stamp reminder for {task_id}: {e}"))?;
        Ok(())
    }
}
