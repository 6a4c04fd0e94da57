//! Shared type definitions for the database layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

/// A row from the `tenants` table.
///
/// Created by tenant setup (external). The core reads it for timezone,
/// vocabulary, and addressing, and mutates only `last_summary_sent_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTenant {
    pub id: String,
    pub name: String,
    pub notify_address: String,
    pub timezone: String,
    /// Local clock time ("HH:MM") at which the daily digest fires.
    pub summary_time: String,
    pub summary_enabled: bool,
    pub last_summary_sent_at: Option<String>,
    /// JSON array of the tenant's own outbound addresses, never matched as a
    /// counterpart.
    pub self_addresses: String,
    /// JSON array of sender addresses whose mail is a voice transcription.
    pub transcription_senders: String,
    /// Tenant business context injected into the classification prompt.
    pub prompt_context: String,
    /// JSON array of category vocabulary for extracted actions.
    pub categories: String,
}

impl DbTenant {
    /// Parse the JSON self-address list, lowercased. Bad JSON yields empty.
    pub fn self_address_list(&self) -> Vec<String> {
        parse_address_list(&self.self_addresses)
    }

    /// Parse the JSON transcription-sender list, lowercased.
    pub fn transcription_sender_list(&self) -> Vec<String> {
        parse_address_list(&self.transcription_senders)
    }

    /// Parse the JSON category vocabulary.
    pub fn category_list(&self) -> Vec<String> {
        serde_json::from_str::<Vec<String>>(&self.categories).unwrap_or_default()
    }
}

fn parse_address_list(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw)
        .unwrap_or_default()
        .into_iter()
        .map(|a| a.to_lowercase())
        .collect()
}

/// A row from the `connections` table: one tenant mailbox to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConnection {
    pub id: String,
    pub tenant_id: String,
    pub mailbox_address: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_username: String,
    pub imap_password: String,
    pub sync_frequency_mins: i64,
    pub last_sync_at: Option<String>,
    pub is_active: bool,
}

/// A row from the `tasks` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTask {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub description: String,
    pub counterpart_name: Option<String>,
    pub counterpart_address: Option<String>,
    pub due_date: Option<String>,
    pub due_time: Option<String>,
    pub priority: String,
    pub status: String,
    pub reminder_sent_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `notes` table. Append-only child of a task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbNote {
    pub id: String,
    pub task_id: String,
    pub content: String,
    pub source: String,
    pub created_at: String,
}

/// A row from the `pending_actions` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPendingAction {
    pub token: String,
    pub tenant_id: String,
    pub action_type: String,
    /// Serialized `ActionRecord` payload.
    pub action_data: String,
    pub source_subject: Option<String>,
    pub status: String,
    pub created_at: String,
    pub processed_at: Option<String>,
    pub expires_at: String,
}
