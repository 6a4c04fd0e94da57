//! Typed action model for classifier output.
//!
//! The classification service returns loosely-shaped `ActionRecord` objects
//! keyed by an `action_type` string. Those convert into the `ExtractedAction`
//! enum — one variant per known type, each carrying only the fields that type
//! needs — so the tier classifier and the executors are exhaustive matches and
//! an unrecognized type is a checked `Unknown` arm instead of a string
//! fallthrough.

use serde::{Deserialize, Serialize};

/// Risk tier for an extracted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTier {
    /// Low-risk: executed immediately, no human confirmation.
    Auto,
    /// Higher-risk: queued until a human approves it by emailed link.
    Approval,
}

/// One action as returned by the classification service. All fields optional;
/// this is the wire shape and the payload persisted for pending actions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionRecord {
    pub action_type: String,
    pub title: String,
    pub description: String,
    pub counterpart_name: Option<String>,
    pub counterpart_address: Option<String>,
    pub business: Option<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub due_date: Option<String>,
    pub due_time: Option<String>,
    /// Note text for `update_crm` actions.
    pub crm_notes: Option<String>,
    /// Location/duration/attendees for `create_calendar_event` actions.
    pub calendar_details: Option<String>,
    /// Note content for `update_task_notes` actions.
    pub note_content: Option<String>,
    /// Keywords to match this action against existing open tasks.
    pub keywords: Vec<String>,
}

/// Fields shared by every action variant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionCommon {
    pub title: String,
    pub description: String,
    pub counterpart_name: Option<String>,
    pub counterpart_address: Option<String>,
    pub business: Option<String>,
    pub category: Option<String>,
    pub priority: String,
    pub due_date: Option<String>,
    pub due_time: Option<String>,
}

/// An action extracted from one inbound message. Transient: lives only for
/// the duration of processing that message (or, serialized as the original
/// `ActionRecord`, inside a pending approval row).
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedAction {
    CreateTask(ActionCommon),
    SetCallback(ActionCommon),
    SetReminder(ActionCommon),
    UpdateTaskNotes { common: ActionCommon, note: String },
    UpdateCrm { common: ActionCommon, crm_notes: String },
    SendEmail(ActionCommon),
    CreateCalendarEvent { common: ActionCommon, calendar_details: String },
    ChangeDealStatus(ActionCommon),
    DeleteTask(ActionCommon),
    Unknown { action_type: String, common: ActionCommon },
}

impl ExtractedAction {
    /// Tier policy. Fails safe: anything unrecognized asks a human.
    pub fn tier(&self) -> ActionTier {
        match self {
            ExtractedAction::CreateTask(_)
            | ExtractedAction::SetCallback(_)
            | ExtractedAction::SetReminder(_)
            | ExtractedAction::UpdateTaskNotes { .. } => ActionTier::Auto,
            ExtractedAction::UpdateCrm { .. }
            | ExtractedAction::SendEmail(_)
            | ExtractedAction::CreateCalendarEvent { .. }
            | ExtractedAction::ChangeDealStatus(_)
            | ExtractedAction::DeleteTask(_)
            | ExtractedAction::Unknown { .. } => ActionTier::Approval,
        }
    }

    pub fn common(&self) -> &ActionCommon {
        match self {
            ExtractedAction::CreateTask(c)
            | ExtractedAction::SetCallback(c)
            | ExtractedAction::SetReminder(c)
            | ExtractedAction::SendEmail(c)
            | ExtractedAction::ChangeDealStatus(c)
            | ExtractedAction::DeleteTask(c) => c,
            ExtractedAction::UpdateTaskNotes { common, .. }
            | ExtractedAction::UpdateCrm { common, .. }
            | ExtractedAction::CreateCalendarEvent { common, .. }
            | ExtractedAction::Unknown { common, .. } => common,
        }
    }

    /// The wire-format action_type string.
    pub fn kind(&self) -> &str {
        match self {
            ExtractedAction::CreateTask(_) => "create_task",
            ExtractedAction::SetCallback(_) => "set_callback",
            ExtractedAction::SetReminder(_) => "set_reminder",
            ExtractedAction::UpdateTaskNotes { .. } => "update_task_notes",
            ExtractedAction::UpdateCrm { .. } => "update_crm",
            ExtractedAction::SendEmail(_) => "send_email",
            ExtractedAction::CreateCalendarEvent { .. } => "create_calendar_event",
            ExtractedAction::ChangeDealStatus(_) => "change_deal_status",
            ExtractedAction::DeleteTask(_) => "delete_task",
            ExtractedAction::Unknown { action_type, .. } => action_type,
        }
    }
}

impl ActionRecord {
    fn common(&self) -> ActionCommon {
        ActionCommon {
            title: self.title.clone(),
            description: self.description.clone(),
            counterpart_name: self.counterpart_name.clone(),
            counterpart_address: self.counterpart_address.clone(),
            business: self.business.clone(),
            category: self.category.clone(),
            priority: self
                .priority
                .clone()
                .unwrap_or_else(|| "medium".to_string()),
            due_date: self.due_date.clone(),
            due_time: self.due_time.clone(),
        }
    }
}

impl From<ActionRecord> for ExtractedAction {
    fn from(record: ActionRecord) -> Self {
        let common = record.common();
        match record.action_type.as_str() {
            "create_task" => ExtractedAction::CreateTask(common),
            "set_callback" => ExtractedAction::SetCallback(common),
            "set_reminder" => ExtractedAction::SetReminder(common),
            "update_task_notes" => ExtractedAction::UpdateTaskNotes {
                note: record
                    .note_content
                    .clone()
                    .unwrap_or_else(|| record.description.clone()),
                common,
            },
            "update_crm" => ExtractedAction::UpdateCrm {
                crm_notes: record
                    .crm_notes
                    .clone()
                    .unwrap_or_else(|| record.description.clone()),
                common,
            },
            "send_email" => ExtractedAction::SendEmail(common),
            "create_calendar_event" => ExtractedAction::CreateCalendarEvent {
                calendar_details: record.calendar_details.clone().unwrap_or_default(),
                common,
            },
            "change_deal_status" => ExtractedAction::ChangeDealStatus(common),
            "delete_task" => ExtractedAction::DeleteTask(common),
            other => ExtractedAction::Unknown {
                action_type: other.to_string(),
                common,
            },
        }
    }
}
