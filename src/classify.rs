//! Content classification adapter.
//!
//! Builds a tenant-scoped prompt from one inbound message, sends it to the
//! external classification service, and parses the structured response into
//! typed action records. Malformed output falls back to a deterministic
//! minimal classification — classification never hard-fails the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

use crate::actions::ActionRecord;
use crate::db::{DbTask, DbTenant};
use crate::mailbox::MailMessage;

/// Classification service output cap on the inbound body.
const BODY_CAP_CHARS: usize = 5000;

/// How many of the counterpart's open tasks to list in the prompt.
const OPEN_TASK_CONTEXT_LIMIT: usize = 5;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Classification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Classification service returned status {0}")]
    Status(u16),

    #[error("Classification service returned an empty response")]
    Empty,
}

/// Counterpart identity extracted by the service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Counterpart {
    pub name: Option<String>,
    pub address: Option<String>,
}

/// The service's structured response for one message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Classification {
    pub summary: String,
    pub counterpart: Option<Counterpart>,
    pub actions: Vec<ActionRecord>,
}

/// Seam to the external text-classification service: prompt in, raw text out.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ClassifierError>;
}

/// HTTP client for the classification service's completion endpoint.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpClassifier {
    pub fn new(endpoint: String, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: Vec<CompletionBlock>,
}

#[derive(Debug, Deserialize)]
struct CompletionBlock {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn complete(&self, prompt: &str) -> Result<String, ClassifierError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "max_tokens": 2000,
                "messages": [{"role": "user", "content": prompt}],
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClassifierError::Status(status.as_u16()));
        }

        let parsed: CompletionResponse = resp.json().await?;
        let text = parsed
            .content
            .first()
            .map(|b| b.text.clone())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ClassifierError::Empty);
        }
        Ok(text)
    }
}

/// Truncate on a char boundary without splitting a multi-byte sequence.
fn cap_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Build the tenant-scoped extraction prompt for one message.
///
/// The business context, category vocabulary, and today's date come from
/// tenant configuration, never from constants. When the counterpart has open
/// tasks, a short list is included so the service can tell a follow-up from a
/// new matter. Voice-transcription senders get the multi-action memo variant.
pub fn build_prompt(
    tenant: &DbTenant,
    message: &MailMessage,
    open_tasks: &[DbTask],
    now: DateTime<Utc>,
    is_transcription: bool,
) -> String {
    let tz: Tz = tenant.timezone.parse().unwrap_or(chrono_tz::UTC);
    let today = now.with_timezone(&tz).format("%Y-%m-%d");

    let categories = tenant.category_list().join("|");
    let body = cap_chars(&message.body, BODY_CAP_CHARS);

    let mut task_context = String::new();
    if !open_tasks.is_empty() {
        task_context.push_str("\nOPEN TASKS FOR THIS SENDER (decide follow-up vs new matter):\n");
        for task in open_tasks.iter().take(OPEN_TASK_CONTEXT_LIMIT) {
            task_context.push_str(&format!("- [{}] {}\n", task.id, task.title));
        }
        task_context.push_str(
            "If this message continues one of these, use action_type \
             \"update_task_notes\" instead of \"create_task\".\n",
        );
    }

    let source_block = if is_transcription {
        format!(
            "The user recorded a voice memo after a call or site visit. The \
             transcription below may contain MULTIPLE action items. Extract ALL \
             of them.\n\nTRANSCRIPTION:\n{body}\n"
        )
    } else {
        format!(
            "Analyze this forwarded email and extract any action items.\n\n\
             EMAIL DETAILS:\nFrom: {} <{}>\nSubject: {}\nContent: {body}\n",
            message.sender_name, message.sender_address, message.subject
        )
    };

    format!(
        "You are the task assistant for {name}.\n\n\
         {source_block}\n\
         BUSINESS CONTEXT:\n{context}\n\
         {task_context}\n\
         EXTRACT actions as JSON:\n\
         {{\n\
           \"summary\": \"One-line summary\",\n\
           \"counterpart\": {{\"name\": \"...\", \"address\": \"...\"}} or null,\n\
           \"actions\": [\n\
             {{\n\
               \"action_type\": \"create_task|update_task_notes|set_callback|set_reminder|update_crm|send_email|create_calendar_event|change_deal_status|delete_task\",\n\
               \"title\": \"Clear actionable title\",\n\
               \"description\": \"What needs to be done\",\n\
               \"counterpart_name\": \"Name this relates to, or null\",\n\
               \"counterpart_address\": \"Email if known, or null\",\n\
               \"category\": \"{categories}\",\n\
               \"priority\": \"low|medium|high|urgent\",\n\
               \"due_date\": \"YYYY-MM-DD or null\",\n\
               \"due_time\": \"HH:MM or null\",\n\
               \"keywords\": [\"words to match this against existing tasks\"],\n\
               \"crm_notes\": \"If update_crm: the note text. null otherwise.\",\n\
               \"calendar_details\": \"If create_calendar_event: details. null otherwise.\"\n\
             }}\n\
           ]\n\
         }}\n\n\
         Rules:\n\
         - Extract EVERY action item, even casual mentions.\n\
         - Today's date: {today}. Resolve relative dates against it.\n\
         - If no actions are needed, return {{\"summary\": \"...\", \"counterpart\": null, \"actions\": []}}.\n\
         - Return ONLY valid JSON, no explanation.",
        name = tenant.name,
        context = tenant.prompt_context,
    )
}

/// Parse the service response as JSON, tolerating markdown code fences.
pub fn parse_classification(raw: &str) -> Option<Classification> {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped;
    }

    serde_json::from_str(text.trim()).ok()
}

/// Deterministic minimal classification used when the service output is
/// unparsable: one medium-priority create_task titled after the subject.
pub fn fallback_classification(message: &MailMessage) -> Classification {
    Classification {
        summary: message.subject.clone(),
        counterpart: Some(Counterpart {
            name: Some(message.sender_name.clone()),
            address: Some(message.sender_address.clone()),
        }),
        actions: vec![ActionRecord {
            action_type: "create_task".to_string(),
            title: message.subject.clone(),
            description: cap_chars(&message.body, 300).to_string(),
            counterpart_name: Some(message.sender_name.clone()),
            counterpart_address: Some(message.sender_address.clone()),
            priority: Some("medium".to_string()),
            ..Default::default()
        }],
    }
}

/// Classify one message: one service call, fallback on any failure.
pub async fn classify_message(
    classifier: &dyn Classifier,
    tenant: &DbTenant,
    message: &MailMessage,
    open_tasks: &[DbTask],
    now: DateTime<Utc>,
) -> Classification {
    let is_transcription = tenant
        .transcription_sender_list()
        .iter()
        .any(|s| message.sender_address.contains(s.as_str()));

    let prompt = build_prompt(tenant, message, open_tasks, now, is_transcription);

    match classifier.complete(&prompt).await {
        Ok(raw) => match parse_classification(&raw) {
            Some(classification) => classification,
            None => {
                log::warn!(
                    "Unparsable classification for '{}', using fallback",
                    message.subject
                );
                fallback_classification(message)
            }
        },
        Err(e) => {
            log::warn!(
                "Classification service error for '{}': {e}, using fallback",
                message.subject
            );
            fallback_classification(message)
        }
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use std::sync::Mutex;

    /// Classifier fake returning scripted responses in order, recording
    /// every prompt it was asked to complete.
    pub struct ScriptedClassifier {
        responses: Mutex<Vec<Result<String, ClassifierError>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedClassifier {
        pub fn new(responses: Vec<Result<String, ClassifierError>>) -> Self {
            let mut responses = responses;
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.prompts.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn complete(&self, prompt: &str) -> Result<String, ClassifierError> {
            self.prompts.lock().expect("lock").push(prompt.to_string());
            self.responses
                .lock()
                .expect("lock")
                .pop()
                .unwrap_or(Err(ClassifierError::Empty))
        }
    }
}
