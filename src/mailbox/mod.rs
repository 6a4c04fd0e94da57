//! Mailbox access for the ingestion poller.
//!
//! The poller talks to a `Mailbox` trait: list envelopes in a look-back
//! window, fetch one full message, flag it seen. The production
//! implementation is IMAP-over-TLS (`imap.rs`); tests drive the poller with
//! an in-memory fake.

pub mod imap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mail_parser::MessageParser;
use thiserror::Error;

pub use imap::ImapMailbox;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Login failed: {0}")]
    Auth(String),

    #[error("Mailbox operation failed: {0}")]
    Protocol(String),

    #[error("Message {0} could not be fetched")]
    Fetch(u32),
}

/// Lightweight envelope data for one mailbox item, listed before any body is
/// fetched.
#[derive(Debug, Clone)]
pub struct MailSummary {
    /// Server-assigned item id (IMAP UID).
    pub server_id: u32,
    /// Protocol message identifier (Message-ID header), when the server
    /// exposes one.
    pub message_id: Option<String>,
    pub sender: String,
    pub subject: String,
    pub received_at: Option<DateTime<Utc>>,
}

/// A fully fetched message.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub server_id: u32,
    pub message_id: String,
    pub sender_address: String,
    pub sender_name: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailbox: Send {
    /// List items received on or after `since`, regardless of read-flag
    /// state. Read flags are unreliable across forwarding rules, so the
    /// ledger — not \Seen — is the source of truth for "already handled".
    async fn list_since(&mut self, since: NaiveDate) -> Result<Vec<MailSummary>, MailboxError>;

    /// Fetch one full message by server id.
    async fn fetch_message(&mut self, server_id: u32) -> Result<MailMessage, MailboxError>;

    /// Best-effort: flag a message seen so human inbox views stay tidy.
    async fn mark_seen(&mut self, server_id: u32) -> Result<(), MailboxError>;

    /// Close the session.
    async fn logout(&mut self) -> Result<(), MailboxError>;
}

/// Normalize a subject for same-cycle duplicate collapse: repeatedly strip
/// leading `Re:` / `Fwd:` / `Fw:` tokens, case-fold, collapse whitespace.
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lowered = s.to_lowercase();
        let stripped = ["re:", "fwd:", "fw:"]
            .iter()
            .find(|prefix| lowered.starts_with(*prefix))
            .map(|prefix| s[prefix.len()..].trim_start());
        match stripped {
            Some(rest) => s = rest,
            None => break,
        }
    }
    s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse an RFC 822 From header value into (address, display name).
///
/// Handles `"Name" <addr@host>` and bare `addr@host`. Falls back to deriving
/// a name from the local part when no display name is present.
pub fn parse_from_header(from: &str) -> (String, String) {
    static ADDRESS_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = ADDRESS_RE
        .get_or_init(|| regex::Regex::new(r"<?([^<>\s]+@[^<>\s]+)>?").expect("valid regex"));
    let address = re
        .captures(from.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_else(|| from.trim().to_lowercase());

    let name = from
        .split('<')
        .next()
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty() && !s.contains('@'))
        .unwrap_or_else(|| {
            address
                .split('@')
                .next()
                .unwrap_or("")
                .replace('.', " ")
        });

    (address, name)
}

/// Parse a raw RFC 822 message into a `MailMessage`.
///
/// Prefers the text/plain part; falls back to tag-stripped HTML. A message
/// without a Message-ID header gets a synthesized one so it can still be
/// ledger-recorded.
pub fn parse_raw_message(server_id: u32, raw: &[u8]) -> MailMessage {
    let parsed = MessageParser::default().parse(raw);

    let (message_id, sender_raw, subject, body) = match &parsed {
        Some(msg) => {
            let message_id = msg
                .message_id()
                .map(|s| format!("<{s}>"))
                .unwrap_or_else(|| format!("<generated-{}>", uuid::Uuid::new_v4()));
            let sender = msg
                .from()
                .and_then(|a| a.first())
                .map(|a| {
                    let addr = a.address().unwrap_or_default();
                    match a.name() {
                        Some(name) => format!("{name} <{addr}>"),
                        None => addr.to_string(),
                    }
                })
                .unwrap_or_default();
            let subject = msg.subject().unwrap_or("(no subject)").to_string();
            let body = extract_text(msg);
            (message_id, sender, subject, body)
        }
        None => (
            format!("<unparsed-{}>", uuid::Uuid::new_v4()),
            String::new(),
            "(unparsable message)".to_string(),
            String::new(),
        ),
    };

    let (sender_address, sender_name) = parse_from_header(&sender_raw);

    MailMessage {
        server_id,
        message_id,
        sender_address,
        sender_name,
        subject,
        body,
    }
}

/// Extract readable text from a parsed message: text/plain first, then
/// tag-stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Strip HTML tags from content (basic) and normalize whitespace.
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sender patterns for automated mail that is never worth classifying.
const SYSTEM_SENDER_PATTERNS: &[&str] = &[
    "noreply",
    "no-reply",
    "donotreply",
    "mailer-daemon",
    "postmaster",
    "notification@",
    "alerts@",
    "system@",
];

/// True when the sender is an automated system address (bounces, alerts)
/// or one of the tenant's own notification senders. Such items are
/// ledger-marked but never classified. Transcription senders are exempt:
/// voice memo services send from no-reply addresses.
pub fn is_system_sender(sender: &str, own_senders: &[String], transcription_senders: &[String]) -> bool {
    let sender = sender.to_lowercase();
    if transcription_senders.iter().any(|t| sender.contains(t)) {
        return false;
    }
    if own_senders.iter().any(|own| &sender == own) {
        return true;
    }
    SYSTEM_SENDER_PATTERNS.iter().any(|p| sender.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_subject_strips_reply_prefixes() {
        assert_eq!(normalize_subject("Quote for Jones"), "quote for jones");
        assert_eq!(normalize_subject("Re: Quote for Jones"), "quote for jones");
        assert_eq!(normalize_subject("RE: FWD: Quote for Jones"), "quote for jones");
        assert_eq!(normalize_subject("Fw:Re:  Quote   for Jones "), "quote for jones");
    }

    #[test]
    fn test_normalize_subject_keeps_inner_tokens() {
        assert_eq!(
            normalize_subject("Progress report: phase 2"),
            "progress report: phase 2"
        );
    }

    #[test]
    fn test_parse_from_header_with_display_name() {
        let (addr, name) = parse_from_header("\"Dave Jones\" <Dave.Jones@Client.Test>");
        assert_eq!(addr, "dave.jones@client.test");
        assert_eq!(name, "Dave Jones");
    }

    #[test]
    fn test_parse_from_header_bare_address() {
        let (addr, name) = parse_from_header("dave.jones@client.test");
        assert_eq!(addr, "dave.jones@client.test");
        assert_eq!(name, "dave jones");
    }

    #[test]
    fn test_parse_raw_message_plain_text() {
        let raw = b"Message-ID: <abc@mail.test>\r\n\
                    From: Dave Jones <dave@client.test>\r\n\
                    Subject: Quote question\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    Can you resend the battery pricing?\r\n";
        let msg = parse_raw_message(7, raw);
        assert_eq!(msg.server_id, 7);
        assert_eq!(msg.message_id, "<abc@mail.test>");
        assert_eq!(msg.sender_address, "dave@client.test");
        assert_eq!(msg.sender_name, "Dave Jones");
        assert_eq!(msg.subject, "Quote question");
        assert!(msg.body.contains("battery pricing"));
    }

    #[test]
    fn test_parse_raw_message_without_message_id_synthesizes_one() {
        let raw = b"From: dave@client.test\r\nSubject: Hi\r\n\r\nBody\r\n";
        let msg = parse_raw_message(1, raw);
        assert!(msg.message_id.starts_with("<generated-"));
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(
            strip_html("<p>Hello <b>there</b></p>\n<div>friend</div>"),
            "Hello there friend"
        );
    }

    #[test]
    fn test_is_system_sender() {
        let own = vec!["relay@acme.test".to_string()];
        let transcription = vec!["no-reply@memos.test".to_string()];

        assert!(is_system_sender("noreply@shop.test", &own, &transcription));
        assert!(is_system_sender("MAILER-DAEMON@mx.test", &own, &transcription));
        assert!(is_system_sender("relay@acme.test", &own, &transcription));
        assert!(!is_system_sender("dave@client.test", &own, &transcription));
        // Voice transcription senders are no-reply but must pass through
        assert!(!is_system_sender("no-reply@memos.test", &own, &transcription));
    }
}
