//! IMAP-over-TLS implementation of the `Mailbox` trait.
//!
//! One short-lived session per poll cycle: connect, login, select INBOX,
//! UID SEARCH SINCE the look-back window, UID FETCH envelopes and bodies,
//! STORE \Seen, logout. Sessions are never shared across connections.

use async_imap::types::Fetch;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::TryStreamExt;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::{Mailbox, MailboxError, MailMessage, MailSummary};
use crate::db::DbConnection;

type ImapSession = async_imap::Session<async_native_tls::TlsStream<Compat<TcpStream>>>;

pub struct ImapMailbox {
    session: ImapSession,
}

impl ImapMailbox {
    /// Open a TLS session and select INBOX for one connection's mailbox.
    pub async fn connect(conn: &DbConnection) -> Result<Self, MailboxError> {
        let tcp = TcpStream::connect((conn.imap_host.as_str(), conn.imap_port))
            .await
            .map_err(|e| MailboxError::Connect(format!("{}: {e}", conn.imap_host)))?;

        let tls = async_native_tls::TlsConnector::new()
            .connect(conn.imap_host.as_str(), tcp.compat())
            .await
            .map_err(|e| MailboxError::Connect(format!("TLS handshake failed: {e}")))?;

        let client = async_imap::Client::new(tls);
        let mut session = client
            .login(&conn.imap_username, &conn.imap_password)
            .await
            .map_err(|(e, _)| MailboxError::Auth(e.to_string()))?;

        session
            .select("INBOX")
            .await
            .map_err(|e| MailboxError::Protocol(format!("SELECT INBOX failed: {e}")))?;

        Ok(Self { session })
    }
}

/// Format a date the way IMAP SEARCH wants it: `06-Aug-2026`.
fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

fn summary_from_fetch(fetch: &Fetch) -> Option<MailSummary> {
    let server_id = fetch.uid?;
    let envelope = fetch.envelope();

    let (message_id, sender, subject) = match envelope {
        Some(env) => {
            let message_id = env
                .message_id
                .as_ref()
                .map(|raw| String::from_utf8_lossy(raw).trim().to_string());
            let sender = env
                .from
                .as_ref()
                .and_then(|list| list.first())
                .map(|addr| {
                    let mailbox = addr
                        .mailbox
                        .as_ref()
                        .map(|m| String::from_utf8_lossy(m).to_string())
                        .unwrap_or_default();
                    let host = addr
                        .host
                        .as_ref()
                        .map(|h| String::from_utf8_lossy(h).to_string())
                        .unwrap_or_default();
                    format!("{mailbox}@{host}").to_lowercase()
                })
                .unwrap_or_default();
            let subject = env
                .subject
                .as_ref()
                .map(|raw| String::from_utf8_lossy(raw).to_string())
                .unwrap_or_default();
            (message_id, sender, subject)
        }
        None => (None, String::new(), String::new()),
    };

    Some(MailSummary {
        server_id,
        message_id,
        sender,
        subject,
        received_at: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
    })
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn list_since(&mut self, since: NaiveDate) -> Result<Vec<MailSummary>, MailboxError> {
        let query = format!("SINCE {}", imap_date(since));
        let uids = self
            .session
            .uid_search(&query)
            .await
            .map_err(|e| MailboxError::Protocol(format!("UID SEARCH failed: {e}")))?;

        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let uid_set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let fetches: Vec<Fetch> = {
            let stream = self
                .session
                .uid_fetch(&uid_set, "(UID ENVELOPE INTERNALDATE)")
                .await
                .map_err(|e| MailboxError::Protocol(format!("UID FETCH failed: {e}")))?;
            stream
                .try_collect()
                .await
                .map_err(|e| MailboxError::Protocol(format!("UID FETCH stream failed: {e}")))?
        };

        Ok(fetches.iter().filter_map(summary_from_fetch).collect())
    }

    async fn fetch_message(&mut self, server_id: u32) -> Result<MailMessage, MailboxError> {
        let fetches: Vec<Fetch> = {
            let stream = self
                .session
                .uid_fetch(server_id.to_string(), "(UID RFC822)")
                .await
                .map_err(|e| MailboxError::Protocol(format!("UID FETCH body failed: {e}")))?;
            stream
                .try_collect()
                .await
                .map_err(|e| MailboxError::Protocol(format!("UID FETCH stream failed: {e}")))?
        };

        let fetch = fetches
            .iter()
            .find(|f| f.uid == Some(server_id))
            .ok_or(MailboxError::Fetch(server_id))?;
        let raw = fetch.body().ok_or(MailboxError::Fetch(server_id))?;

        Ok(super::parse_raw_message(server_id, raw))
    }

    async fn mark_seen(&mut self, server_id: u32) -> Result<(), MailboxError> {
        let stream = self
            .session
            .uid_store(server_id.to_string(), "+FLAGS (\\Seen)")
            .await
            .map_err(|e| MailboxError::Protocol(format!("UID STORE failed: {e}")))?;
        let _: Vec<Fetch> = stream
            .try_collect()
            .await
            .map_err(|e| MailboxError::Protocol(format!("UID STORE stream failed: {e}")))?;
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        self.session
            .logout()
            .await
            .map_err(|e| MailboxError::Protocol(format!("LOGOUT failed: {e}")))
    }
}
