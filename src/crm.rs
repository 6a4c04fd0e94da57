//! CRM connector seam.
//!
//! Adapters are external collaborators; the contract this core consumes is
//! "find contact / add note / update stage". The approval executor pushes CRM
//! notes through this seam and degrades to a reminder task when no connector
//! is configured or the push fails.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("CRM request failed: {0}")]
    Request(String),

    #[error("Contact '{0}' not found")]
    ContactNotFound(String),
}

/// A contact as resolved by the connector.
#[derive(Debug, Clone)]
pub struct CrmContact {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
}

/// Outcome of a CRM dispatch, surfaced to the approval result page.
#[derive(Debug, Clone)]
pub struct CrmOutcome {
    pub success: bool,
    pub message: String,
}

#[async_trait]
pub trait CrmConnector: Send + Sync {
    /// Resolve a contact by name and/or email.
    async fn find_contact(&self, name: &str, email: Option<&str>)
        -> Result<CrmContact, CrmError>;

    /// Append a note to a contact.
    async fn add_note(&self, contact_id: &str, note: &str) -> Result<(), CrmError>;

    /// Move a deal/contact to a pipeline stage.
    async fn update_stage(&self, contact_id: &str, stage: &str) -> Result<(), CrmError>;
}

/// Main dispatch: find the contact, then add the note.
///
/// A missing contact is not a failure of the connector, just "can't sync" —
/// the caller falls back to a reminder task either way.
pub async fn push_note(
    connector: &dyn CrmConnector,
    counterpart_name: &str,
    counterpart_email: Option<&str>,
    note: &str,
) -> CrmOutcome {
    let contact = match connector.find_contact(counterpart_name, counterpart_email).await {
        Ok(contact) => contact,
        Err(e) => {
            return CrmOutcome {
                success: false,
                message: e.to_string(),
            }
        }
    };

    match connector.add_note(&contact.id, note).await {
        Ok(()) => CrmOutcome {
            success: true,
            message: format!("Note added to {}", contact.name),
        },
        Err(e) => CrmOutcome {
            success: false,
            message: format!("Note push failed for {}: {e}", contact.name),
        },
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use std::sync::Mutex;

    /// Connector fake: knows one contact, records added notes.
    pub struct FakeCrm {
        pub known_contact: Option<CrmContact>,
        pub fail_notes: bool,
        pub notes: Mutex<Vec<(String, String)>>,
    }

    impl FakeCrm {
        pub fn with_contact(name: &str) -> Self {
            Self {
                known_contact: Some(CrmContact {
                    id: "contact-1".to_string(),
                    name: name.to_string(),
                    email: None,
                }),
                fail_notes: false,
                notes: Mutex::new(Vec::new()),
            }
        }

        pub fn empty() -> Self {
            Self {
                known_contact: None,
                fail_notes: false,
                notes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CrmConnector for FakeCrm {
        async fn find_contact(
            &self,
            name: &str,
            _email: Option<&str>,
        ) -> Result<CrmContact, CrmError> {
            self.known_contact
                .clone()
                .ok_or_else(|| CrmError::ContactNotFound(name.to_string()))
        }

        async fn add_note(&self, contact_id: &str, note: &str) -> Result<(), CrmError> {
            if self.fail_notes {
                return Err(CrmError::Request("simulated outage".to_string()));
            }
            self.notes
                .lock()
                .expect("lock")
                .push((contact_id.to_string(), note.to_string()));
            Ok(())
        }

        async fn update_stage(&self, _contact_id: &str, _stage: &str) -> Result<(), CrmError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::FakeCrm;
    use super::*;

    #[tokio::test]
    async fn test_push_note_success() {
        let crm = FakeCrm::with_contact("Dave Jones");
        let outcome = push_note(&crm, "Dave Jones", None, "Went with option B").await;
        assert!(outcome.success);
        assert_eq!(crm.notes.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_push_note_contact_not_found() {
        let crm = FakeCrm::empty();
        let outcome = push_note(&crm, "Nobody", None, "note").await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("Nobody"));
    }

    #[tokio::test]
    async fn test_push_note_outage() {
        let mut crm = FakeCrm::with_contact("Dave");
        crm.fail_notes = true;
        let outcome = push_note(&crm, "Dave", None, "note").await;
        assert!(!outcome.success);
    }
}
