//! Crate-level error taxonomy.
//!
//! Errors are classified by recoverability: transient infrastructure
//! failures (mailbox, classifier, outbound mail, CRM) are logged and retried
//! on the next tick; configuration and storage failures are not.

use thiserror::Error;

use crate::classify::ClassifierError;
use crate::config::ConfigError;
use crate::crm::CrmError;
use crate::db::DbError;
use crate::mailbox::MailboxError;
use crate::notify::SendError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Crm(#[from] CrmError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Storage(String),
}

impl PipelineError {
    /// Transient errors are skipped for this tick and retried next tick;
    /// they must never crash a loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Mailbox(_)
                | PipelineError::Classifier(_)
                | PipelineError::Send(_)
                | PipelineError::Crm(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let transient = PipelineError::Mailbox(MailboxError::Connect("timeout".to_string()));
        assert!(transient.is_transient());

        let fatal = PipelineError::Config(ConfigError::Invalid("missing key".to_string()));
        assert!(!fatal.is_transient());

        let storage = PipelineError::Storage("disk full".to_string());
        assert!(!storage.is_transient());
    }
}
