//! Shared daemon state: the loaded config plus the outbound service seams.
//!
//! Database handles are NOT shared here — each background loop opens its own
//! (`TaskDb::open()`), and the storage layer's constraints do the
//! coordinating.

use crate::classify::{Classifier, HttpClassifier};
use crate::config::AppConfig;
use crate::notify::{EmailSender, HttpEmailSender};

pub struct AppState {
    pub config: AppConfig,
    pub classifier: Box<dyn Classifier>,
    pub mailer: Box<dyn EmailSender>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let classifier = HttpClassifier::new(
            config.classifier.endpoint.clone(),
            config.classifier.api_key.clone(),
            config.classifier.model.clone(),
        );
        let mailer = HttpEmailSender::new(
            config.outbound.endpoint.clone(),
            config.outbound.api_key.clone(),
            config.outbound.from_address.clone(),
        );
        Self {
            config,
            classifier: Box::new(classifier),
            mailer: Box::new(mailer),
        }
    }
}
