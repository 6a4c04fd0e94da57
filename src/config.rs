//! Daemon configuration.
//!
//! Loaded once at startup from `~/.taskrelay/config.json` (overridable via
//! `TASKRELAY_CONFIG`). Missing service credentials are fatal here — nothing
//! after startup should be.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Config file not found at {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    pub endpoint: String,
    pub api_key: String,
    pub from_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub classifier: ClassifierConfig,
    pub outbound: OutboundConfig,
    /// Base URL the approval links point at, e.g. `https://app.example.com`.
    pub base_url: String,
}

impl AppConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.classifier.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "classifier.apiKey must be set".to_string(),
            ));
        }
        if self.outbound.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "outbound.apiKey must be set".to_string(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("baseUrl must be set".to_string()));
        }
        Ok(())
    }
}

fn config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var("TASKRELAY_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
    Ok(home.join(".taskrelay").join("config.json"))
}

/// Load and validate the config file.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let path = config_path()?;
    if !path.exists() {
        return Err(ConfigError::NotFound(path));
    }
    let raw = std::fs::read_to_string(&path)?;
    let config: AppConfig = serde_json::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig {
            classifier: ClassifierConfig {
                endpoint: "https://classify.example.test/v1/messages".to_string(),
                api_key: "key".to_string(),
                model: "classifier-large".to_string(),
            },
            outbound: OutboundConfig {
                endpoint: "https://mail.example.test/emails".to_string(),
                api_key: "key".to_string(),
                from_address: "relay@example.test".to_string(),
            },
            base_url: "https://app.example.test".to_string(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut config = valid();
        config.classifier.api_key = String::new();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.outbound.api_key = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_shape() {
        let raw = r#"{
            "classifier": {"endpoint": "https://c.test", "apiKey": "k", "model": "m"},
            "outbound": {"endpoint": "https://o.test", "apiKey": "k", "fromAddress": "f@t"},
            "baseUrl": "https://b.test"
        }"#;
        let config: AppConfig = serde_json::from_str(raw).expect("parse");
        assert_eq!(config.classifier.model, "m");
        assert_eq!(config.outbound.from_address, "f@t");
    }
}
