use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::status::PresenceStatus;

pub const DEFAULT_PORT: u16 = 5298;
pub const DEFAULT_STATUS_MESSAGE: &str = "The truth is out there...";

/// Settings for one local account. Every field may be omitted from the
/// config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Announced identifier. Derived from the user and host name when empty.
    pub account_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub status_message: String,
    /// Chat port tried first; an ephemeral one is used when it's taken.
    pub port: u16,
    pub initial_status: PresenceStatus,
    pub connect_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
            status_message: DEFAULT_STATUS_MESSAGE.to_string(),
            port: DEFAULT_PORT,
            initial_status: PresenceStatus::Online,
            connect_timeout_secs: 10,
        }
    }
}

impl ProviderConfig {
    /// Reads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The configured identifier, or `<user>@<hostname>` when none is set.
    pub fn account_id(&self) -> String {
        match self.account_id.trim() {
            "" => default_account_id(),
            id => id.to_string(),
        }
    }
}

fn default_account_id() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{}", host.trim_end_matches(".local"))
}
