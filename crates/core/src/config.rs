use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::remote::{BasicAuth, RcloneRcConfig};
use crate::{Error, Result};

pub const DEFAULT_RC_ADDR: &str = "http://127.0.0.1:5572";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub rc: RcSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcSettings {
    pub addr: String,
    /// `user:password`, empty for no auth.
    pub auth: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub max_transfers: usize,
    pub buffer_bytes: u64,
    pub max_rounds: u32,
    pub liveness_ms: u64,
}

impl Default for RcSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_RC_ADDR.to_string(),
            auth: String::new(),
            poll_interval_ms: 5_000,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_transfers: 10,
            buffer_bytes: 128 * 1024 * 1024,
            max_rounds: 10,
            liveness_ms: 2_000,
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.rc.poll_interval_ms)
    }

    pub fn liveness(&self) -> Duration {
        Duration::from_millis(self.transfer.liveness_ms)
    }

    pub fn rc_config(&self) -> Result<RcloneRcConfig> {
        Ok(RcloneRcConfig {
            addr: self.rc.addr.trim_end_matches('/').to_string(),
            auth: BasicAuth::parse(&self.rc.auth)?,
        })
    }
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    toml::from_str(text)
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let addr = settings.rc.addr.trim();
    if !(addr.starts_with("http://") || addr.starts_with("https://")) {
        return Err(Error::InvalidConfig {
            message: format!("rc.addr must be an http(s) url (got {addr:?})"),
        });
    }
    BasicAuth::parse(&settings.rc.auth)?;

    if settings.rc.poll_interval_ms == 0 {
        return Err(Error::InvalidConfig {
            message: "rc.poll_interval_ms must be > 0".to_string(),
        });
    }
    if settings.transfer.max_transfers == 0 {
        return Err(Error::InvalidConfig {
            message: "transfer.max_transfers must be >= 1".to_string(),
        });
    }
    if settings.transfer.max_rounds == 0 {
        return Err(Error::InvalidConfig {
            message: "transfer.max_rounds must be >= 1".to_string(),
        });
    }
    if settings.transfer.liveness_ms == 0 {
        return Err(Error::InvalidConfig {
            message: "transfer.liveness_ms must be > 0".to_string(),
        });
    }
    Ok(())
}
