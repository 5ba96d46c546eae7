//! TOML configuration loading.
//!
//! ```toml
//! [bus]
//! bus_id = "tab-1"
//! hub = true
//! request_timeout_ms = 10000
//! allowed_origins = ["https://app.example.com", "https://*.example.com"]
//! allow_all_origins = false
//! ```
//!
//! Missing keys take their defaults; a missing `[bus]` table yields the
//! default configuration.

use crate::config::{BusConfig, ConfigError};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    bus: BusConfig,
}

impl BusConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// `Io` when the file cannot be read, otherwise as [`Self::from_toml_str`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        debug!(path = %path.as_ref().display(), "Loaded bus config file");
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// `Parse` for malformed TOML or mistyped values, `Invalid` when
    /// validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        file.bus.validate()?;
        Ok(file.bus)
    }
}
