//! Configuration for the test sequencer.
//!
//! Values come from a TOML file, environment variable overrides, and CLI
//! flags, applied in that order by the binary.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Sequencer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Port the control service listens on. The sequencer binds the IPv6
    /// wildcard address, so v4-mapped connections are accepted as well.
    /// Port 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Connect timeout for channels to node managers, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-request timeout for node-manager RPCs, in milliseconds.
    /// Zero disables the timeout; traffic phases run until the workload
    /// finishes or is cancelled.
    pub request_timeout_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            port: 10_000,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 0,
        }
    }
}

impl SequencerConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ControlError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        let config: Self = toml::from_str(&contents).map_err(|e| {
            ControlError::config_with_source(format!("cannot parse {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MESHBENCH_SEQUENCER_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("MESHBENCH_SEQUENCER_PORT") {
            self.port = port
                .parse()
                .map_err(|e| ControlError::config_with_source("invalid MESHBENCH_SEQUENCER_PORT", e))?;
        }
        if let Ok(ms) = std::env::var("MESHBENCH_SEQUENCER_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = ms.parse().map_err(|e| {
                ControlError::config_with_source("invalid MESHBENCH_SEQUENCER_CONNECT_TIMEOUT_MS", e)
            })?;
        }
        if let Ok(ms) = std::env::var("MESHBENCH_SEQUENCER_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = ms.parse().map_err(|e| {
                ControlError::config_with_source("invalid MESHBENCH_SEQUENCER_REQUEST_TIMEOUT_MS", e)
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(ControlError::config("connect_timeout_ms must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SequencerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 10_000);
    }

    #[test]
    fn parses_partial_toml() {
        let config: SequencerConfig = toml::from_str("port = 4242").unwrap();
        assert_eq!(config.port, 4242);
        assert_eq!(
            config.connect_timeout_ms,
            SequencerConfig::default().connect_timeout_ms
        );
    }

    #[test]
    fn rejects_zero_connect_timeout() {
        let config: SequencerConfig = toml::from_str("connect_timeout_ms = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
