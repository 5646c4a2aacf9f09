//! Layered configuration: defaults, then an optional config file, then
//! environment variables (SPEC_FULL §11).
//!
//! The option table and precedence order are new ambient-stack
//! additions the distilled spec only tabulates; the "defaults, then a
//! small file, then environment overrides" shape is modeled on
//! `examples/eisenzopf-rvoip/crates/infra-common`'s layered config
//! approach, simplified to a hand-rolled `key = value` reader since
//! this surface is six scalar fields -- not enough to justify pulling
//! in a dedicated config/TOML crate.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Upper bound on `max_datagram_bytes`, inherited in spirit from the
/// teacher crate's `limits::MAX_HEADER_LINE_LENGTH`-scale constants:
/// a sanity ceiling independent of what an operator configures.
pub const HARD_DATAGRAM_CEILING: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub bind_addr: String,
    pub liveness_timeout_sec: u64,
    pub reaper_tick_sec: u64,
    pub ring_delay_ms: u64,
    pub dialog_timeout_sec: u64,
    pub audit_bus_capacity: usize,
    pub max_datagram_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5060".to_string(),
            liveness_timeout_sec: 30,
            reaper_tick_sec: 5,
            ring_delay_ms: 2000,
            dialog_timeout_sec: 32,
            audit_bus_capacity: 1024,
            max_datagram_bytes: 2048,
        }
    }
}

impl EngineConfig {
    /// Parse `key = value` lines (`#` starts a comment; blank lines
    /// ignored) on top of the defaults.
    pub fn from_file_contents(contents: &str) -> Result<Self, EngineError> {
        let mut config = Self::default();
        let mut overrides = HashMap::new();
        for (line_no, raw_line) in contents.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                EngineError::InvalidConfig(format!("line {}: expected `key = value`", line_no + 1))
            })?;
            overrides.insert(key.trim().to_string(), value.trim().to_string());
        }
        config.apply_overrides(&overrides)?;
        Ok(config)
    }

    /// Apply `SIPVINE_<OPTION_UPPERCASE>` environment variables, the
    /// highest-precedence layer.
    pub fn apply_env(&mut self) -> Result<(), EngineError> {
        let mut overrides = HashMap::new();
        for key in [
            "bind_addr",
            "liveness_timeout_sec",
            "reaper_tick_sec",
            "ring_delay_ms",
            "dialog_timeout_sec",
            "audit_bus_capacity",
            "max_datagram_bytes",
        ] {
            let env_name = format!("SIPVINE_{}", key.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&env_name) {
                overrides.insert(key.to_string(), value);
            }
        }
        self.apply_overrides(&overrides)
    }

    fn apply_overrides(&mut self, overrides: &HashMap<String, String>) -> Result<(), EngineError> {
        let parse_u64 = |key: &str, v: &str| -> Result<u64, EngineError> {
            v.parse()
                .map_err(|_| EngineError::InvalidConfig(format!("{} must be an integer, got {:?}", key, v)))
        };
        let parse_usize = |key: &str, v: &str| -> Result<usize, EngineError> {
            v.parse()
                .map_err(|_| EngineError::InvalidConfig(format!("{} must be an integer, got {:?}", key, v)))
        };

        if let Some(v) = overrides.get("bind_addr") {
            self.bind_addr = v.clone();
        }
        if let Some(v) = overrides.get("liveness_timeout_sec") {
            self.liveness_timeout_sec = parse_u64("liveness_timeout_sec", v)?;
        }
        if let Some(v) = overrides.get("reaper_tick_sec") {
            self.reaper_tick_sec = parse_u64("reaper_tick_sec", v)?;
        }
        if let Some(v) = overrides.get("ring_delay_ms") {
            self.ring_delay_ms = parse_u64("ring_delay_ms", v)?;
        }
        if let Some(v) = overrides.get("dialog_timeout_sec") {
            self.dialog_timeout_sec = parse_u64("dialog_timeout_sec", v)?;
        }
        if let Some(v) = overrides.get("audit_bus_capacity") {
            self.audit_bus_capacity = parse_usize("audit_bus_capacity", v)?;
        }
        if let Some(v) = overrides.get("max_datagram_bytes") {
            self.max_datagram_bytes = parse_usize("max_datagram_bytes", v)?;
        }
        Ok(())
    }

    /// Validate at startup; a failure here is fatal (SPEC_FULL §7).
    pub fn validate(&self) -> Result<(), EngineError> {
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| EngineError::InvalidConfig(format!("bind_addr {:?}: {}", self.bind_addr, e)))?;
        if self.liveness_timeout_sec == 0 {
            return Err(EngineError::InvalidConfig("liveness_timeout_sec must be nonzero".into()));
        }
        if self.reaper_tick_sec == 0 {
            return Err(EngineError::InvalidConfig("reaper_tick_sec must be nonzero".into()));
        }
        if self.dialog_timeout_sec == 0 {
            return Err(EngineError::InvalidConfig("dialog_timeout_sec must be nonzero".into()));
        }
        if self.audit_bus_capacity == 0 {
            return Err(EngineError::InvalidConfig("audit_bus_capacity must be nonzero".into()));
        }
        if self.max_datagram_bytes == 0 || self.max_datagram_bytes > HARD_DATAGRAM_CEILING {
            return Err(EngineError::InvalidConfig(format!(
                "max_datagram_bytes must be in 1..={}",
                HARD_DATAGRAM_CEILING
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_option_table() {
        let config = EngineConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:5060");
        assert_eq!(config.liveness_timeout_sec, 30);
        assert_eq!(config.reaper_tick_sec, 5);
        assert_eq!(config.ring_delay_ms, 2000);
        assert_eq!(config.dialog_timeout_sec, 32);
        assert_eq!(config.audit_bus_capacity, 1024);
        assert_eq!(config.max_datagram_bytes, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_overrides_layer_on_top_of_defaults() {
        let config = EngineConfig::from_file_contents(
            "# comment\nring_delay_ms = 0\nbind_addr = 127.0.0.1:6060\n",
        )
        .unwrap();
        assert_eq!(config.ring_delay_ms, 0);
        assert_eq!(config.bind_addr, "127.0.0.1:6060");
        assert_eq!(config.liveness_timeout_sec, 30); // untouched default
    }

    #[test]
    fn validate_rejects_bad_bind_addr() {
        let mut config = EngineConfig::default();
        config.bind_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_oversized_datagram_limit() {
        let mut config = EngineConfig::default();
        config.max_datagram_bytes = HARD_DATAGRAM_CEILING + 1;
        assert!(config.validate().is_err());
    }
}
