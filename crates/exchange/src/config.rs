use std::time::Duration;

use chatkey_shared::constants::{
    DEFAULT_ACK_TIMEOUT_MS, DEFAULT_KEY_LIFETIME_SECS, DEFAULT_LIVENESS_WINDOW_SECS,
    DEFAULT_PENDING_MAX_AGE_SECS, DEFAULT_ROTATION_INTERVAL_SECS, MAX_HISTORY_CAP,
    MIN_HISTORY_CAP,
};
use serde::Deserialize;

use crate::error::ExchangeError;

/// Key exchange tuning, loaded from TOML with `CHATKEY_*` env var overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Age after which an active key is rotated. Default: 24h
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,
    /// A peer seen within this window counts as live. Default: 5 min
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: u64,
    /// Pending records older than this may be superseded. Default: 15 min
    #[serde(default = "default_pending_max_age_secs")]
    pub pending_max_age_secs: u64,
    /// Hard lifetime of a key counted from activation. Default: 7 days
    #[serde(default = "default_key_lifetime_secs")]
    pub key_lifetime_secs: u64,
    /// Superseded keys kept per chat, 2 or 3. Default: 3
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Wait for an ack before falling back to the store. Default: 8s
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// First fallback poll delay. Default: 1s
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,
    /// Backoff ceiling for the fallback poller. Default: 30s
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
    /// How often each open chat checks whether rotation is due. Default: 60s
    #[serde(default = "default_rotation_check_ms")]
    pub rotation_check_ms: u64,
}

fn default_rotation_interval_secs() -> u64 {
    DEFAULT_ROTATION_INTERVAL_SECS
}
fn default_liveness_window_secs() -> u64 {
    DEFAULT_LIVENESS_WINDOW_SECS
}
fn default_pending_max_age_secs() -> u64 {
    DEFAULT_PENDING_MAX_AGE_SECS
}
fn default_key_lifetime_secs() -> u64 {
    DEFAULT_KEY_LIFETIME_SECS
}
fn default_history_cap() -> usize {
    MAX_HISTORY_CAP
}
fn default_ack_timeout_ms() -> u64 {
    DEFAULT_ACK_TIMEOUT_MS
}
fn default_poll_initial_ms() -> u64 {
    1_000
}
fn default_poll_max_ms() -> u64 {
    30_000
}
fn default_rotation_check_ms() -> u64 {
    60_000
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: default_rotation_interval_secs(),
            liveness_window_secs: default_liveness_window_secs(),
            pending_max_age_secs: default_pending_max_age_secs(),
            key_lifetime_secs: default_key_lifetime_secs(),
            history_cap: default_history_cap(),
            ack_timeout_ms: default_ack_timeout_ms(),
            poll_initial_ms: default_poll_initial_ms(),
            poll_max_ms: default_poll_max_ms(),
            rotation_check_ms: default_rotation_check_ms(),
        }
    }
}

impl ExchangeConfig {
    /// Load from the TOML file at `path`, then apply env overrides and validate.
    pub fn load(path: &std::path::Path) -> Result<Self, ExchangeError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ExchangeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, ExchangeError> {
        let mut config: ExchangeConfig =
            toml::from_str(toml_str).map_err(|e| ExchangeError::Config(e.to_string()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CHATKEY_*` env vars. A set but unparsable value
    /// is an error rather than silently ignored.
    pub fn apply_env_overrides(&mut self) -> Result<(), ExchangeError> {
        override_u64("CHATKEY_ROTATION_INTERVAL_SECS", &mut self.rotation_interval_secs)?;
        override_u64("CHATKEY_LIVENESS_WINDOW_SECS", &mut self.liveness_window_secs)?;
        override_u64("CHATKEY_PENDING_MAX_AGE_SECS", &mut self.pending_max_age_secs)?;
        override_u64("CHATKEY_KEY_LIFETIME_SECS", &mut self.key_lifetime_secs)?;
        override_u64("CHATKEY_ACK_TIMEOUT_MS", &mut self.ack_timeout_ms)?;
        override_u64("CHATKEY_POLL_INITIAL_MS", &mut self.poll_initial_ms)?;
        override_u64("CHATKEY_POLL_MAX_MS", &mut self.poll_max_ms)?;
        override_u64("CHATKEY_ROTATION_CHECK_MS", &mut self.rotation_check_ms)?;
        if let Ok(val) = std::env::var("CHATKEY_HISTORY_CAP") {
            self.history_cap = val.parse().map_err(|_| {
                ExchangeError::Config(format!("invalid CHATKEY_HISTORY_CAP value: {val}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ExchangeError> {
        if !(MIN_HISTORY_CAP..=MAX_HISTORY_CAP).contains(&self.history_cap) {
            return Err(ExchangeError::Config(format!(
                "history_cap must be between {MIN_HISTORY_CAP} and {MAX_HISTORY_CAP}, got {}",
                self.history_cap
            )));
        }
        if self.poll_initial_ms == 0 || self.poll_initial_ms > self.poll_max_ms {
            return Err(ExchangeError::Config(
                "poll_initial_ms must be non-zero and not exceed poll_max_ms".into(),
            ));
        }
        if self.rotation_check_ms == 0 {
            return Err(ExchangeError::Config("rotation_check_ms must be non-zero".into()));
        }
        if self.key_lifetime_secs <= self.rotation_interval_secs {
            return Err(ExchangeError::Config(
                "key_lifetime_secs must exceed rotation_interval_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn pending_max_age(&self) -> Duration {
        Duration::from_secs(self.pending_max_age_secs)
    }

    pub fn key_lifetime(&self) -> Duration {
        Duration::from_secs(self.key_lifetime_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms)
    }

    pub fn rotation_check(&self) -> Duration {
        Duration::from_millis(self.rotation_check_ms)
    }
}

fn override_u64(var: &str, field: &mut u64) -> Result<(), ExchangeError> {
    if let Ok(val) = std::env::var(var) {
        *field = val
            .parse()
            .map_err(|_| ExchangeError::Config(format!("invalid {var} value: {val}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn loads_from_valid_toml_string() {
        let toml = r#"
            rotation_interval_secs = 172800
            liveness_window_secs = 120
            history_cap = 2
            ack_timeout_ms = 5000
        "#;
        let config = ExchangeConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.rotation_interval(), Duration::from_secs(172_800));
        assert_eq!(config.liveness_window(), Duration::from_secs(120));
        assert_eq!(config.history_cap, 2);
        assert_eq!(config.ack_timeout(), Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn omitted_fields_take_defaults() {
        let config = ExchangeConfig::from_toml_str("").unwrap();
        assert_eq!(config.rotation_interval_secs, DEFAULT_ROTATION_INTERVAL_SECS);
        assert_eq!(config.history_cap, 3);
        assert_eq!(config.poll_initial(), Duration::from_secs(1));
        assert_eq!(config.poll_max(), Duration::from_secs(30));
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn env_var_overrides_toml() {
        std::env::set_var("CHATKEY_LIVENESS_WINDOW_SECS", "42");
        let config = ExchangeConfig::from_toml_str("liveness_window_secs = 7").unwrap();
        std::env::remove_var("CHATKEY_LIVENESS_WINDOW_SECS");
        assert_eq!(config.liveness_window_secs, 42);
    }

    #[test]
    #[serial]
    fn unparsable_env_var_is_an_error() {
        std::env::set_var("CHATKEY_ACK_TIMEOUT_MS", "soon");
        let result = ExchangeConfig::from_toml_str("");
        std::env::remove_var("CHATKEY_ACK_TIMEOUT_MS");
        assert!(matches!(result, Err(ExchangeError::Config(_))));
    }

    #[test]
    #[serial]
    fn history_cap_out_of_range_is_rejected() {
        for cap in [0, 1, 4] {
            let toml = format!("history_cap = {cap}");
            assert!(ExchangeConfig::from_toml_str(&toml).is_err(), "cap {cap}");
        }
    }

    #[test]
    #[serial]
    fn inverted_poll_bounds_are_rejected() {
        let toml = "poll_initial_ms = 5000\npoll_max_ms = 100";
        assert!(ExchangeConfig::from_toml_str(toml).is_err());
    }

    #[test]
    #[serial]
    fn malformed_toml_fails() {
        assert!(ExchangeConfig::from_toml_str("this is not valid = [[[toml").is_err());
    }
}
