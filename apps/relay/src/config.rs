use chatkey_shared::constants::MAX_RELAY_FRAME_BYTES;
use serde::Deserialize;

/// Relay configuration loaded from config.toml with env var overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Host to bind to. Default: "127.0.0.1"
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on. Default: 3100
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Default: ["http://localhost:1420"]
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// Tracing log level. Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Largest accepted text frame in bytes. Default: 4 KiB
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Seconds between server pings. Default: 30
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3100
}
fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:1420".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_frame_bytes() -> usize {
    MAX_RELAY_FRAME_BYTES
}
fn default_ping_interval_secs() -> u64 {
    30
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
            log_level: default_log_level(),
            max_frame_bytes: default_max_frame_bytes(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from TOML file with environment variable overrides.
    ///
    /// Reads `config.toml` from CWD (or path in `CONFIG_PATH` env var). A
    /// missing file falls back to defaults plus env overrides.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path, "no config file, using defaults");
                let mut config = Self::default();
                config.apply_env_overrides()?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load configuration from a TOML string, then apply env var overrides.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config: RelayConfig = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Returns an error if an env var is set but has an invalid format
    /// (e.g., RELAY_PORT=abc).
    pub fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Ok(val) = std::env::var("RELAY_HOST") {
            self.host = val;
        }
        if let Ok(val) = std::env::var("RELAY_PORT") {
            self.port = val
                .parse()
                .map_err(|_| format!("invalid RELAY_PORT value: {val}"))?;
        }
        if let Ok(val) = std::env::var("RELAY_MAX_FRAME_BYTES") {
            self.max_frame_bytes = val
                .parse()
                .map_err(|_| format!("invalid RELAY_MAX_FRAME_BYTES value: {val}"))?;
        }
        if let Ok(val) = std::env::var("LOG_LEVEL") {
            self.log_level = val;
        }
        Ok(())
    }
}
