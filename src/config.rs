//! Connection configuration: construction, validation, and environment loading
//! (spec.md §3 ConnectionConfig, §6 Configuration inputs).

use crate::error::{PsxFixError, Result};
use std::time::Duration;

/// The PSX profile's fixed application-version pair (§6).
pub const DEFAULT_APPL_VER_ID: &str = "9";
pub const DEFAULT_CSTM_APPL_VER_ID: &str = "FIX5.00_PSX_1.00";

/// Validated connection configuration for a single FIX session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub username: String,
    pub password: String,
    pub heartbeat_interval_secs: u32,
    pub connect_timeout_ms: u64,
    pub reset_on_logon: bool,
    pub on_behalf_of_comp_id: Option<String>,
    pub raw_data: Option<String>,
    pub raw_data_length: Option<u32>,
    pub default_appl_ver_id: String,
    pub default_cstm_appl_ver_id: String,
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Loads configuration from environment variables named in spec.md §6,
    /// optionally preceded by a `.env` file if one is present in the working
    /// directory. Missing required fields or malformed numeric fields are
    /// `InvalidConfig` errors (fatal at startup per §7).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let host = required_var("FIX_HOST")?;
        let port = parse_var("FIX_PORT", 8016u16)?;
        let sender_comp_id = required_var("FIX_SENDER")?;
        let target_comp_id = required_var("FIX_TARGET")?;
        let username = env_var_or_default("FIX_USERNAME", "");
        let password = env_var_or_default("FIX_PASSWORD", "");
        let heartbeat_interval_secs = parse_var("FIX_HEARTBEAT_INTERVAL", 30u32)?;
        let connect_timeout_ms = parse_var("CONNECT_TIMEOUT", 30_000u64)?;
        let on_behalf_of_comp_id = std::env::var("ON_BEHALF_OF_COMP_ID").ok();
        let raw_data = std::env::var("RAW_DATA").ok();
        let raw_data_length = match std::env::var("RAW_DATA_LENGTH") {
            Ok(v) => Some(v.parse::<u32>().map_err(|_| {
                PsxFixError::InvalidConfig("RAW_DATA_LENGTH must be a non-negative integer".into())
            })?),
            Err(_) => None,
        };

        Self::builder()
            .host(host)
            .port(port)
            .sender_comp_id(sender_comp_id)
            .target_comp_id(target_comp_id)
            .username(username)
            .password(password)
            .heartbeat_interval_secs(heartbeat_interval_secs)
            .connect_timeout_ms(connect_timeout_ms)
            .reset_on_logon(true)
            .on_behalf_of_comp_id(on_behalf_of_comp_id)
            .raw_data(raw_data)
            .raw_data_length(raw_data_length)
            .build()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs as u64)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| PsxFixError::InvalidConfig(format!("{name} is required")))
}

fn env_var_or_default(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| PsxFixError::InvalidConfig(format!("{name} is not a valid value"))),
        Err(_) => Ok(default),
    }
}

/// Builder for [`ConnectionConfig`], mirroring the teacher's session builder
/// pattern. `build()` validates required fields and numeric ranges.
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    heartbeat_interval_secs: Option<u32>,
    connect_timeout_ms: Option<u64>,
    reset_on_logon: Option<bool>,
    on_behalf_of_comp_id: Option<String>,
    raw_data: Option<String>,
    raw_data_length: Option<u32>,
    default_appl_ver_id: Option<String>,
    default_cstm_appl_ver_id: Option<String>,
}

impl ConnectionConfigBuilder {
    pub fn host(mut self, v: impl Into<String>) -> Self {
        self.host = Some(v.into());
        self
    }
    pub fn port(mut self, v: u16) -> Self {
        self.port = Some(v);
        self
    }
    pub fn sender_comp_id(mut self, v: impl Into<String>) -> Self {
        self.sender_comp_id = Some(v.into());
        self
    }
    pub fn target_comp_id(mut self, v: impl Into<String>) -> Self {
        self.target_comp_id = Some(v.into());
        self
    }
    pub fn username(mut self, v: impl Into<String>) -> Self {
        self.username = Some(v.into());
        self
    }
    pub fn password(mut self, v: impl Into<String>) -> Self {
        self.password = Some(v.into());
        self
    }
    pub fn heartbeat_interval_secs(mut self, v: u32) -> Self {
        self.heartbeat_interval_secs = Some(v);
        self
    }
    pub fn connect_timeout_ms(mut self, v: u64) -> Self {
        self.connect_timeout_ms = Some(v);
        self
    }
    pub fn reset_on_logon(mut self, v: bool) -> Self {
        self.reset_on_logon = Some(v);
        self
    }
    pub fn on_behalf_of_comp_id(mut self, v: Option<String>) -> Self {
        self.on_behalf_of_comp_id = v;
        self
    }
    pub fn raw_data(mut self, v: Option<String>) -> Self {
        self.raw_data = v;
        self
    }
    pub fn raw_data_length(mut self, v: Option<u32>) -> Self {
        self.raw_data_length = v;
        self
    }

    pub fn build(self) -> Result<ConnectionConfig> {
        let host = self
            .host
            .ok_or_else(|| PsxFixError::InvalidConfig("host is required".into()))?;
        if host.trim().is_empty() {
            return Err(PsxFixError::InvalidConfig("host must not be empty".into()));
        }
        let port = self
            .port
            .ok_or_else(|| PsxFixError::InvalidConfig("port is required".into()))?;
        if port == 0 {
            return Err(PsxFixError::InvalidConfig("port must be nonzero".into()));
        }
        let sender_comp_id = self
            .sender_comp_id
            .ok_or_else(|| PsxFixError::InvalidConfig("sender_comp_id is required".into()))?;
        let target_comp_id = self
            .target_comp_id
            .ok_or_else(|| PsxFixError::InvalidConfig("target_comp_id is required".into()))?;
        let heartbeat_interval_secs = self.heartbeat_interval_secs.unwrap_or(30);
        if heartbeat_interval_secs == 0 {
            return Err(PsxFixError::InvalidConfig(
                "heartbeat_interval_secs must be nonzero".into(),
            ));
        }
        let connect_timeout_ms = self.connect_timeout_ms.unwrap_or(30_000);
        if connect_timeout_ms == 0 {
            return Err(PsxFixError::InvalidConfig(
                "connect_timeout_ms must be nonzero".into(),
            ));
        }

        Ok(ConnectionConfig {
            host,
            port,
            sender_comp_id,
            target_comp_id,
            username: self.username.unwrap_or_default(),
            password: self.password.unwrap_or_default(),
            heartbeat_interval_secs,
            connect_timeout_ms,
            reset_on_logon: self.reset_on_logon.unwrap_or(true),
            on_behalf_of_comp_id: self.on_behalf_of_comp_id,
            raw_data: self.raw_data,
            raw_data_length: self.raw_data_length,
            default_appl_ver_id: self
                .default_appl_ver_id
                .unwrap_or_else(|| DEFAULT_APPL_VER_ID.to_string()),
            default_cstm_appl_ver_id: self
                .default_cstm_appl_ver_id
                .unwrap_or_else(|| DEFAULT_CSTM_APPL_VER_ID.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_missing_host() {
        let err = ConnectionConfig::builder()
            .port(1234)
            .sender_comp_id("realtime")
            .target_comp_id("NMDUFISQ0001")
            .build()
            .unwrap_err();
        assert!(matches!(err, PsxFixError::InvalidConfig(_)));
    }

    #[test]
    fn builder_rejects_zero_port() {
        let err = ConnectionConfig::builder()
            .host("127.0.0.1")
            .port(0)
            .sender_comp_id("realtime")
            .target_comp_id("NMDUFISQ0001")
            .build()
            .unwrap_err();
        assert!(matches!(err, PsxFixError::InvalidConfig(_)));
    }

    #[test]
    fn builder_applies_defaults() {
        let cfg = ConnectionConfig::builder()
            .host("127.0.0.1")
            .port(8016)
            .sender_comp_id("realtime")
            .target_comp_id("NMDUFISQ0001")
            .build()
            .unwrap();
        assert_eq!(cfg.heartbeat_interval_secs, 30);
        assert!(cfg.reset_on_logon);
        assert_eq!(cfg.default_appl_ver_id, DEFAULT_APPL_VER_ID);
        assert_eq!(cfg.default_cstm_appl_ver_id, DEFAULT_CSTM_APPL_VER_ID);
    }
}
