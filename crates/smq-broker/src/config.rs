//! Broker configuration, loaded from a JSON file.
//!
//! Sections mirror the recognised option groups: `listen`, `auth`,
//! `protocol`, `store`, `delivery`, `frame` and `log`. Every field except
//! `listen.port` has a default.

use std::{fs, net::SocketAddr, path::{Path, PathBuf}};

use serde::Deserialize;
use smq_wire::Protocol;

use crate::BrokerError;

pub const DEFAULT_BUCKET_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub listen: ListenConfig,
    pub auth: Option<AuthConfig>,
    pub protocol: Protocol,
    pub store: Option<StoreConfig>,
    pub delivery: DeliveryConfig,
    pub frame: FrameConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
    pub tls: TlsConfig,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self { address: "0.0.0.0".to_string(), port: 0, tls: TlsConfig::default() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub verify: VerifyMode,
}

/// Peer-certificate verification mode for the listener.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    #[default]
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub root: PathBuf,
    #[serde(default = "default_bucket_size")]
    pub bucket_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DeliveryConfig {
    pub workers: u32,
    pub queue_watermark: u32,
    pub ack_timeout_ms: u32,
    pub max_ack_misses: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { workers: 16, queue_watermark: 4096, ack_timeout_ms: 30_000, max_ack_misses: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FrameConfig {
    pub max_bytes: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self { max_bytes: smq_wire::DEFAULT_MAX_FRAME as u32 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
    pub filter: Option<String>,
}

fn default_bucket_size() -> u64 {
    DEFAULT_BUCKET_SIZE
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let raw = fs::read(path)
            .map_err(|e| BrokerError::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg: Self = serde_json::from_slice(&raw)
            .map_err(|e| BrokerError::Config(format!("cannot parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.listen.port == 0 {
            return Err(BrokerError::Config("listen.port is required".into()));
        }
        self.validate_for_embedding()
    }

    /// Validation that applies even when the port is ephemeral (tests embed
    /// the broker on port 0).
    pub fn validate_for_embedding(&self) -> Result<(), BrokerError> {
        let tls = &self.listen.tls;
        if tls.enabled {
            if tls.cert.is_none() || tls.key.is_none() {
                return Err(BrokerError::Config(
                    "listen.tls.cert and listen.tls.key are required when tls is enabled".into(),
                ));
            }
            if tls.verify != VerifyMode::None && tls.ca.is_none() {
                return Err(BrokerError::Config(
                    "listen.tls.ca is required when peer verification is on".into(),
                ));
            }
        }
        if self.delivery.workers == 0 {
            return Err(BrokerError::Config("delivery.workers must be at least 1".into()));
        }
        if self.delivery.queue_watermark == 0 {
            return Err(BrokerError::Config("delivery.queue_watermark must be at least 1".into()));
        }
        if self.frame.max_bytes == 0 {
            return Err(BrokerError::Config("frame.max_bytes must be at least 1".into()));
        }
        if let Some(store) = &self.store {
            if store.bucket_size < 4096 || store.bucket_size > u64::from(u32::MAX) {
                return Err(BrokerError::Config(
                    "store.bucket_size must be between 4 KiB and 4 GiB".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, BrokerError> {
        format!("{}:{}", self.listen.address, self.listen.port)
            .parse()
            .map_err(|e| BrokerError::Config(format!("bad listen address: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{ "listen": { "port": 1883 } }"#).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.listen.address, "0.0.0.0");
        assert_eq!(cfg.protocol, Protocol::Smq);
        assert!(cfg.auth.is_none());
        assert!(cfg.store.is_none());
        assert_eq!(cfg.delivery.workers, 16);
        assert_eq!(cfg.delivery.queue_watermark, 4096);
        assert_eq!(cfg.delivery.ack_timeout_ms, 30_000);
        assert_eq!(cfg.delivery.max_ack_misses, 3);
        assert_eq!(cfg.frame.max_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn full_config_parses() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "listen": {
                    "address": "127.0.0.1",
                    "port": 8883,
                    "tls": { "enabled": false }
                },
                "auth": { "username": "u", "password": "p" },
                "protocol": "mqtt",
                "store": { "root": "/var/lib/smq", "bucket_size": 1048576 },
                "delivery": {
                    "workers": 4,
                    "queue_watermark": 128,
                    "ack_timeout_ms": 5000,
                    "max_ack_misses": 2
                },
                "frame": { "max_bytes": 65536 },
                "log": { "filter": "debug" }
            }"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.protocol, Protocol::Mqtt);
        assert_eq!(cfg.store.unwrap().bucket_size, 1_048_576);
    }

    #[test]
    fn missing_port_is_rejected() {
        let cfg: Config = serde_json::from_str(r#"{ "listen": { "address": "::1" } }"#).unwrap();
        assert!(matches!(cfg.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn tls_without_key_material_is_rejected() {
        let cfg: Config = serde_json::from_str(
            r#"{ "listen": { "port": 8883, "tls": { "enabled": true } } }"#,
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(
            serde_json::from_str::<Config>(r#"{ "listen": { "port": 1 }, "cluster": {} }"#)
                .is_err()
        );
    }
}
