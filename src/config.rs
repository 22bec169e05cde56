//! Application configuration
//!
//! Loaded from an optional TOML file, then overridden by `FILTUBE_*` environment
//! variables. Every field has a default so an empty file is a valid config.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::storage::{Network, PreflightConfig, TokenAmount};
use crate::upload::UploadLimits;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub network: Network,
    pub database_url: String,
    pub listen_addr: String,
    pub storage: StorageSettings,
    pub preflight: PreflightSettings,
    pub limits: LimitSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: Network::Calibration,
            database_url: "sqlite://filtube.db".to_string(),
            listen_addr: "0.0.0.0:3000".to_string(),
            storage: StorageSettings::default(),
            preflight: PreflightSettings::default(),
            limits: LimitSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSettings {
    /// Base URL of the storage gateway that fronts the storage SDK
    pub gateway_url: String,
    pub with_cdn: bool,
    pub proof_set_cache_ttl_secs: u64,
    pub proof_set_cache_capacity: usize,
    /// Wait applied when a provider does not report the add-roots transaction
    pub tx_grace_period_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:8080".to_string(),
            with_cdn: true,
            proof_set_cache_ttl_secs: 300,
            proof_set_cache_capacity: 64,
            tx_grace_period_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreflightSettings {
    pub lockup_days: u64,
    /// Decimal USDFC, e.g. "0.1"
    pub proof_set_creation_fee: String,
}

impl Default for PreflightSettings {
    fn default() -> Self {
        Self {
            lockup_days: 10,
            proof_set_creation_fee: "0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitSettings {
    pub max_video_bytes: u64,
    pub max_image_bytes: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        let limits = UploadLimits::default();
        Self {
            max_video_bytes: limits.max_video_bytes,
            max_image_bytes: limits.max_image_bytes,
        }
    }
}

impl AppConfig {
    /// Load from `path` (if given) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::ConfigError(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::ConfigError(e.to_string()))
    }

    /// Apply `FILTUBE_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(network) = lookup("FILTUBE_NETWORK") {
            self.network = network.parse()?;
        }
        if let Some(url) = lookup("FILTUBE_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(url) = lookup("FILTUBE_GATEWAY_URL") {
            self.storage.gateway_url = url;
        }
        if let Some(addr) = lookup("FILTUBE_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.gateway_url()?;
        self.socket_addr()?;
        self.preflight_config()?;
        if self.limits.max_video_bytes == 0 || self.limits.max_image_bytes == 0 {
            return Err(Error::ConfigError("size limits must be positive".to_string()));
        }
        Ok(())
    }

    pub fn gateway_url(&self) -> Result<Url> {
        Url::parse(&self.storage.gateway_url).map_err(|e| {
            Error::ConfigError(format!(
                "invalid gateway_url '{}': {e}",
                self.storage.gateway_url
            ))
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse().map_err(|e| {
            Error::ConfigError(format!("invalid listen_addr '{}': {e}", self.listen_addr))
        })
    }

    pub fn preflight_config(&self) -> Result<PreflightConfig> {
        let fee = TokenAmount::parse_units(&self.preflight.proof_set_creation_fee)
            .map_err(|e| Error::ConfigError(format!("proof_set_creation_fee: {e}")))?;
        Ok(PreflightConfig {
            with_cdn: self.storage.with_cdn,
            lockup_days: self.preflight.lockup_days,
            proof_set_creation_fee: fee,
        })
    }

    pub fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            max_video_bytes: self.limits.max_video_bytes,
            max_image_bytes: self.limits.max_image_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.limits.max_video_bytes, 1 << 30);
        assert_eq!(config.limits.max_image_bytes, 10 << 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
network = "mainnet"

[storage]
with_cdn = false
tx_grace_period_ms = 500

[preflight]
proof_set_creation_fee = "0.2"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.network, Network::Mainnet);
        assert!(!config.storage.with_cdn);
        assert_eq!(config.storage.tx_grace_period_ms, 500);
        assert_eq!(config.storage.proof_set_cache_ttl_secs, 300);

        let preflight = config.preflight_config().unwrap();
        assert!(!preflight.with_cdn);
        assert_eq!(
            preflight.proof_set_creation_fee,
            TokenAmount(200_000_000_000_000_000)
        );
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = AppConfig::from_toml("colour = \"blue\"").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FILTUBE_NETWORK", "mainnet"),
            ("FILTUBE_DATABASE_URL", "sqlite::memory:"),
            ("FILTUBE_GATEWAY_URL", "https://gateway.example"),
        ]);
        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.gateway_url().unwrap().host_str(), Some("gateway.example"));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let mut config = AppConfig::default();
        assert!(config
            .apply_overrides(|key| (key == "FILTUBE_NETWORK").then(|| "devnet".to_string()))
            .is_err());

        config.listen_addr = "not-an-addr".to_string();
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let mut config = AppConfig::default();
        config.preflight.proof_set_creation_fee = "abc".to_string();
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }
}
