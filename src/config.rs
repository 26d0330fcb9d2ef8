//! Service configuration.
//!
//! Defaults suit a local development network. A TOML file named by `PHARMA_SYNC_CONFIG`
//! overrides them, and a few `PHARMA_SYNC_*` variables override the file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_PATH_ENV: &str = "PHARMA_SYNC_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Failed to read config file {path:?}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Failed to parse config file {path:?}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
	/// HTTP endpoint for submit/evaluate.
	pub url: String,
	/// WebSocket endpoint for the event feed.
	pub ws_url: String,
	pub chaincode: String,
	pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self {
			url: "http://localhost:7080".to_string(),
			ws_url: "ws://localhost:7080/events".to_string(),
			chaincode: "pharmalink".to_string(),
			request_timeout_secs: 30,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
	pub api_url: String,
	pub timeout_secs: u64,
	/// How long a hash that failed to resolve is not fetched again.
	pub failure_cooldown_mins: u64,
	/// Documents kept in memory after a successful fetch.
	pub cache_entries: usize,
}

impl Default for ObjectStoreConfig {
	fn default() -> Self {
		Self {
			api_url: "http://localhost:5001".to_string(),
			timeout_secs: 10,
			failure_cooldown_mins: 5,
			cache_entries: 1024,
		}
	}
}

/// Reconnect and worker settings for the sync core
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	pub backoff_initial_ms: u64,
	pub backoff_max_ms: u64,
	/// How long shutdown waits for the worker before aborting it.
	pub shutdown_grace_secs: u64,
	/// Attempts on one failing event before it is skipped. `0` retries forever.
	pub max_event_attempts: u32,
	/// Parallel off-chain fetches during bootstrap and owner resync.
	pub enrichment_concurrency: usize,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			backoff_initial_ms: 1_000,
			backoff_max_ms: 20_000,
			shutdown_grace_secs: 5,
			max_event_attempts: 5,
			enrichment_concurrency: 8,
		}
	}
}

impl SyncConfig {
	pub fn shutdown_grace(&self) -> Duration {
		Duration::from_secs(self.shutdown_grace_secs)
	}
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Config {
	pub gateway: GatewayConfig,
	pub object_store: ObjectStoreConfig,
	pub sync: SyncConfig,
	pub data_dir: PathBuf,
}

impl Config {
	/// Load the config file named by `PHARMA_SYNC_CONFIG` (if set), then apply env overrides.
	pub fn load() -> Result<Self, ConfigError> {
		let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
			Some(path) => Self::from_file(Path::new(&path))?,
			None => Self::default(),
		};
		config.apply_overrides(|key| std::env::var(key).ok());
		if config.data_dir.as_os_str().is_empty() {
			config.data_dir = PathBuf::from("data");
		}
		Ok(config)
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})?;
		info!("Loaded configuration from {:?}", path);
		Ok(config)
	}

	pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
		toml::from_str(content)
	}

	fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
		if let Some(url) = lookup("PHARMA_SYNC_GATEWAY_URL") {
			self.gateway.url = url;
		}
		if let Some(url) = lookup("PHARMA_SYNC_GATEWAY_WS_URL") {
			self.gateway.ws_url = url;
		}
		if let Some(url) = lookup("PHARMA_SYNC_IPFS_URL") {
			self.object_store.api_url = url;
		}
		if let Some(dir) = lookup("PHARMA_SYNC_DATA_DIR") {
			self.data_dir = PathBuf::from(dir);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_reconnect_policy() {
		let config = Config::default();
		assert_eq!(config.sync.backoff_initial_ms, 1_000);
		assert_eq!(config.sync.backoff_max_ms, 20_000);
		assert_eq!(config.sync.shutdown_grace(), Duration::from_secs(5));
		assert_eq!(config.object_store.failure_cooldown_mins, 5);
	}

	#[test]
	fn partial_toml_keeps_defaults() {
		let config = Config::from_toml(
			r#"
			data_dir = "/var/lib/pharma-sync"

			[gateway]
			chaincode = "pharma-v2"

			[sync]
			max_event_attempts = 0
			"#,
		)
		.unwrap();
		assert_eq!(config.gateway.chaincode, "pharma-v2");
		assert_eq!(config.gateway.url, GatewayConfig::default().url);
		assert_eq!(config.sync.max_event_attempts, 0);
		assert_eq!(config.sync.backoff_max_ms, 20_000);
		assert_eq!(config.data_dir, PathBuf::from("/var/lib/pharma-sync"));
	}

	#[test]
	fn env_overrides_win() {
		let mut config = Config::default();
		config.apply_overrides(|key| match key {
			"PHARMA_SYNC_IPFS_URL" => Some("http://ipfs:5001".to_string()),
			"PHARMA_SYNC_DATA_DIR" => Some("/tmp/cache".to_string()),
			_ => None,
		});
		assert_eq!(config.object_store.api_url, "http://ipfs:5001");
		assert_eq!(config.data_dir, PathBuf::from("/tmp/cache"));
		assert_eq!(config.gateway, GatewayConfig::default());
	}
}
