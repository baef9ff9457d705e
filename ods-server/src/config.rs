use ods_core::{IdentityDefaults, NodeSettings, OdsError, Result, SecretKey, Stage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub peer_client: PeerClientConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Base url other nodes use to reach this one.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_stage")]
    pub stage: String,
    #[serde(default)]
    pub firewalled_mode: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            name: default_node_name(),
            url: None,
            stage: default_stage(),
            firewalled_mode: false,
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_node_name() -> String {
    "ODS".to_string()
}

fn default_stage() -> String {
    "Prod".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub share_dir: PathBuf,
    pub staging_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/ods.db"),
            share_dir: PathBuf::from("data/share"),
            staging_dir: PathBuf::from("data/staging"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Base64 of 32 bytes; encrypts every key stored in the database.
    pub database_key: String,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("database_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerClientConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_sync_attempts")]
    pub max_sync_attempts: u32,
}

impl Default for PeerClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_sync_attempts: default_max_sync_attempts(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_sync_attempts() -> u32 {
    NodeSettings::DEFAULT_SYNC_ATTEMPTS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_on_startup")]
    pub on_startup: bool,
    /// Run a pass every this many seconds; disabled when unset.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            on_startup: default_on_startup(),
            interval_secs: None,
        }
    }
}

fn default_on_startup() -> bool {
    true
}

impl Config {
    /// Load from `path` (optional), overlaid by `ODS_`-prefixed environment
    /// variables such as `ODS_SECURITY__DATABASE_KEY`.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("ODS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| OdsError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| OdsError::Config(e.to_string()))?;

        config.database_key()?;
        Ok(config)
    }

    pub fn database_key(&self) -> Result<SecretKey> {
        SecretKey::from_base64(&self.security.database_key)
            .map_err(|e| OdsError::Config(format!("security.database_key: {}", e)))
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            database_path: self.storage.database_path.clone(),
            share_dir: self.storage.share_dir.clone(),
            staging_dir: self.storage.staging_dir.clone(),
            connect_timeout: Duration::from_secs(self.peer_client.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.peer_client.request_timeout_secs),
            max_sync_attempts: self.peer_client.max_sync_attempts,
        }
    }

    pub fn identity_defaults(&self) -> IdentityDefaults {
        IdentityDefaults {
            name: self.node.name.clone(),
            url: self.node.url.clone().filter(|url| !url.trim().is_empty()),
            stage: Stage::parse_lenient(&self.node.stage),
            firewalled_mode: self.node.firewalled_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("ods.yaml");
        std::fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let key = SecretKey::generate().to_base64();
        let path = write_config(
            &dir,
            &format!(
                "node:\n  name: mirror-east\n  url: http://mirror-east:8080\n  stage: develop\nsecurity:\n  database_key: \"{}\"\n",
                key
            ),
        );

        let config = tokio_test::assert_ok!(Config::from_file(&path));
        assert_eq!(config.node.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.peer_client.connect_timeout_secs, 5);
        assert_eq!(config.peer_client.request_timeout_secs, 60);
        assert!(config.reconciliation.on_startup);
        assert!(config.reconciliation.interval_secs.is_none());

        let identity = config.identity_defaults();
        assert_eq!(identity.name, "mirror-east");
        assert_eq!(identity.stage, Stage::Dev);

        let settings = config.node_settings();
        assert_eq!(settings.max_sync_attempts, 5);
        assert_eq!(settings.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_short_database_key_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "security:\n  database_key: \"c2hvcnQ=\"\n");
        let error = tokio_test::assert_err!(Config::from_file(&path));
        assert!(matches!(error, OdsError::Config(_)));
    }

    #[test]
    fn test_debug_redacts_database_key() {
        let security = SecurityConfig {
            database_key: "super-secret".to_string(),
        };
        assert!(!format!("{:?}", security).contains("super-secret"));
    }
}
