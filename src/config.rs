use anyhow::anyhow;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::ArgAction::Append;
use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::identity::MAX_SESSION_TTL;
use crate::storage::{StorageBackend, StorageConfig};

/// Service configuration, loadable from CLI and an optional TOML file.
///
/// Example configuration file content
/// # Video Access Configuration
///
/// listen_on_port = 32145
/// internal_port = 32146
/// workspace = "./data"
///
/// # Storage configuration
/// storage_backend = "s3"  # Options: "local" or "s3"
/// s3_bucket = "my-video-bucket"
/// s3_endpoint = "http://localhost:9000"
/// s3_region = "us-east-1"
/// s3_access_key_id = "minioadmin"
/// s3_secret_access_key = "minioadmin"
///
/// # Access policy
/// delivery_ttl_ceiling_secs = 120
/// session_ttl_secs = 3600
/// entitlements_file = "./data/entitlements.json"
///
/// [signing_keys]
/// 1 = "uBhfVeH0b7KQKfwOJqhwzLXKBpg7xLPBe5HjCksDDWg="
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port to external API listen on
    #[arg(short, long, default_value_t = 32145)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Internal API port to listen on
    #[arg(long, default_value_t = 32146)]
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Working directory for local objects and state
    #[arg(short = 'w', long, default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Storage backend: local or s3
    #[arg(short, long, default_value = "local")]
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    /// S3 bucket name (required when storage-backend is s3)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,

    /// S3 endpoint (for MinIO/custom S3)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_endpoint: Option<String>,

    /// S3 region
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_region: Option<String>,

    /// S3 access key ID
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_access_key_id: Option<String>,

    /// S3 secret access key
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_secret_access_key: Option<String>,

    /// Base URL that local bearer URLs are minted under.
    /// Defaults to http://127.0.0.1:<listen-on-port>
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,

    /// Upper bound on a signed handle's lifetime, in seconds
    #[arg(long, default_value_t = 120)]
    #[serde(default = "default_delivery_ttl_ceiling_secs")]
    pub delivery_ttl_ceiling_secs: u64,

    /// Default lifetime of minted session tokens, in seconds
    #[arg(long, default_value_t = 3600)]
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// JSON snapshot of entitlement rows
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements_file: Option<String>,

    /// Token signing keys (kid -> base64 encoded 32-byte key).
    /// Can be specified multiple times as --signing-key 1:base64key.
    /// You can generate a key with: openssl rand -base64 32
    #[arg(long = "signing-key", value_parser = parse_signing_key, action = Append)]
    #[serde(
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "de_signing_keys"
    )]
    pub signing_keys: Vec<(u8, [u8; 32])>,
}

/// Parse a signing key from command line format "kid:base64_key"
fn parse_signing_key(s: &str) -> Result<(u8, [u8; 32]), String> {
    let Some((kid, key)) = s.split_once(':') else {
        return Err("Invalid format. Use kid:base64_key".to_string());
    };

    let kid = kid
        .parse::<u8>()
        .map_err(|_| format!("Invalid kid '{kid}'. Must be a number between 0-255"))?;

    let key_bytes = STANDARD
        .decode(key)
        .map_err(|error| format!("Failed to decode base64 key for {kid}: {error}"))?;

    let key: [u8; 32] = key_bytes.try_into().map_err(|bytes: Vec<u8>| {
        format!(
            "Invalid key length for kid {kid}: expected 32 bytes, got {}",
            bytes.len()
        )
    })?;

    Ok((kid, key))
}

fn de_signing_keys<'de, D>(de: D) -> Result<Vec<(u8, [u8; 32])>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut out: Vec<(u8, [u8; 32])> = Vec::new();

    let repr = Option::<HashMap<String, String>>::deserialize(de)?;
    let Some(repr) = repr else {
        return Ok(out);
    };

    for (kstr, v) in repr {
        let kid: u8 = kstr.parse().map_err(serde::de::Error::custom)?;
        let bytes = STANDARD.decode(v).map_err(serde::de::Error::custom)?;
        let key: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            serde::de::Error::custom(format!(
                "signing_keys[{kid}] length {}, expect 32",
                bytes.len()
            ))
        })?;
        out.push((kid, key));
    }

    out.sort_unstable_by_key(|(k, _)| *k);
    Ok(out)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            internal_port: default_internal_port(),
            workspace: default_workspace(),
            config: None,
            storage_backend: default_storage_backend(),
            s3_bucket: None,
            s3_endpoint: None,
            s3_region: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
            public_base_url: None,
            delivery_ttl_ceiling_secs: default_delivery_ttl_ceiling_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            entitlements_file: None,
            signing_keys: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.internal_port == default_internal_port() {
            self.internal_port = file_config.internal_port;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.storage_backend == default_storage_backend() {
            self.storage_backend = file_config.storage_backend;
        }
        if self.delivery_ttl_ceiling_secs == default_delivery_ttl_ceiling_secs() {
            self.delivery_ttl_ceiling_secs = file_config.delivery_ttl_ceiling_secs;
        }
        if self.session_ttl_secs == default_session_ttl_secs() {
            self.session_ttl_secs = file_config.session_ttl_secs;
        }

        // For Option fields, CLI takes precedence if Some
        if self.s3_bucket.is_none() {
            self.s3_bucket = file_config.s3_bucket;
        }
        if self.s3_endpoint.is_none() {
            self.s3_endpoint = file_config.s3_endpoint;
        }
        if self.s3_region.is_none() {
            self.s3_region = file_config.s3_region;
        }
        if self.s3_access_key_id.is_none() {
            self.s3_access_key_id = file_config.s3_access_key_id;
        }
        if self.s3_secret_access_key.is_none() {
            self.s3_secret_access_key = file_config.s3_secret_access_key;
        }
        if self.public_base_url.is_none() {
            self.public_base_url = file_config.public_base_url;
        }
        if self.entitlements_file.is_none() {
            self.entitlements_file = file_config.entitlements_file;
        }
        if self.signing_keys.is_empty() {
            self.signing_keys = file_config.signing_keys;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.storage_backend.as_str() {
            "local" => {}
            "s3" => {
                if is_blank(&self.s3_bucket) {
                    return Err(anyhow!("S3 bucket name is required when backend is 's3'"));
                }
                if is_blank(&self.s3_access_key_id) {
                    return Err(anyhow!(
                        "S3 access key ID is required when backend is 's3'"
                    ));
                }
                if is_blank(&self.s3_secret_access_key) {
                    return Err(anyhow!(
                        "S3 secret access key is required when backend is 's3'"
                    ));
                }
            }
            backend => {
                return Err(anyhow!(
                    "Unsupported storage backend: {backend}. Use 'local' or 's3'"
                ));
            }
        }

        if !(1..=900).contains(&self.delivery_ttl_ceiling_secs) {
            return Err(anyhow!(
                "delivery_ttl_ceiling_secs must be between 1 and 900, got {}",
                self.delivery_ttl_ceiling_secs
            ));
        }

        if self.session_ttl_secs == 0 || self.session_ttl() > MAX_SESSION_TTL {
            return Err(anyhow!(
                "session_ttl_secs must be between 1 and {}, got {}",
                MAX_SESSION_TTL.as_secs(),
                self.session_ttl_secs
            ));
        }

        if let Some(base_url) = &self.public_base_url
            && !base_url.starts_with("http://")
            && !base_url.starts_with("https://")
        {
            return Err(anyhow!(
                "Public base URL must start with http:// or https://"
            ));
        }

        Ok(())
    }

    pub fn delivery_ttl_ceiling(&self) -> Duration {
        Duration::from_secs(self.delivery_ttl_ceiling_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn public_base_url(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.listen_on_port))
    }

    /// Build the storage configuration for the selected backend
    pub fn to_storage_config(&self) -> anyhow::Result<StorageConfig> {
        let backend = match self.storage_backend.as_str() {
            "local" => StorageBackend::Local,
            "s3" => StorageBackend::S3 {
                bucket: required(&self.s3_bucket, "s3_bucket")?,
                endpoint: self.s3_endpoint.clone(),
                region: self.s3_region.clone(),
                access_key_id: required(&self.s3_access_key_id, "s3_access_key_id")?,
                secret_access_key: required(&self.s3_secret_access_key, "s3_secret_access_key")?,
            },
            backend => return Err(anyhow!("Unsupported storage backend: {backend}")),
        };

        Ok(StorageConfig {
            backend,
            workspace: PathBuf::from(&self.workspace),
            public_base_url: self.public_base_url(),
        })
    }

    pub fn get_signing_key(&self, kid: u8) -> Option<[u8; 32]> {
        self.signing_keys
            .iter()
            .find(|(k, _)| *k == kid)
            .map(|(_, key)| *key)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(str::is_empty)
}

fn required(value: &Option<String>, name: &str) -> anyhow::Result<String> {
    value
        .clone()
        .ok_or_else(|| anyhow!("{name} is required when backend is 's3'"))
}

fn default_port() -> u16 {
    32145
}

fn default_internal_port() -> u16 {
    32146
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_delivery_ttl_ceiling_secs() -> u64 {
    120
}

fn default_session_ttl_secs() -> u64 {
    3600
}
