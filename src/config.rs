//! Server configuration: defaults, optional TOML file, `NORNICDB_` env
//! overrides, in that order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{NornicError, Result};
use crate::schema::FulltextConfig;
use crate::wal::SyncPolicy;

pub const ENV_PREFIX: &str = "NORNICDB_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingProvider {
    #[serde(rename = "remote-openai-compatible")]
    RemoteOpenAi,
    #[serde(rename = "remote-ollama-compatible")]
    RemoteOllama,
    #[serde(rename = "local")]
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Explicit allowed origins. A literal `*` is refused when credentials
    /// are allowed; that combination never leaves this process.
    pub origins: Vec<String>,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            origins: Vec::new(),
            allow_credentials: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_minute: u32,
    pub per_hour: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 120,
            per_hour: 3000,
            burst: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub url: String,
    pub model: String,
    pub dimension: usize,
    pub cache_size: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Local,
            url: String::new(),
            model: "nornic-hash-384".into(),
            dimension: 384,
            cache_size: 4096,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub enabled: bool,
    pub sync: SyncPolicy,
    pub batch_interval_ms: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync: SyncPolicy::Immediate,
            batch_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_body_bytes: usize,
    pub tx_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub cors: CorsConfig,
    pub tls: TlsConfig,
    pub rate_limit: RateLimitConfig,
    pub embedding: EmbeddingConfig,
    pub wal: WalConfig,
    pub auth: AuthConfig,
    pub fulltext: FulltextConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7474,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            idle_timeout_secs: 120,
            max_body_bytes: 16 * 1024 * 1024,
            tx_timeout_secs: 60,
            data_dir: PathBuf::from("./data"),
            cors: CorsConfig::default(),
            tls: TlsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            embedding: EmbeddingConfig::default(),
            wal: WalConfig::default(),
            auth: AuthConfig::default(),
            fulltext: FulltextConfig::default(),
        }
    }
}

impl Config {
    /// Layered load: defaults, then the TOML file, then env overrides.
    pub fn load(file: Option<&Path>) -> Result<Config> {
        let mut config = match file {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text).map_err(|e| {
                    NornicError::InvalidRequest(format!("config file {}: {e}", path.display()))
                })?
            }
            None => Config::default(),
        };
        config.apply_env(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cors.allow_credentials && self.cors.origins.iter().any(|o| o == "*") {
            return Err(NornicError::InvalidRequest(
                "CORS wildcard origin cannot be combined with credentials".into(),
            ));
        }
        if self.cors.enabled && self.cors.origins.is_empty() {
            return Err(NornicError::InvalidRequest(
                "CORS is enabled but no origins are listed".into(),
            ));
        }
        if self.embedding.provider != EmbeddingProvider::Local && self.embedding.url.is_empty() {
            return Err(NornicError::InvalidRequest(
                "remote embedding provider requires an url".into(),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(NornicError::InvalidRequest(
                "embedding dimension must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Applies `NORNICDB_*` overrides. Unknown keys warn rather than fail so
    /// a newer deployment script does not brick an older binary.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "BIND" => self.bind = value,
                "PORT" => parse_into(&mut self.port, name, &value),
                "DATA_DIR" => self.data_dir = PathBuf::from(value),
                "MAX_BODY_BYTES" => parse_into(&mut self.max_body_bytes, name, &value),
                "TX_TIMEOUT_SECS" => parse_into(&mut self.tx_timeout_secs, name, &value),
                "READ_TIMEOUT_SECS" => parse_into(&mut self.read_timeout_secs, name, &value),
                "WRITE_TIMEOUT_SECS" => parse_into(&mut self.write_timeout_secs, name, &value),
                "IDLE_TIMEOUT_SECS" => parse_into(&mut self.idle_timeout_secs, name, &value),
                "WAL_ENABLED" => parse_into(&mut self.wal.enabled, name, &value),
                "WAL_SYNC" => match value.as_str() {
                    "immediate" => self.wal.sync = SyncPolicy::Immediate,
                    "batch" => self.wal.sync = SyncPolicy::Batch,
                    "none" => self.wal.sync = SyncPolicy::None,
                    other => warn!(value = other, "unknown NORNICDB_WAL_SYNC value"),
                },
                "WAL_BATCH_INTERVAL_MS" => {
                    parse_into(&mut self.wal.batch_interval_ms, name, &value)
                }
                "EMBEDDING_PROVIDER" => match value.as_str() {
                    "remote-openai-compatible" => {
                        self.embedding.provider = EmbeddingProvider::RemoteOpenAi
                    }
                    "remote-ollama-compatible" => {
                        self.embedding.provider = EmbeddingProvider::RemoteOllama
                    }
                    "local" => self.embedding.provider = EmbeddingProvider::Local,
                    other => warn!(value = other, "unknown NORNICDB_EMBEDDING_PROVIDER value"),
                },
                "EMBEDDING_URL" => self.embedding.url = value,
                "EMBEDDING_MODEL" => self.embedding.model = value,
                "EMBEDDING_DIMENSION" => {
                    parse_into(&mut self.embedding.dimension, name, &value)
                }
                "EMBEDDING_CACHE_SIZE" => {
                    parse_into(&mut self.embedding.cache_size, name, &value)
                }
                "EMBEDDING_TIMEOUT_SECS" => {
                    parse_into(&mut self.embedding.timeout_secs, name, &value)
                }
                "AUTH_ENABLED" => parse_into(&mut self.auth.enabled, name, &value),
                "RATE_LIMIT_ENABLED" => parse_into(&mut self.rate_limit.enabled, name, &value),
                "RATE_PER_MINUTE" => parse_into(&mut self.rate_limit.per_minute, name, &value),
                "RATE_PER_HOUR" => parse_into(&mut self.rate_limit.per_hour, name, &value),
                "RATE_BURST" => parse_into(&mut self.rate_limit.burst, name, &value),
                "CORS_ENABLED" => parse_into(&mut self.cors.enabled, name, &value),
                "CORS_ORIGINS" => {
                    self.cors.origins = value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
                "CORS_ALLOW_CREDENTIALS" => {
                    parse_into(&mut self.cors.allow_credentials, name, &value)
                }
                "TLS_CERT" => self.tls.cert_path = Some(PathBuf::from(value)),
                "TLS_KEY" => self.tls.key_path = Some(PathBuf::from(value)),
                other => warn!(key = other, "unrecognized NORNICDB_ environment override"),
            }
        }
    }

    pub fn graph_dir(&self) -> PathBuf {
        self.data_dir.join("graph")
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn auth_dir(&self) -> PathBuf {
        self.data_dir.join("auth")
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, name: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key = name, value, "unparseable NORNICDB_ override ignored"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_win_over_defaults() {
        let mut config = Config::default();
        config.apply_env(vec![
            ("NORNICDB_PORT".to_string(), "9999".to_string()),
            ("NORNICDB_WAL_SYNC".to_string(), "batch".to_string()),
            ("NORNICDB_CORS_ORIGINS".to_string(), "https://a, https://b".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        assert_eq!(config.port, 9999);
        assert_eq!(config.wal.sync, SyncPolicy::Batch);
        assert_eq!(config.cors.origins, vec!["https://a", "https://b"]);
    }

    #[test]
    fn wildcard_origin_with_credentials_is_refused() {
        let mut config = Config::default();
        config.cors.enabled = true;
        config.cors.origins = vec!["*".into()];
        config.cors.allow_credentials = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn remote_provider_requires_url() {
        let mut config = Config::default();
        config.embedding.provider = EmbeddingProvider::RemoteOpenAi;
        assert!(config.validate().is_err());
        config.embedding.url = "http://localhost:11434/v1/embeddings".into();
        assert!(config.validate().is_ok());
    }
}
