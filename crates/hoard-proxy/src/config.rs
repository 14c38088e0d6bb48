use crate::error::ConfigError;
use crate::forwarder::DEFAULT_FETCH_TIMEOUT;
use axum::http::Uri;
use hoard_cache::DEFAULT_TTL;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_max_body_size")]
    pub max_body_size_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,
    #[serde(default = "default_admin_addr")]
    pub listen_addr: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Defaults with no origin; callers must supply one before `validate`.
    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
            admin: AdminConfig::default(),
        }
    }

    /// Apply command-line overrides on top of file values.
    pub fn apply_overrides(&mut self, port: Option<u16>, origin: Option<&str>) {
        if let Some(port) = port {
            self.server.listen_addr = format!("0.0.0.0:{port}");
        }
        if let Some(origin) = origin {
            self.upstream.url = origin.to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.url.trim().is_empty() {
            return Err(ConfigError::MissingOrigin);
        }
        let origin: Uri = self
            .upstream
            .url
            .parse()
            .map_err(|e: axum::http::uri::InvalidUri| ConfigError::InvalidOrigin {
                url: self.upstream.url.clone(),
                reason: e.to_string(),
            })?;
        if origin.scheme_str() != Some("http") || origin.authority().is_none() {
            return Err(ConfigError::InvalidOrigin {
                url: self.upstream.url.clone(),
                reason: "expected an absolute http:// url".to_string(),
            });
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        parse_addr(&self.server.listen_addr)?;
        if self.admin.enabled {
            parse_addr(&self.admin.listen_addr)?;
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.timeout_ms)
    }
}

pub fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|e: std::net::AddrParseError| ConfigError::InvalidListenAddr {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_seconds: default_ttl(),
            max_body_size_bytes: default_max_body_size(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: default_admin_enabled(),
            listen_addr: default_admin_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_timeout_ms() -> u64 {
    DEFAULT_FETCH_TIMEOUT.as_millis() as u64
}
fn default_capacity() -> usize {
    1000
}
fn default_ttl() -> u64 {
    DEFAULT_TTL.as_secs()
}
fn default_max_body_size() -> usize {
    1_048_576
}
fn default_admin_enabled() -> bool {
    true
}
fn default_admin_addr() -> String {
    "127.0.0.1:9090".to_string()
}
