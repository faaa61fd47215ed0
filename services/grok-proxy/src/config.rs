//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. Session cookies and
//! API keys are held as `Secret` so they never reach Debug output or logs.

use common::Secret;
use grok_client::{ClientConfig, DEFAULT_UPSTREAM_URL};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream endpoint settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            upstream_url: self.url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Rotation pools. Either may be empty.
#[derive(Debug, Default, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub cookies: Vec<Secret<String>>,
    #[serde(default)]
    pub user_agents: Vec<String>,
}

/// Accepted bearer tokens for the `/v1` routes
#[derive(Debug, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_keys: Vec<Secret<String>>,
}

fn default_upstream_url() -> String {
    DEFAULT_UPSTREAM_URL.to_string()
}

fn default_timeout() -> u64 {
    240
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// - `PROXY_API_KEY` adds one accepted API key
    /// - `PORT` replaces the port of `proxy.listen_addr`
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.upstream.url.starts_with("http://")
            && !config.upstream.url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream.url must start with http:// or https://, got: {}",
                config.upstream.url
            )));
        }

        if config.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream.timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "proxy.max_connections must be greater than 0".into(),
            ));
        }

        if let Ok(key) = std::env::var("PROXY_API_KEY") {
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.auth.api_keys.push(Secret::new(key));
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port.trim().parse().map_err(|e| common::Error::Env {
                name: "PORT",
                reason: format!("{e}"),
            })?;
            config.proxy.listen_addr.set_port(port);
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("grok-proxy.toml")
    }
}
