use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_upstream_addrs")]
    pub upstream_addrs: Vec<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub message_timeout_secs: Option<u64>,
    #[serde(default)]
    pub client_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub catalog: Option<CatalogConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_catalog_auth_db")]
    pub auth_db: String,
    #[serde(default = "default_catalog_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_addrs: default_upstream_addrs(),
            log_level: None,
            message_timeout_secs: Some(120),
            client_idle_timeout_secs: Some(3600),
            catalog: None,
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:6000".to_string()
}

// Default to Mongo's standard port locally
fn default_upstream_addrs() -> Vec<String> {
    vec!["127.0.0.1:27017".to_string()]
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            auth_db: default_catalog_auth_db(),
            timeout_ms: default_catalog_timeout_ms(),
        }
    }
}

fn default_catalog_auth_db() -> String {
    "admin".to_string()
}

fn default_catalog_timeout_ms() -> u64 {
    5_000
}

/// Split a comma-separated address list, trimming whitespace.
pub fn split_addr_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from a TOML file. If `path_opt` is None or the file
    /// is missing/unreadable, returns defaults. Parsing errors are returned.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let path = path_opt.unwrap_or("config.toml");
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(cfg) => Ok(cfg),
                Err(e) => Err(Error::Msg(format!("Failed to parse {}: {}", path, e))),
            },
            Err(_e) => Ok(Self::default()),
        }
    }

    /// Apply CLI/env overrides (highest precedence) to an existing config.
    #[allow(clippy::too_many_arguments)]
    pub fn with_overrides(
        mut self,
        listen_addr: Option<String>,
        upstream_addrs: Option<String>,
        log_level: Option<String>,
        message_timeout_secs: Option<u64>,
        client_idle_timeout_secs: Option<u64>,
        catalog_username: Option<String>,
        catalog_password: Option<String>,
        catalog_auth_db: Option<String>,
    ) -> Self {
        if let Some(addr) = listen_addr {
            self.listen_addr = addr;
        }
        if let Some(addrs) = upstream_addrs {
            self.upstream_addrs = split_addr_list(&addrs);
        }
        if let Some(ll) = log_level {
            self.log_level = Some(ll);
        }
        if let Some(secs) = message_timeout_secs {
            self.message_timeout_secs = Some(secs);
        }
        if let Some(secs) = client_idle_timeout_secs {
            self.client_idle_timeout_secs = Some(secs);
        }
        if catalog_username.is_some() || catalog_password.is_some() || catalog_auth_db.is_some() {
            let mut cat = self.catalog.unwrap_or_default();
            if let Some(v) = catalog_username {
                cat.username = Some(v);
            }
            if let Some(v) = catalog_password {
                cat.password = Some(v);
            }
            if let Some(v) = catalog_auth_db {
                cat.auth_db = v;
            }
            self.catalog = Some(cat);
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::Msg("listen_addr cannot be empty".to_string()));
        }
        if !self.listen_addr.contains(':') {
            return Err(Error::Msg(format!(
                "listen_addr '{}' must be in host:port format",
                self.listen_addr
            )));
        }

        if self.upstream_addrs.is_empty() {
            return Err(Error::Msg("upstream_addrs cannot be empty".to_string()));
        }
        for addr in &self.upstream_addrs {
            if !addr.contains(':') {
                return Err(Error::Msg(format!(
                    "upstream address '{}' must be in host:port format",
                    addr
                )));
            }
        }

        if self.message_timeout_secs == Some(0) {
            return Err(Error::Msg("message_timeout_secs must be > 0".to_string()));
        }
        if self.client_idle_timeout_secs == Some(0) {
            return Err(Error::Msg(
                "client_idle_timeout_secs must be > 0".to_string(),
            ));
        }

        if let Some(ref catalog) = self.catalog {
            if catalog.username.is_some() != catalog.password.is_some() {
                return Err(Error::Msg(
                    "catalog username and password must be set together".to_string(),
                ));
            }
            if catalog.timeout_ms == 0 {
                return Err(Error::Msg("catalog.timeout_ms must be > 0".to_string()));
            }
        }

        Ok(())
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs.unwrap_or(120))
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.client_idle_timeout_secs.unwrap_or(3600))
    }
}
