//! Server configuration: TOML file + CLI overrides.

use bosh_core::{BoshError, BoshResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub bind: BindSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_domain")]
    pub domain: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            domain: default_domain(),
        }
    }
}

/// `[bind]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BindSection {
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait: u64,
}

impl Default for BindSection {
    fn default() -> Self {
        Self {
            inactivity_timeout: default_inactivity_timeout(),
            max_requests: default_max_requests(),
            polling_interval: default_polling_interval(),
            max_wait: default_max_wait(),
        }
    }
}

fn default_port() -> u16 {
    7070
}
fn default_domain() -> String {
    "localhost".to_string()
}
fn default_inactivity_timeout() -> u64 {
    1800
}
fn default_max_requests() -> u32 {
    2
}
fn default_polling_interval() -> u64 {
    5
}
fn default_max_wait() -> u64 {
    3600
}

/// Server-wide binding limits, fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindConfig {
    /// Seconds a session may go without a bound request.
    pub inactivity_timeout: u64,
    /// Simultaneous requests a client may have outstanding.
    pub max_requests: u32,
    /// Minimum seconds between polls when nothing is held.
    pub polling_interval: u64,
    /// Ceiling on the `wait` a client may negotiate, in seconds.
    pub max_wait: u64,
}

impl BindConfig {
    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout)
    }

    pub fn polling(&self) -> Duration {
        Duration::from_secs(self.polling_interval)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        BindSection::default().into()
    }
}

impl From<BindSection> for BindConfig {
    fn from(section: BindSection) -> Self {
        Self {
            inactivity_timeout: section.inactivity_timeout,
            max_requests: section.max_requests,
            polling_interval: section.polling_interval,
            max_wait: section.max_wait,
        }
    }
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub domain: Option<String>,
    pub inactivity_timeout: Option<u64>,
    pub max_requests: Option<u32>,
    pub polling_interval: Option<u64>,
    pub max_wait: Option<u64>,
}

/// Resolved server configuration (file read, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub domain: String,
    pub bind: BindConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> BoshResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| BoshError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut bind = BindConfig::from(file_config.bind);
        if let Some(v) = cli.inactivity_timeout {
            bind.inactivity_timeout = v;
        }
        if let Some(v) = cli.max_requests {
            bind.max_requests = v;
        }
        if let Some(v) = cli.polling_interval {
            bind.polling_interval = v;
        }
        if let Some(v) = cli.max_wait {
            bind.max_wait = v;
        }
        if bind.max_requests == 0 {
            return Err(BoshError::Config("max_requests must be at least 1".into()));
        }

        Ok(Self {
            port: cli.port.unwrap_or(file_config.server.port),
            domain: cli.domain.unwrap_or(file_config.server.domain),
            bind,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
