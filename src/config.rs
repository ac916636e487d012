use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default)]
    pub on_terminate: TerminatePolicy,
    #[serde(default)]
    pub handler: HandlerConfig,
}

/// What a SIGTERM does. `Restart` treats it exactly like SIGHUP.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerminatePolicy {
    #[default]
    Restart,
    Shutdown,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerConfig {
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_body")]
    pub body: String,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Config {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl HandlerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            backlog: default_backlog(),
            drain_timeout_secs: default_drain_timeout_secs(),
            on_terminate: TerminatePolicy::default(),
            handler: HandlerConfig::default(),
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            body: default_body(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

/// Loads the config from `path`, or from `config.toml` in the working
/// directory when no path is given. A missing default file means defaults.
pub fn get_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(path) => path,
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if !default_path.exists() {
                return Ok(Config::default());
            }
            default_path
        }
    };

    let toml_string = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    parse_config(&toml_string).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_config(toml_string: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(toml_string)
}

// Defaults
fn default_addr() -> String { String::from(":1111") }
fn default_backlog() -> i32 { 128 }
fn default_drain_timeout_secs() -> u64 { 20 }
fn default_delay_ms() -> u64 { 10_000 }
fn default_body() -> String { String::from("this is test response") }
fn default_read_timeout_secs() -> u64 { 6 }
