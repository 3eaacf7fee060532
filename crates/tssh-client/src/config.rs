//! User configuration at `~/.tssh/config.toml`.
//!
//! Holds the default destination, default transfer directories and
//! ssh-style options, globally and per host. `-o` flags always override
//! config file values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use tssh_core::{TsshError, TsshResult};

use crate::args::SessionArgs;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,

    /// Options applied to every destination.
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// Options keyed by destination alias.
    #[serde(default)]
    pub hosts: BTreeMap<String, BTreeMap<String, String>>,
}

/// `[default]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Destination used when none is given on the command line.
    #[serde(default)]
    pub host: String,

    /// Default upload directory for file transfers.
    #[serde(default)]
    pub upload_path: String,

    /// Default download directory for file transfers.
    #[serde(default)]
    pub download_path: String,
}

impl Config {
    /// Default location: `~/.tssh/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".tssh")
            .join("config.toml")
    }

    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> TsshResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TsshError::Config(format!("failed to read config at {}: {e}", path.display()))
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|e| {
            TsshError::Config(format!("failed to parse config at {}: {e}", path.display()))
        })?;
        config.default.upload_path = expand_home(&config.default.upload_path);
        config.default.download_path = expand_home(&config.default.download_path);

        debug!(path = %path.display(), hosts = config.hosts.len(), "loaded config");
        Ok(config)
    }

    /// Look up `key` for `destination`: host section first, then `[options]`.
    /// Keys match case-insensitively.
    pub fn get(&self, destination: &str, key: &str) -> Option<&str> {
        self.hosts
            .get(destination)
            .and_then(|section| lookup(section, key))
            .or_else(|| lookup(&self.options, key))
    }

    /// Configured host aliases, sorted.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }
}

fn lookup<'a>(section: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    section
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}

/// Effective option view for one run: `-o` flags, then the config file.
#[derive(Debug, Clone, Copy)]
pub struct Settings<'a> {
    pub args: &'a SessionArgs,
    pub config: &'a Config,
}

impl<'a> Settings<'a> {
    pub fn new(args: &'a SessionArgs, config: &'a Config) -> Self {
        Self { args, config }
    }

    /// The effective value of `key`, or an empty string when unset.
    pub fn get(&self, key: &str) -> &'a str {
        let (args, config) = (self.args, self.config);
        args.options
            .get(key)
            .or_else(|| config.get(&args.destination, key))
            .unwrap_or("")
    }

    /// Whether `key` is set to `yes` (any case).
    pub fn is_yes(&self, key: &str) -> bool {
        self.get(key).eq_ignore_ascii_case("yes")
    }

    /// Whether `key` is set to `no` (any case).
    pub fn is_no(&self, key: &str) -> bool {
        self.get(key).eq_ignore_ascii_case("no")
    }

    /// `SetEnv` pairs from `-o` flags and the config file.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut values: Vec<&str> = self
            .args
            .options
            .get_all("SetEnv")
            .iter()
            .map(String::as_str)
            .collect();
        if values.is_empty() {
            values.extend(self.config.get(&self.args.destination, "SetEnv"));
        }
        values
            .iter()
            .flat_map(|v| v.split_whitespace())
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
