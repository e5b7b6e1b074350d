use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use crate::internal;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon settings plus the flat key -> list-of-lines oracle consumed by
/// plugins. The `[plugins]` table maps a key (e.g. `rhsbl_zones`) to the
/// lines a plugin reads, mirroring a directory of one-file-per-key
/// configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Hostname used in banners and replies.
    pub hostname: String,
    /// Seconds a session may sit idle before a 421 disconnect.
    pub timeout: u64,
    /// Directory holding the greylist database and its lock file.
    pub db_dir: PathBuf,
    /// Control channel bind address. Loopback only.
    pub control: SocketAddr,
    /// Per-session cap on concurrent DNS queries.
    pub dns_parallelism: usize,
    plugins: BTreeMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::from("localhost"),
            timeout: 300,
            db_dir: PathBuf::from("var"),
            control: SocketAddr::from(([127, 0, 0, 1], 20025)),
            dns_parallelism: 8,
            plugins: BTreeMap::default(),
        }
    }
}

impl Config {
    /// Load the daemon configuration. A missing file is not an error; the
    /// daemon starts with built-in defaults and no plugin configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                internal!(level = INFO, "no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// All lines registered under `key`, empty when the key is absent.
    pub fn get(&self, key: &str) -> &[String] {
        self.plugins.get(key).map_or(&[], Vec::as_slice)
    }

    /// First line registered under `key`.
    pub fn get_line(&self, key: &str) -> Option<&str> {
        self.get(key).first().map(String::as_str)
    }

    #[cfg(test)]
    pub(crate) fn set(&mut self, key: &str, lines: Vec<String>) {
        self.plugins.insert(key.to_string(), lines);
    }
}
