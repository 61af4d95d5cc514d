//! On-disk CLI configuration: where the vault, message log, and attachments
//! live, plus the protocol [`p2pmsg_core::Config`] (§4.I), following the
//! nested-sub-structs-with-documented-defaults shape of the teacher CLI's
//! own config module.

use std::fs;
use std::path::{Path, PathBuf};

use p2pmsg_core::Config as ProtocolConfig;
use serde::{Deserialize, Serialize};

/// Everything the CLI needs beyond the protocol-level defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the vault, message database, and attachments live on disk.
    pub storage: StorageConfig,
    /// Protocol-level tunables (§4.I); defaults match `p2pmsg-core::Config`.
    pub protocol: ProtocolConfig,
    /// Log output configuration.
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            protocol: ProtocolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Paths under which this endpoint's state is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the passphrase-protected key vault.
    pub vault_dir: PathBuf,
    /// Path to the encrypted SQLite message database.
    pub database_path: PathBuf,
    /// Root directory for received/sent file attachments.
    pub files_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = default_data_dir();
        Self {
            vault_dir: root.join("vault"),
            database_path: root.join("messages.db"),
            files_dir: root.join("files"),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing-subscriber` env-filter directive, e.g. `"info"` or `"debug"`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "info".to_string() }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("P2PMSG_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".p2pmsg"))
}

impl Config {
    /// Load from a TOML file, falling back to defaults for anything it
    /// omits; if `path` does not exist, returns the default configuration
    /// rather than erroring (a fresh endpoint has no config file yet).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Write the default configuration to `path`, creating parent
    /// directories as needed.
    pub fn write_default(path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let cfg = Self::default();
        fs::write(path, toml::to_string_pretty(&cfg)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/p2pmsg.toml")).unwrap();
        assert_eq!(cfg.protocol.listen_port, 5555);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::default();
        let s = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&s).unwrap();
        assert_eq!(back.storage.vault_dir, cfg.storage.vault_dir);
        assert_eq!(back.protocol, cfg.protocol);
    }
}
