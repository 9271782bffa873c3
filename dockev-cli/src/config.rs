use std::path::Path;
use std::path::PathBuf;

use dockev_security::UndeclaredPolicy;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

const APP_DIR: &str = "dockev";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Host settings. Every field may be omitted from the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub plugin_root: PathBuf,
    /// Directory for the rolling log file; `None` disables file logging.
    pub log_dir: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    pub persist_ledger: bool,
    /// Hot-reload poll interval; 0 disables polling.
    pub poll_interval_ms: u64,
    pub unattended: bool,
    pub undeclared_capabilities: UndeclaredPolicy,
    pub audit_capacity: usize,
    pub history_capacity: usize,
    pub prompt: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir().map(|dir| dir.join(APP_DIR));
        Self {
            plugin_root: PathBuf::from("plugins"),
            log_dir: data_dir.as_ref().map(|dir| dir.join("logs")),
            ledger_path: data_dir.map(|dir| dir.join("permissions.json")),
            persist_ledger: true,
            poll_interval_ms: 1000,
            unattended: false,
            undeclared_capabilities: UndeclaredPolicy::default(),
            audit_capacity: 1000,
            history_capacity: 200,
            prompt: "dockev> ".to_string(),
        }
    }
}

/// `<config dir>/dockev/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

impl HostConfig {
    /// Read a config file. A missing file yields the defaults; an unreadable
    /// or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Ledger file to persist to, if persistence is on.
    pub fn ledger_file(&self) -> Option<&Path> {
        if self.persist_ledger {
            self.ledger_path.as_deref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.plugin_root, PathBuf::from("plugins"));
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.audit_capacity, 1000);
        assert_eq!(config.history_capacity, 200);
        assert_eq!(config.prompt, "dockev> ");
        assert_eq!(config.undeclared_capabilities, UndeclaredPolicy::Allow);
        assert!(config.persist_ledger);
        assert!(!config.unattended);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "plugin_root = \"/srv/plugins\"\npoll_interval_ms = 0\nundeclared_capabilities = \"deny\"\n",
        )
        .unwrap();
        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.plugin_root, PathBuf::from("/srv/plugins"));
        assert_eq!(config.poll_interval_ms, 0);
        assert_eq!(config.undeclared_capabilities, UndeclaredPolicy::Deny);
        assert_eq!(config.prompt, "dockev> ");
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "poll_interval_ms = \"soon\"\n").unwrap();
        assert!(matches!(
            HostConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));

        std::fs::write(&path, "no_such_setting = 1\n").unwrap();
        assert!(HostConfig::load(&path).is_err());
    }

    #[test]
    fn test_ledger_file_respects_persistence() {
        let mut config = HostConfig {
            ledger_path: Some(PathBuf::from("l.json")),
            ..Default::default()
        };
        assert_eq!(config.ledger_file(), Some(Path::new("l.json")));
        config.persist_ledger = false;
        assert_eq!(config.ledger_file(), None);
    }
}
