use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use serde::Serialize;

use crate::config::HostConfig;

/// Interactive shell that hosts hot-reloadable command plugins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Parser, Serialize, Deserialize)]
#[command(name = "dockev", version, about)]
pub struct DockevCliArgs {
    /// Plugin root directory
    #[arg(long = "plugins", value_name = "DIR", env = "DOCKEV_PLUGINS")]
    pub plugin_root: Option<PathBuf>,

    /// Host config file
    #[arg(long = "config", value_name = "FILE", env = "DOCKEV_CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Deny every permission prompt without asking
    #[arg(long)]
    pub unattended: bool,

    /// Where granted/denied permissions are persisted
    #[arg(long = "ledger", value_name = "FILE")]
    pub ledger_path: Option<PathBuf>,

    /// Keep the permission ledger in memory only
    #[arg(long)]
    pub no_persist: bool,

    /// Hot-reload poll interval in milliseconds (0 disables)
    #[arg(long = "poll-ms", value_name = "N")]
    pub poll_ms: Option<u64>,

    /// Do not write the default plugins into an empty plugin root
    #[arg(long)]
    pub no_scaffold: bool,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Run a command line and exit; may be repeated
    #[arg(short = 'c', long = "command", value_name = "LINE")]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgsValidationError {
    #[error("Conflicting flags: {0}")]
    ConflictingFlags(String),
    #[error("Empty command line passed to --command")]
    EmptyCommand,
}

pub fn validate(args: &DockevCliArgs) -> Result<(), ArgsValidationError> {
    if args.ledger_path.is_some() && args.no_persist {
        return Err(ArgsValidationError::ConflictingFlags(
            "--ledger and --no-persist cannot both be set".to_string(),
        ));
    }
    if args.commands.iter().any(|line| line.trim().is_empty()) {
        return Err(ArgsValidationError::EmptyCommand);
    }
    Ok(())
}

impl DockevCliArgs {
    /// Overlay the flags that were given onto a loaded config.
    pub fn apply_to(&self, config: &mut HostConfig) {
        if let Some(root) = &self.plugin_root {
            config.plugin_root.clone_from(root);
        }
        if let Some(ledger) = &self.ledger_path {
            config.ledger_path = Some(ledger.clone());
            config.persist_ledger = true;
        }
        if self.no_persist {
            config.persist_ledger = false;
        }
        if let Some(ms) = self.poll_ms {
            config.poll_interval_ms = ms;
        }
        if self.unattended {
            config.unattended = true;
        }
    }
}
