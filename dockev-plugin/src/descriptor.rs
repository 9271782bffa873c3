use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use dockev_security::Capability;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumString;

use crate::error::PluginError;
use crate::error::Result;
use crate::lifecycle::PluginState;
use crate::loader::Fingerprint;

/// File name of the manifest inside a directory unit.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Load class of a plugin. Core plugins settle before any standard plugin
/// is attempted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PluginKind {
    Core,
    #[default]
    Standard,
}

/// How the unit's code is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A compiled-in factory looked up by name.
    Native(String),
    /// The manifest's own `[register]`/`[unregister]` body.
    Script,
}

/// The `[plugin]` table of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManifestHeader {
    pub name: Option<String>,
    pub kind: PluginKind,
    pub version: Option<String>,
    pub description: Option<String>,
    pub entry: Option<String>,
    pub capabilities: Vec<Capability>,
    pub depends_on: Vec<String>,
}

impl ManifestHeader {
    /// Read the header from a parsed manifest. A manifest without a
    /// `[plugin]` table gets the defaults.
    pub fn from_table(table: &toml::Table, path: &Path) -> Result<Self> {
        match table.get("plugin") {
            None => Ok(Self::default()),
            Some(value) => value.clone().try_into().map_err(|e: toml::de::Error| {
                PluginError::Manifest {
                    path: path.display().to_string(),
                    message: e.message().to_string(),
                }
            }),
        }
    }

    /// Best-effort header for a manifest that failed strict parsing. Only
    /// the fields that decide load order are kept: `kind` and `depends_on`.
    pub fn salvage(table: &toml::Table) -> Self {
        let Some(plugin) = table.get("plugin").and_then(toml::Value::as_table) else {
            return Self::default();
        };
        let kind = plugin
            .get("kind")
            .and_then(toml::Value::as_str)
            .and_then(|kind| PluginKind::from_str(kind).ok())
            .unwrap_or_default();
        let depends_on = plugin
            .get("depends_on")
            .and_then(toml::Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(toml::Value::as_str)
                    .filter(|dep| validate_plugin_name(dep, Path::new("")).is_ok())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            kind,
            depends_on,
            ..Self::default()
        }
    }
}

/// Read and parse a manifest file.
pub fn read_manifest(path: &Path) -> Result<toml::Table> {
    let text = std::fs::read_to_string(path)?;
    text.parse::<toml::Table>()
        .map_err(|e| PluginError::Manifest {
            path: path.display().to_string(),
            message: e.message().to_string(),
        })
}

/// Everything the host knows about one plugin unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    /// The unit itself: a `.toml` file or a directory.
    pub location: PathBuf,
    pub manifest_path: PathBuf,
    /// Fingerprint of the unit at the last load attempt (or discovery).
    pub fingerprint: Fingerprint,
    pub kind: PluginKind,
    pub version: String,
    pub description: String,
    pub capabilities: BTreeSet<Capability>,
    pub depends_on: Vec<String>,
    pub entry: EntryKind,
    pub state: PluginState,
}

impl PluginDescriptor {
    /// Build a descriptor for the unit at `location` from its manifest
    /// header. `name` is the stem-derived fallback name.
    pub fn from_header(
        stem: &str,
        location: PathBuf,
        manifest_path: PathBuf,
        header: ManifestHeader,
        fingerprint: Fingerprint,
    ) -> Result<Self> {
        let name = header.name.unwrap_or_else(|| stem.to_string());
        validate_plugin_name(&name, &manifest_path)?;
        for dep in &header.depends_on {
            validate_plugin_name(dep, &manifest_path)?;
        }
        Ok(Self {
            name,
            location,
            manifest_path,
            fingerprint,
            kind: header.kind,
            version: header.version.unwrap_or_else(|| "0.0.0".to_string()),
            description: header.description.unwrap_or_default(),
            capabilities: header.capabilities.into_iter().collect(),
            depends_on: header.depends_on,
            entry: match header.entry {
                Some(entry) => EntryKind::Native(entry),
                None => EntryKind::Script,
            },
            state: PluginState::Discovered,
        })
    }

    pub fn is_core(&self) -> bool {
        self.kind == PluginKind::Core
    }
}

fn validate_plugin_name(name: &str, path: &Path) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PluginError::Manifest {
            path: path.display().to_string(),
            message: format!("invalid plugin name {name:?}"),
        })
    }
}
