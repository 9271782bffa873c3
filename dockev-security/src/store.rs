use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::capability::Capability;
use crate::capability::GrantState;
use crate::error::Result;

/// A final decision that survives restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedGrant {
    pub plugin: String,
    pub capability: Capability,
    pub state: GrantState,
}

/// Backend holding grants across host restarts.
pub trait LedgerStore: Send + Sync {
    fn load(&self) -> Result<Vec<PersistedGrant>>;
    fn save(&self, grants: &[PersistedGrant]) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    grants: BTreeMap<String, serde_json::Value>,
}

const LEDGER_VERSION: u32 = 1;

/// JSON file keyed by `"<plugin>/<capability>"`.
///
/// Unparseable keys or values are skipped on load, which leaves the pair
/// `unrequested`.
pub struct JsonLedgerStore {
    path: PathBuf,
}

impl JsonLedgerStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key(plugin: &str, capability: Capability) -> String {
        format!("{plugin}/{capability}")
    }

    fn parse_entry(key: &str, value: &serde_json::Value) -> Option<PersistedGrant> {
        let (plugin, cap) = key.rsplit_once('/')?;
        if plugin.is_empty() {
            return None;
        }
        let capability = Capability::from_str(cap).ok()?;
        let state: GrantState = serde_json::from_value(value.clone()).ok()?;
        if !state.is_final() {
            return None;
        }
        Some(PersistedGrant {
            plugin: plugin.to_string(),
            capability,
            state,
        })
    }
}

impl LedgerStore for JsonLedgerStore {
    fn load(&self) -> Result<Vec<PersistedGrant>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let file: LedgerFile = serde_json::from_str(&data)?;
        let mut grants = Vec::new();
        for (key, value) in &file.grants {
            match Self::parse_entry(key, value) {
                Some(grant) => grants.push(grant),
                None => warn!(entry = %key, path = %self.path.display(), "ignoring corrupt ledger entry"),
            }
        }
        Ok(grants)
    }

    fn save(&self, grants: &[PersistedGrant]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = LedgerFile {
            version: LEDGER_VERSION,
            grants: grants
                .iter()
                .filter(|g| g.state.is_final())
                .map(|g| {
                    (
                        Self::key(&g.plugin, g.capability),
                        serde_json::Value::String(g.state.to_string()),
                    )
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
