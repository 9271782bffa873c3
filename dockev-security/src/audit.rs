use serde::Deserialize;
use serde::Serialize;

use crate::capability::Capability;
use crate::capability::GrantState;

/// One recorded permission decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub plugin: String,
    pub capability: Capability,
    pub decision: GrantState,
    pub reason: Option<String>,
    pub timestamp: String,
}

/// Bounded buffer of permission decisions, oldest evicted first.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
    max_entries: usize,
    next_id: u64,
}

impl AuditLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            next_id: 0,
        }
    }

    pub fn record(
        &mut self,
        plugin: &str,
        capability: Capability,
        decision: GrantState,
        reason: Option<&str>,
    ) {
        if self.max_entries == 0 {
            return;
        }
        self.next_id += 1;
        self.entries.push(AuditEntry {
            id: format!("audit-{}", self.next_id),
            plugin: plugin.into(),
            capability,
            decision,
            reason: reason.map(Into::into),
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
        if self.entries.len() > self.max_entries {
            self.entries.remove(0);
        }
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn entries_for(&self, plugin: &str) -> Vec<&AuditEntry> {
        self.entries.iter().filter(|e| e.plugin == plugin).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
