use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::audit::AuditEntry;
use crate::audit::AuditLog;
use crate::capability::Capability;
use crate::capability::GrantState;
use crate::error::PermissionDenied;
use crate::store::LedgerStore;
use crate::store::PersistedGrant;

/// The operator's answer to a single permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Granted,
    Denied,
}

impl From<Decision> for GrantState {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Granted => GrantState::Granted,
            Decision::Denied => GrantState::Denied,
        }
    }
}

/// Surface that asks the operator whether a plugin may use a capability.
pub trait DecisionProvider: Send + Sync {
    fn decide(&self, plugin: &str, capability: Capability, reason: &str) -> Decision;
}

/// Unattended policy: every prompt is answered "no".
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDeny;

impl DecisionProvider for AutoDeny {
    fn decide(&self, plugin: &str, capability: Capability, reason: &str) -> Decision {
        warn!(
            plugin = %plugin,
            capability = %capability,
            reason = %reason,
            "unattended mode: permission denied without prompting"
        );
        Decision::Denied
    }
}

/// Replays a fixed list of answers, then denies.
#[derive(Debug, Default)]
pub struct ScriptedDecisions {
    answers: Mutex<VecDeque<Decision>>,
    asked: Mutex<Vec<(String, Capability)>>,
}

impl ScriptedDecisions {
    pub fn new(answers: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Every prompt shown so far, in order.
    pub fn asked(&self) -> Vec<(String, Capability)> {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DecisionProvider for ScriptedDecisions {
    fn decide(&self, plugin: &str, capability: Capability, _reason: &str) -> Decision {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((plugin.to_string(), capability));
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Decision::Denied)
    }
}

/// What to do when a plugin requests a capability it never declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndeclaredPolicy {
    /// Prompt as usual and log a warning.
    #[default]
    Allow,
    /// Record a denial without prompting.
    Deny,
}

/// (plugin, capability) → grant state. Absent pairs are `unrequested`.
#[derive(Debug, Clone, Default)]
pub struct PermissionLedger {
    entries: BTreeMap<(String, Capability), GrantState>,
}

impl PermissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, plugin: &str, capability: Capability) -> GrantState {
        self.entries
            .get(&(plugin.to_string(), capability))
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&mut self, plugin: &str, capability: Capability, state: GrantState) {
        if state == GrantState::Unrequested {
            self.entries.remove(&(plugin.to_string(), capability));
        } else {
            self.entries.insert((plugin.to_string(), capability), state);
        }
    }

    pub fn records(&self) -> Vec<GrantRecord> {
        self.entries
            .iter()
            .map(|((plugin, capability), state)| GrantRecord {
                plugin: plugin.clone(),
                capability: *capability,
                state: *state,
            })
            .collect()
    }

    fn persisted(&self) -> Vec<PersistedGrant> {
        self.entries
            .iter()
            .filter(|(_, state)| state.is_final())
            .map(|((plugin, capability), state)| PersistedGrant {
                plugin: plugin.clone(),
                capability: *capability,
                state: *state,
            })
            .collect()
    }
}

/// Ledger row for operator display, ordered by plugin then capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRecord {
    pub plugin: String,
    pub capability: Capability,
    pub state: GrantState,
}

struct GateState {
    ledger: PermissionLedger,
    declared: HashMap<String, BTreeSet<Capability>>,
    audit: AuditLog,
    policy: UndeclaredPolicy,
}

/// Records operator decisions and answers capability checks.
///
/// Cloning yields another handle onto the same ledger. The whole table sits
/// behind one mutex, and the decision provider is always called with the lock
/// released. Saves are serialized by a second mutex so the store always ends
/// up with the newest snapshot.
#[derive(Clone)]
pub struct PermissionGate {
    state: Arc<Mutex<GateState>>,
    provider: Arc<dyn DecisionProvider>,
    store: Option<Arc<dyn LedgerStore>>,
    save_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

const DEFAULT_AUDIT_CAPACITY: usize = 1000;

impl PermissionGate {
    pub fn new(provider: Arc<dyn DecisionProvider>) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState {
                ledger: PermissionLedger::new(),
                declared: HashMap::new(),
                audit: AuditLog::new(DEFAULT_AUDIT_CAPACITY),
                policy: UndeclaredPolicy::default(),
            })),
            provider,
            store: None,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Attach a persisted ledger and load its grants.
    ///
    /// A store that cannot be read leaves every pair `unrequested`.
    pub fn with_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        match store.load() {
            Ok(grants) => {
                let mut state = self.lock();
                for grant in grants {
                    state
                        .ledger
                        .set(&grant.plugin, grant.capability, grant.state);
                }
                debug!(count = state.ledger.entries.len(), "loaded persisted grants");
            }
            Err(err) => {
                warn!(error = %err, "persisted ledger unreadable, starting empty");
            }
        }
        self.store = Some(store);
        self
    }

    pub fn with_policy(self, policy: UndeclaredPolicy) -> Self {
        self.lock().policy = policy;
        self
    }

    pub fn with_audit_capacity(self, capacity: usize) -> Self {
        self.lock().audit = AuditLog::new(capacity);
        self
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the capabilities a plugin declared in its descriptor.
    pub fn declare(&self, plugin: &str, capabilities: impl IntoIterator<Item = Capability>) {
        self.lock()
            .declared
            .insert(plugin.to_string(), capabilities.into_iter().collect());
    }

    /// Ask the operator for a capability unless a final decision is on file.
    pub fn request(&self, plugin: &str, capability: Capability, reason: &str) -> GrantState {
        {
            let mut state = self.lock();
            let current = state.ledger.get(plugin, capability);
            if current.is_final() {
                return current;
            }

            let declared = state
                .declared
                .get(plugin)
                .is_some_and(|caps| caps.contains(&capability));
            if !declared {
                match state.policy {
                    UndeclaredPolicy::Allow => {
                        warn!(
                            plugin = %plugin,
                            capability = %capability,
                            "plugin requested a capability it did not declare"
                        );
                    }
                    UndeclaredPolicy::Deny => {
                        warn!(
                            plugin = %plugin,
                            capability = %capability,
                            "undeclared capability denied by policy"
                        );
                        state.ledger.set(plugin, capability, GrantState::Denied);
                        state.audit.record(
                            plugin,
                            capability,
                            GrantState::Denied,
                            Some("undeclared capability"),
                        );
                        drop(state);
                        self.persist();
                        return GrantState::Denied;
                    }
                }
            }

            state.ledger.set(plugin, capability, GrantState::Pending);
        }

        let decision: GrantState = self.provider.decide(plugin, capability, reason).into();
        {
            let mut state = self.lock();
            state.ledger.set(plugin, capability, decision);
            state
                .audit
                .record(plugin, capability, decision, Some(reason));
        }
        info!(
            plugin = %plugin,
            capability = %capability,
            decision = %decision,
            "permission decision recorded"
        );
        self.persist();
        decision
    }

    /// Pure ledger lookup; only an explicit grant passes.
    pub fn check(&self, plugin: &str, capability: Capability) -> bool {
        self.lock().ledger.get(plugin, capability) == GrantState::Granted
    }

    pub fn state(&self, plugin: &str, capability: Capability) -> GrantState {
        self.lock().ledger.get(plugin, capability)
    }

    /// `check` shaped for `?` at call sites.
    pub fn require(
        &self,
        plugin: &str,
        capability: Capability,
    ) -> std::result::Result<(), PermissionDenied> {
        if self.check(plugin, capability) {
            Ok(())
        } else {
            Err(PermissionDenied {
                plugin: plugin.to_string(),
                capability,
            })
        }
    }

    /// Forget a decision so the next request prompts again.
    pub fn revoke(&self, plugin: &str, capability: Capability) -> GrantState {
        let previous = {
            let mut state = self.lock();
            let previous = state.ledger.get(plugin, capability);
            state
                .ledger
                .set(plugin, capability, GrantState::Unrequested);
            previous
        };
        if previous != GrantState::Unrequested {
            info!(plugin = %plugin, capability = %capability, "permission revoked");
            self.persist();
        }
        previous
    }

    pub fn grants(&self) -> Vec<GrantRecord> {
        self.lock().ledger.records()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit.entries().to_vec()
    }

    /// A view bound to one plugin's name.
    pub fn scoped(&self, plugin: &str) -> ScopedPermissions {
        ScopedPermissions {
            gate: self.clone(),
            plugin: plugin.to_string(),
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        // Snapshot and save under the same guard: a later snapshot never
        // lands on disk before an earlier one.
        let _saving = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let grants = self.lock().ledger.persisted();
        if let Err(err) = store.save(&grants) {
            warn!(error = %err, "failed to persist permission ledger");
        }
    }
}

/// The only permission surface a plugin sees: its own rows of the ledger.
#[derive(Debug, Clone)]
pub struct ScopedPermissions {
    gate: PermissionGate,
    plugin: String,
}

impl ScopedPermissions {
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn request(&self, capability: Capability, reason: &str) -> GrantState {
        self.gate.request(&self.plugin, capability, reason)
    }

    pub fn check(&self, capability: Capability) -> bool {
        self.gate.check(&self.plugin, capability)
    }

    pub fn require(&self, capability: Capability) -> std::result::Result<(), PermissionDenied> {
        self.gate.require(&self.plugin, capability)
    }

    /// Request if needed, then report whether the capability may be used.
    pub fn ensure(&self, capability: Capability, reason: &str) -> bool {
        self.request(capability, reason) == GrantState::Granted
    }
}
