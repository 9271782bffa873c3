use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::loader::panic_message;

/// Event names the host itself publishes.
pub mod events {
    pub const PLUGIN_LOADED: &str = "plugin.loaded";
    pub const PLUGIN_UNLOADED: &str = "plugin.unloaded";
    pub const PLUGIN_FAILED: &str = "plugin.failed";
    pub const COMMAND_EXECUTED: &str = "command.executed";
    pub const COMMAND_FAILED: &str = "command.failed";
    pub const COMMAND_UNKNOWN: &str = "command.unknown";
    pub const SHELL_STARTED: &str = "shell.started";
    pub const SHELL_STOPPING: &str = "shell.stopping";
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    /// Who published it: a plugin name or the host.
    pub source: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Read-only view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub pattern: String,
    pub owner: String,
}

/// Outcome of one `publish`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    owner: String,
    handler: EventHandler,
}

#[derive(Default)]
struct BusTable {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

/// Synchronous in-process publish/subscribe.
///
/// Cloning yields another handle to the same table. Handlers run on the
/// publisher's thread, in subscription order, with the table unlocked.
#[derive(Clone, Default)]
pub struct EventBus {
    table: Arc<Mutex<BusTable>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.lock().subscriptions.len())
            .finish()
    }
}

/// `*` matches everything, `prefix.*` matches `prefix.` and below, anything
/// else matches exactly.
pub fn pattern_matches(pattern: &str, event: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('.') => event.starts_with(prefix),
        _ => pattern == event,
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, pattern: &str, owner: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut table = self.lock();
        table.next_id += 1;
        let id = SubscriptionId(table.next_id);
        table.subscriptions.push(Subscription {
            id,
            pattern: pattern.to_string(),
            owner: owner.to_string(),
            handler: Arc::new(handler),
        });
        debug!(owner, pattern, %id, "subscribed");
        id
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self.lock();
        let before = table.subscriptions.len();
        table.subscriptions.retain(|s| s.id != id);
        table.subscriptions.len() != before
    }

    /// Remove every subscription of `owner`, returning how many went away.
    pub fn unsubscribe_all(&self, owner: &str) -> usize {
        let mut table = self.lock();
        let before = table.subscriptions.len();
        table.subscriptions.retain(|s| s.owner != owner);
        before - table.subscriptions.len()
    }

    pub fn subscriptions_of(&self, owner: &str) -> Vec<SubscriptionInfo> {
        self.lock()
            .subscriptions
            .iter()
            .filter(|s| s.owner == owner)
            .map(|s| SubscriptionInfo {
                id: s.id,
                pattern: s.pattern.clone(),
                owner: s.owner.clone(),
            })
            .collect()
    }

    /// Number of subscriptions a publish of `event` would reach.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.lock()
            .subscriptions
            .iter()
            .filter(|s| pattern_matches(&s.pattern, event))
            .count()
    }

    /// Subscription count per pattern, sorted by pattern.
    pub fn patterns(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for sub in &self.lock().subscriptions {
            *counts.entry(sub.pattern.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn publish(&self, name: &str, payload: Value) -> PublishReport {
        self.publish_from("host", name, payload)
    }

    /// Deliver to every matching subscriber in order. A failing or
    /// panicking handler is logged and skipped.
    pub fn publish_from(&self, source: &str, name: &str, payload: Value) -> PublishReport {
        let targets: Vec<(SubscriptionId, String, EventHandler)> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| pattern_matches(&s.pattern, name))
            .map(|s| (s.id, s.owner.clone(), Arc::clone(&s.handler)))
            .collect();

        let event = Event {
            name: name.to_string(),
            source: source.to_string(),
            payload,
        };
        let mut report = PublishReport::default();
        for (id, owner, handler) in targets {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    warn!(event = %event.name, owner = %owner, %id, error = %err, "event handler failed");
                    report.failed += 1;
                }
                Err(panic) => {
                    warn!(
                        event = %event.name,
                        owner = %owner,
                        %id,
                        panic = %panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// A publish-only handle that stamps `source` on every event.
    pub fn publisher(&self, source: &str) -> EventPublisher {
        EventPublisher {
            bus: self.clone(),
            source: source.to_string(),
        }
    }
}

/// Publish-only bus handle, safe to capture in command handlers.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    bus: EventBus,
    source: String,
}

impl EventPublisher {
    pub fn publish(&self, name: &str, payload: Value) -> PublishReport {
        self.bus.publish_from(&self.source, name, payload)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}
