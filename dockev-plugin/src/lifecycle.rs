use std::collections::HashMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Lifecycle state of one plugin slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PluginState {
    Discovered,
    Loading,
    Active,
    Unloading,
    Unloaded,
    Failed,
}

impl PluginState {
    /// Edges of the slot state machine.
    ///
    /// `discovered`/`unloaded`/`failed` may jump straight to `failed` when a
    /// load is skipped before it starts (missing dependency, unreadable unit).
    pub fn can_transition_to(self, to: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, to),
            (Discovered | Unloaded | Failed, Loading)
                | (Discovered | Unloaded | Failed, Failed)
                | (Loading, Active | Failed)
                | (Active, Unloading)
                | (Unloading, Unloaded | Failed)
        )
    }

    /// States from which `load` may start.
    pub fn is_loadable(self) -> bool {
        matches!(self, Self::Discovered | Self::Unloaded | Self::Failed)
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub plugin_name: String,
    pub from_state: PluginState,
    pub to_state: PluginState,
    pub timestamp: String,
    pub error: Option<String>,
}

/// Transitions kept by [`LifecycleTracker::new`].
pub const DEFAULT_MAX_EVENTS: usize = 1000;

/// Tracks the state of every plugin slot plus a bounded history of
/// transitions, oldest evicted first.
#[derive(Debug, Clone)]
pub struct LifecycleTracker {
    states: HashMap<String, PluginState>,
    events: VecDeque<LifecycleEvent>,
    max_events: usize,
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            states: HashMap::new(),
            events: VecDeque::new(),
            max_events,
        }
    }

    /// Record that a slot exists without emitting a transition.
    pub fn discovered(&mut self, plugin_name: &str) {
        self.states
            .entry(plugin_name.to_string())
            .or_insert(PluginState::Discovered);
    }

    pub fn transition(&mut self, plugin_name: &str, to_state: PluginState, error: Option<String>) {
        let from_state = self.state_of(plugin_name);
        self.states.insert(plugin_name.to_string(), to_state);
        if self.max_events == 0 {
            return;
        }
        if self.events.len() == self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(LifecycleEvent {
            plugin_name: plugin_name.into(),
            from_state,
            to_state,
            timestamp: chrono::Utc::now().to_rfc3339(),
            error,
        });
    }

    pub fn state_of(&self, plugin_name: &str) -> PluginState {
        self.states
            .get(plugin_name)
            .copied()
            .unwrap_or(PluginState::Discovered)
    }

    pub fn events_for(&self, plugin_name: &str) -> Vec<&LifecycleEvent> {
        self.events
            .iter()
            .filter(|e| e.plugin_name == plugin_name)
            .collect()
    }

    pub fn plugins_in(&self, state: PluginState) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}
