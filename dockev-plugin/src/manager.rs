use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use dockev_security::PermissionGate;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::bus::EventBus;
use crate::bus::SubscriptionId;
use crate::bus::events;
use crate::contract::Plugin;
use crate::contract::PluginBus;
use crate::contract::PluginHandle;
use crate::contract::ShellFacade;
use crate::descriptor::PluginDescriptor;
use crate::descriptor::PluginKind;
use crate::error::PluginError;
use crate::error::Result;
use crate::lifecycle::LifecycleTracker;
use crate::lifecycle::PluginState;
use crate::loader;
use crate::loader::Fingerprint;
use crate::loader::ModuleLoader;
use crate::loader::panic_message;
use crate::registry::CommandInput;
use crate::registry::CommandRegistry;

/// A loaded plugin and what its last `register` produced.
pub struct ActivePlugin {
    pub plugin: Box<dyn Plugin>,
    pub handle: PluginHandle,
    pub commands: Vec<String>,
    pub subscriptions: Vec<SubscriptionId>,
}

struct Slot {
    descriptor: PluginDescriptor,
    active: Option<ActivePlugin>,
    last_error: Option<String>,
}

/// One row of `list()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatus {
    pub name: String,
    pub kind: PluginKind,
    pub state: PluginState,
    pub version: String,
    pub description: String,
    pub commands: Vec<String>,
    pub subscriptions: usize,
    pub depends_on: Vec<String>,
    pub fingerprint: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupFailure {
    pub name: String,
    pub kind: PluginKind,
    pub error: String,
}

/// What `start()` managed to bring up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    pub loaded: Vec<String>,
    pub failed: Vec<StartupFailure>,
}

impl StartupReport {
    fn record(&mut self, name: &str, kind: PluginKind, outcome: Result<()>) {
        match outcome {
            Ok(()) => self.loaded.push(name.to_string()),
            Err(err) => self.failed.push(StartupFailure {
                name: name.to_string(),
                kind,
                error: err.to_string(),
            }),
        }
    }

    pub fn core_failures(&self) -> Vec<&StartupFailure> {
        self.failed
            .iter()
            .filter(|f| f.kind == PluginKind::Core)
            .collect()
    }

    /// A core plugin that does not come up stops the host.
    pub fn is_fatal(&self) -> bool {
        !self.core_failures().is_empty()
    }
}

/// Result of feeding one input line to [`PluginManager::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Empty,
    Completed {
        command: String,
        output: Option<String>,
    },
    Failed {
        command: String,
        error: String,
    },
    Unknown {
        command: String,
        /// Closest known name, when one is close enough.
        suggestion: Option<String>,
    },
    Ambiguous {
        input: String,
        candidates: Vec<String>,
    },
    /// The name belongs to the host; the caller runs it.
    Builtin {
        command: String,
        args: Vec<String>,
    },
}

impl DispatchOutcome {
    /// Text to show the operator, if any.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Empty | Self::Builtin { .. } => None,
            Self::Completed { output, .. } => output.clone(),
            Self::Failed { command, error } => Some(format!("error: {command}: {error}")),
            Self::Unknown {
                command,
                suggestion: Some(suggestion),
            } => Some(format!(
                "unknown command: {command} (did you mean '{suggestion}'?)"
            )),
            Self::Unknown {
                command,
                suggestion: None,
            } => Some(format!("unknown command: {command} (try 'help')")),
            Self::Ambiguous { input, candidates } => Some(format!(
                "ambiguous command '{input}': {}",
                candidates.join(", ")
            )),
        }
    }
}

/// Owns every plugin slot and drives them through their lifecycle.
pub struct PluginManager {
    root: PathBuf,
    loader: Arc<dyn ModuleLoader>,
    registry: CommandRegistry,
    bus: EventBus,
    gate: PermissionGate,
    slots: BTreeMap<String, Slot>,
    load_order: Vec<String>,
    tracker: LifecycleTracker,
}

impl PluginManager {
    pub fn new(
        root: impl Into<PathBuf>,
        loader: Arc<dyn ModuleLoader>,
        registry: CommandRegistry,
        bus: EventBus,
        gate: PermissionGate,
    ) -> Self {
        Self {
            root: root.into(),
            loader,
            registry,
            bus,
            gate,
            slots: BTreeMap::new(),
            load_order: Vec::new(),
            tracker: LifecycleTracker::new(),
        }
    }

    /// Discover the plugin root and load everything: core plugins first,
    /// then standard plugins in dependency order.
    pub fn start(&mut self) -> Result<StartupReport> {
        self.rescan()?;
        let mut report = StartupReport::default();
        for kind in [PluginKind::Core, PluginKind::Standard] {
            let group: Vec<&PluginDescriptor> = self
                .slots
                .values()
                .map(|slot| &slot.descriptor)
                .filter(|d| d.kind == kind && d.state == PluginState::Discovered)
                .collect();
            let (ordered, blocked) = dependency_order(&group);
            for (name, dependency) in blocked {
                let err = self.fail(
                    &name,
                    PluginError::DependencyUnavailable {
                        plugin: name.clone(),
                        dependency,
                    },
                );
                report.record(&name, kind, Err(err));
            }
            for name in ordered {
                let outcome = self.load(&name);
                report.record(&name, kind, outcome);
            }
        }
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "plugin startup finished"
        );
        Ok(report)
    }

    /// Pick up units added to the plugin root since the last scan. Returns
    /// the new slot names.
    pub fn rescan(&mut self) -> Result<Vec<String>> {
        let mut added = Vec::new();
        for descriptor in loader::discover(&self.root)? {
            if let Some(slot) = self.slots.get(&descriptor.name) {
                if slot.descriptor.location != descriptor.location {
                    warn!(
                        plugin = %descriptor.name,
                        path = %descriptor.location.display(),
                        existing = %slot.descriptor.location.display(),
                        "duplicate plugin name, skipping unit"
                    );
                }
                continue;
            }
            let name = descriptor.name.clone();
            debug!(plugin = %name, path = %descriptor.location.display(), "discovered plugin");
            self.gate
                .declare(&name, descriptor.capabilities.iter().copied());
            self.tracker.discovered(&name);
            self.slots.insert(
                name.clone(),
                Slot {
                    descriptor,
                    active: None,
                    last_error: None,
                },
            );
            added.push(name);
        }
        Ok(added)
    }

    /// Bring a slot to `active`. Loading an active plugin is a no-op.
    pub fn load(&mut self, name: &str) -> Result<()> {
        let state = self.slot_state(name)?;
        if state == PluginState::Active {
            debug!(plugin = %name, "already active");
            return Ok(());
        }
        if !state.is_loadable() {
            return Err(PluginError::InvalidTransition {
                plugin: name.to_string(),
                from: state,
                to: PluginState::Loading,
            });
        }

        let descriptor = match self.refresh_descriptor(name) {
            Ok(descriptor) => descriptor,
            Err(err) => return Err(self.fail(name, err)),
        };
        for dependency in &descriptor.depends_on {
            if self.state(dependency) != Some(PluginState::Active) {
                let err = PluginError::DependencyUnavailable {
                    plugin: name.to_string(),
                    dependency: dependency.clone(),
                };
                return Err(self.fail(name, err));
            }
        }

        self.gate
            .declare(name, descriptor.capabilities.iter().copied());
        self.transition(name, PluginState::Loading, None);

        let mut plugin = match loader::import_unit(self.loader.as_ref(), &descriptor) {
            Ok(plugin) => plugin,
            Err(err) => return Err(self.fail(name, err)),
        };

        let mut bus = PluginBus::new(name, self.bus.clone());
        let mut shell = ShellFacade::new(name, &mut self.registry, self.gate.scoped(name));
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| plugin.register(&mut bus, &mut shell)));

        let handle = match outcome {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                self.rollback(name);
                let err = match err.downcast::<PluginError>() {
                    Ok(plugin_err) => plugin_err,
                    Err(other) => PluginError::load(name, other),
                };
                return Err(self.fail(name, err));
            }
            Err(panic) => {
                self.rollback(name);
                let err = PluginError::load(
                    name,
                    format!("register panicked: {}", panic_message(panic.as_ref())),
                );
                return Err(self.fail(name, err));
            }
        };

        let commands = self.registry.owned_by(name);
        let subscriptions: Vec<SubscriptionId> = self
            .bus
            .subscriptions_of(name)
            .into_iter()
            .map(|s| s.id)
            .collect();
        info!(
            plugin = %name,
            version = %descriptor.version,
            commands = commands.len(),
            subscriptions = subscriptions.len(),
            "plugin loaded"
        );
        let payload = json!({
            "name": name,
            "kind": descriptor.kind,
            "version": descriptor.version,
            "commands": commands,
        });
        if let Some(slot) = self.slots.get_mut(name) {
            slot.active = Some(ActivePlugin {
                plugin,
                handle,
                commands,
                subscriptions,
            });
            slot.last_error = None;
        }
        self.transition(name, PluginState::Active, None);
        self.load_order.push(name.to_string());
        self.bus.publish(events::PLUGIN_LOADED, payload);
        Ok(())
    }

    /// Take an active plugin down. Its commands and subscriptions are gone
    /// afterwards whatever its `unregister` did.
    pub fn unload(&mut self, name: &str) -> Result<()> {
        let state = self.slot_state(name)?;
        if state != PluginState::Active {
            return Err(PluginError::InvalidTransition {
                plugin: name.to_string(),
                from: state,
                to: PluginState::Unloading,
            });
        }
        self.transition(name, PluginState::Unloading, None);

        let active = self.slots.get_mut(name).and_then(|slot| slot.active.take());
        let mut failure = None;
        if let Some(active) = active {
            let ActivePlugin {
                mut plugin, handle, ..
            } = active;
            let mut bus = PluginBus::new(name, self.bus.clone());
            let mut shell = ShellFacade::new(name, &mut self.registry, self.gate.scoped(name));
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                plugin.unregister(&mut bus, &mut shell, handle)
            }));
            failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("unregister failed: {err:#}")),
                Err(panic) => Some(format!(
                    "unregister panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
        }
        if let Some(message) = &failure {
            warn!(plugin = %name, error = %message, "forcing plugin cleanup");
        }

        let leftover_commands = self.registry.unregister_owner(name);
        let leftover_subscriptions = self.bus.unsubscribe_all(name);
        if !leftover_commands.is_empty() || leftover_subscriptions > 0 {
            debug!(
                plugin = %name,
                commands = ?leftover_commands,
                subscriptions = leftover_subscriptions,
                "removed registrations left behind by unregister"
            );
        }

        if let Some(slot) = self.slots.get_mut(name) {
            slot.last_error.clone_from(&failure);
        }
        self.transition(name, PluginState::Unloaded, failure);
        self.load_order.retain(|n| n != name);
        info!(plugin = %name, "plugin unloaded");
        self.bus
            .publish(events::PLUGIN_UNLOADED, json!({ "name": name }));
        Ok(())
    }

    /// Unload if active, then load the unit as it is on disk now. A failed
    /// load leaves the slot `failed`; the old code is not restored.
    pub fn reload(&mut self, name: &str) -> Result<()> {
        if self.slot_state(name)? == PluginState::Active {
            self.unload(name)?;
        }
        info!(plugin = %name, "reloading plugin");
        self.load(name)
    }

    /// Reload every active or failed slot whose unit changed on disk.
    /// Returns the names that were reloaded.
    pub fn poll_changes(&mut self) -> Vec<String> {
        let changed: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                matches!(
                    slot.descriptor.state,
                    PluginState::Active | PluginState::Failed
                ) && loader::changed(&slot.descriptor)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &changed {
            info!(plugin = %name, "plugin changed on disk");
            if let Err(err) = self.reload(name) {
                warn!(plugin = %name, error = %err, "reload after change failed");
            }
        }
        changed
    }

    /// Split a line into command and arguments, resolve the command exactly
    /// or by unique prefix, and run it.
    pub fn dispatch(&self, line: &str) -> DispatchOutcome {
        let words = shlex::split(line)
            .unwrap_or_else(|| line.split_whitespace().map(str::to_string).collect());
        let mut words = words.into_iter();
        let Some(word) = words.next() else {
            return DispatchOutcome::Empty;
        };
        let args: Vec<String> = words.collect();

        let command = match self.resolve_command(&word) {
            Ok(command) => command,
            Err(outcome) => return outcome,
        };
        if self.registry.reserved_owner(&command).is_some() {
            return DispatchOutcome::Builtin { command, args };
        }
        let Some(entry) = self.registry.entry(&command) else {
            return self.unknown(&command);
        };
        let owner = entry.owner.clone();
        let handler = Arc::clone(&entry.handler);
        let input = CommandInput {
            name: command.clone(),
            args,
        };

        let error = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&input))) {
            Ok(Ok(output)) => {
                debug!(command = %command, owner = %owner, "command executed");
                self.bus.publish(
                    events::COMMAND_EXECUTED,
                    json!({ "command": command, "args": input.args, "owner": owner }),
                );
                return DispatchOutcome::Completed { command, output };
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };
        warn!(command = %command, owner = %owner, error = %error, "command failed");
        self.bus.publish(
            events::COMMAND_FAILED,
            json!({
                "command": command,
                "args": input.args,
                "owner": owner,
                "error": error,
            }),
        );
        DispatchOutcome::Failed { command, error }
    }

    fn resolve_command(&self, word: &str) -> std::result::Result<String, DispatchOutcome> {
        if word.is_empty() {
            return Err(self.unknown(word));
        }
        if self.registry.entry(word).is_some() || self.registry.reserved_owner(word).is_some() {
            return Ok(word.to_string());
        }
        let mut candidates = self.registry.complete(word);
        match candidates.len() {
            0 => Err(self.unknown(word)),
            1 => Ok(candidates.remove(0)),
            _ => Err(DispatchOutcome::Ambiguous {
                input: word.to_string(),
                candidates,
            }),
        }
    }

    fn unknown(&self, command: &str) -> DispatchOutcome {
        let suggestion = self.registry.closest(command);
        self.bus.publish(
            events::COMMAND_UNKNOWN,
            json!({ "command": command, "suggestion": suggestion }),
        );
        DispatchOutcome::Unknown {
            command: command.to_string(),
            suggestion,
        }
    }

    /// Every slot, sorted by name.
    pub fn list(&self) -> Vec<PluginStatus> {
        self.slots
            .iter()
            .map(|(name, slot)| {
                let d = &slot.descriptor;
                PluginStatus {
                    name: name.clone(),
                    kind: d.kind,
                    state: d.state,
                    version: d.version.clone(),
                    description: d.description.clone(),
                    commands: self.registry.owned_by(name),
                    subscriptions: self.bus.subscriptions_of(name).len(),
                    depends_on: d.depends_on.clone(),
                    fingerprint: d.fingerprint.to_string(),
                    error: slot.last_error.clone(),
                }
            })
            .collect()
    }

    /// Unload every active plugin, most recently loaded first.
    pub fn shutdown(&mut self) -> Vec<String> {
        let order: Vec<String> = self.load_order.iter().rev().cloned().collect();
        for name in &order {
            if let Err(err) = self.unload(name) {
                warn!(plugin = %name, error = %err, "unload during shutdown failed");
            }
        }
        order
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.slots.get(name).map(|slot| slot.descriptor.state)
    }

    pub fn descriptor(&self, name: &str) -> Option<&PluginDescriptor> {
        self.slots.get(name).map(|slot| &slot.descriptor)
    }

    pub fn active(&self, name: &str) -> Option<&ActivePlugin> {
        self.slots.get(name).and_then(|slot| slot.active.as_ref())
    }

    pub fn last_error(&self, name: &str) -> Option<&str> {
        self.slots.get(name).and_then(|slot| slot.last_error.as_deref())
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    pub fn load_order(&self) -> &[String] {
        &self.load_order
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CommandRegistry {
        &mut self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn tracker(&self) -> &LifecycleTracker {
        &self.tracker
    }

    pub fn plugin_root(&self) -> &Path {
        &self.root
    }

    fn slot_state(&self, name: &str) -> Result<PluginState> {
        self.state(name)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))
    }

    /// Re-read the unit and store the result on the slot. The fingerprint
    /// is recorded even when the unit is unreadable so an unchanged broken
    /// unit is not retried.
    fn refresh_descriptor(&mut self, name: &str) -> Result<PluginDescriptor> {
        let slot = self
            .slots
            .get_mut(name)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;
        match loader::refresh(&slot.descriptor) {
            Ok(fresh) => {
                slot.descriptor = fresh.clone();
                Ok(fresh)
            }
            Err(err) => {
                slot.descriptor.fingerprint = Fingerprint::current(&slot.descriptor.location);
                Err(err)
            }
        }
    }

    fn transition(&mut self, name: &str, to: PluginState, error: Option<String>) {
        let Some(slot) = self.slots.get_mut(name) else {
            return;
        };
        let from = slot.descriptor.state;
        if !from.can_transition_to(to) {
            warn!(plugin = %name, %from, %to, "unexpected lifecycle transition");
        }
        slot.descriptor.state = to;
        self.tracker.transition(name, to, error);
    }

    fn rollback(&mut self, name: &str) {
        let commands = self.registry.unregister_owner(name);
        let subscriptions = self.bus.unsubscribe_all(name);
        debug!(
            plugin = %name,
            commands = commands.len(),
            subscriptions,
            "rolled back partial registration"
        );
    }

    fn fail(&mut self, name: &str, err: PluginError) -> PluginError {
        let message = err.to_string();
        error!(plugin = %name, error = %message, "plugin failed");
        if let Some(slot) = self.slots.get_mut(name) {
            slot.last_error = Some(message.clone());
        }
        self.transition(name, PluginState::Failed, Some(message.clone()));
        self.bus.publish(
            events::PLUGIN_FAILED,
            json!({ "name": name, "error": message }),
        );
        err
    }
}

/// Order a group of descriptors so each comes after its in-group
/// dependencies, smallest name first among peers. Members that cannot be
/// ordered (cycles and anything depending on one) are returned with the
/// dependency that blocked them.
pub fn dependency_order(group: &[&PluginDescriptor]) -> (Vec<String>, Vec<(String, String)>) {
    let members: BTreeSet<&str> = group.iter().map(|d| d.name.as_str()).collect();
    let mut pending: BTreeMap<&str, BTreeSet<&str>> = group
        .iter()
        .map(|d| {
            let deps = d
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|dep| members.contains(dep))
                .collect();
            (d.name.as_str(), deps)
        })
        .collect();

    let mut ordered = Vec::new();
    loop {
        let ready = pending
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name);
        let Some(next) = ready else {
            break;
        };
        pending.remove(next);
        for deps in pending.values_mut() {
            deps.remove(next);
        }
        ordered.push(next.to_string());
    }

    let blocked = pending
        .into_iter()
        .map(|(name, deps)| {
            let dependency = deps.into_iter().next().unwrap_or(name);
            (name.to_string(), dependency.to_string())
        })
        .collect();
    (ordered, blocked)
}
