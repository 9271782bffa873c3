#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use dockev_plugin::CommandRegistry;
use dockev_plugin::DefaultModuleLoader;
use dockev_plugin::Event;
use dockev_plugin::EventBus;
use dockev_plugin::NativeCatalog;
use dockev_plugin::Plugin;
use dockev_plugin::PluginBus;
use dockev_plugin::PluginHandle;
use dockev_plugin::PluginManager;
use dockev_plugin::ShellFacade;
use dockev_plugin::command_handler;
use dockev_security::AutoDeny;
use dockev_security::Capability;
use dockev_security::PermissionGate;
use serde::Deserialize;

/// Knobs for the `recorder` native plugin, read from `[config]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub commands: Vec<String>,
    pub reply: String,
    pub events: Vec<String>,
    pub fail_register: bool,
    pub panic_register: bool,
    pub fail_unregister: bool,
    pub capability: Option<Capability>,
}

/// Registers the configured commands and subscriptions, then misbehaves on
/// request.
pub struct Recorder {
    config: RecorderConfig,
}

impl Plugin for Recorder {
    fn register(
        &mut self,
        bus: &mut PluginBus,
        shell: &mut ShellFacade<'_>,
    ) -> anyhow::Result<PluginHandle> {
        for name in &self.config.commands {
            let reply = self.config.reply.clone();
            shell.register_command(name, command_handler(move |_| Ok(Some(reply.clone()))))?;
        }
        for event in &self.config.events {
            bus.subscribe(event, |_| Ok(()));
        }
        if let Some(capability) = self.config.capability {
            let permissions = shell.permissions();
            shell.register_command(
                "guarded",
                command_handler(move |_| {
                    if permissions.ensure(capability, "test needs it") {
                        Ok(Some("allowed".to_string()))
                    } else {
                        Ok(Some("denied".to_string()))
                    }
                }),
            )?;
        }
        if self.config.panic_register {
            panic!("register exploded");
        }
        if self.config.fail_register {
            anyhow::bail!("register refused");
        }
        Ok(Box::new(()))
    }

    fn unregister(
        &mut self,
        _bus: &mut PluginBus,
        _shell: &mut ShellFacade<'_>,
        _handle: PluginHandle,
    ) -> anyhow::Result<()> {
        if self.config.fail_unregister {
            anyhow::bail!("unregister refused");
        }
        Ok(())
    }
}

pub fn catalog() -> NativeCatalog {
    NativeCatalog::new().with("recorder", |config| {
        let config: RecorderConfig = toml::Value::Table(config.clone()).try_into()?;
        Ok(Box::new(Recorder { config }) as Box<dyn Plugin>)
    })
}

pub fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

pub fn manager_with_gate(root: &Path, gate: PermissionGate) -> PluginManager {
    let mut registry = CommandRegistry::new();
    registry.reserve("shell", ["help", "exit"]);
    PluginManager::new(
        root,
        Arc::new(DefaultModuleLoader::new(catalog())),
        registry,
        EventBus::new(),
        gate,
    )
}

pub fn manager(root: &Path) -> PluginManager {
    manager_with_gate(root, PermissionGate::new(Arc::new(AutoDeny)))
}

/// Subscribe to everything and collect `(event name, payload name field)`.
pub fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<(String, String)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe("*", "test-observer", move |event: &Event| {
        let name = event
            .payload
            .get("name")
            .or_else(|| event.payload.get("command"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        sink.lock().unwrap().push((event.name.clone(), name));
        Ok(())
    });
    seen
}

pub fn script(kind: &str, commands: &[(&str, &str)]) -> String {
    let commands: Vec<String> = commands
        .iter()
        .map(|(name, reply)| format!("{{ name = \"{name}\", reply = \"{reply}\" }}"))
        .collect();
    format!(
        "[plugin]\nkind = \"{kind}\"\n\n[register]\ncommands = [{}]\n\n[unregister]\n",
        commands.join(", ")
    )
}

pub fn run(manager: &PluginManager, line: &str) -> Option<String> {
    manager.dispatch(line).render()
}
