//! Native plugins compiled into the `dockev` binary.

use std::path::PathBuf;

use dockev_plugin::NativeCatalog;
use dockev_plugin::Plugin;
use dockev_plugin::PluginError;
use dockev_plugin::ShellFacade;
use tracing::debug;
use tracing::warn;

pub mod shell_assistant;
pub mod system_log;

pub use shell_assistant::ShellAssistant;
pub use system_log::SystemLog;

/// Catalog of every native entry point a manifest may name.
pub fn native_catalog(log_dir: Option<PathBuf>, history_capacity: usize) -> NativeCatalog {
    NativeCatalog::new()
        .with(system_log::ENTRY, move |config| {
            let plugin = SystemLog::from_config(log_dir.clone(), history_capacity, config)?;
            Ok(Box::new(plugin) as Box<dyn Plugin>)
        })
        .with(shell_assistant::ENTRY, |_| {
            Ok(Box::new(ShellAssistant::default()) as Box<dyn Plugin>)
        })
}

/// Parse an optional count argument, falling back to `default`.
pub(crate) fn count_arg(args: &[String], default: usize) -> anyhow::Result<usize> {
    match args.first() {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("expected a number, got '{raw}'")),
    }
}

/// Drop the commands a plugin registered. Names another plugin owns are
/// left in place and returned.
pub(crate) fn release_commands(shell: &mut ShellFacade<'_>, names: &[&str]) -> Vec<String> {
    let mut kept = Vec::new();
    for name in names {
        match shell.unregister_command(name) {
            Ok(()) => {}
            Err(PluginError::NotOwner { owner, .. }) => {
                debug!(
                    plugin = %shell.owner(),
                    command = %name,
                    owner = %owner,
                    "command belongs to another plugin, leaving it registered"
                );
                kept.push((*name).to_string());
            }
            Err(err) => {
                warn!(plugin = %shell.owner(), command = %name, error = %err, "unregister failed");
            }
        }
    }
    kept
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::path::PathBuf;
    use std::sync::Arc;

    use dockev_plugin::CommandRegistry;
    use dockev_plugin::DefaultModuleLoader;
    use dockev_plugin::EventBus;
    use dockev_plugin::PluginManager;
    use dockev_security::PermissionGate;

    pub fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    pub fn manager(root: &Path, log_dir: Option<PathBuf>, gate: PermissionGate) -> PluginManager {
        PluginManager::new(
            root,
            Arc::new(DefaultModuleLoader::new(super::native_catalog(log_dir, 50))),
            CommandRegistry::new(),
            EventBus::new(),
            gate,
        )
    }

    pub fn run(manager: &PluginManager, line: &str) -> Option<String> {
        manager.dispatch(line).render()
    }
}
