//! The interactive loop: built-in commands, plugin dispatch, and the
//! hot-reload tick between lines.

use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use dockev_plugin::CommandRegistry;
use dockev_plugin::DefaultModuleLoader;
use dockev_plugin::DispatchOutcome;
use dockev_plugin::EventBus;
use dockev_plugin::PluginManager;
use dockev_plugin::StartupReport;
use dockev_plugin::events;
use dockev_security::Capability;
use dockev_security::DecisionProvider;
use dockev_security::JsonLedgerStore;
use dockev_security::PermissionGate;
use serde_json::json;
use strum::IntoEnumIterator;
use strum_macros::AsRefStr;
use strum_macros::Display;
use strum_macros::EnumIter;
use strum_macros::EnumString;
use strum_macros::IntoStaticStr;
use tracing::info;
use tracing::warn;

use crate::config::HostConfig;
use crate::plugins::native_catalog;
use crate::usage::UsageTracker;

/// Owner recorded for the names the shell keeps for itself.
pub const BUILTIN_OWNER: &str = "shell";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, AsRefStr, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Builtin {
    Help,
    Plugins,
    Load,
    Unload,
    Reload,
    Rescan,
    Grants,
    Revoke,
    Events,
    Stats,
    Exit,
    Quit,
}

impl Builtin {
    pub fn usage(self) -> &'static str {
        match self {
            Self::Help => "help                     list commands",
            Self::Plugins => "plugins                  list plugins and their state",
            Self::Load => "load <plugin>            load a plugin",
            Self::Unload => "unload <plugin>          unload a plugin",
            Self::Reload => "reload [plugin]          reload one plugin, or every changed one",
            Self::Rescan => "rescan                   load plugins added to the plugin root",
            Self::Grants => "grants [audit]           show permission decisions",
            Self::Revoke => "revoke <plugin> <cap>    forget a permission decision",
            Self::Events => "events                   show event subscriptions",
            Self::Stats => "stats                    show command usage for this session",
            Self::Exit | Self::Quit => "exit | quit              leave the shell",
        }
    }
}

/// Whether the loop keeps going after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Build the permission gate and plugin manager described by `config`.
pub fn build_manager(config: &HostConfig, provider: Arc<dyn DecisionProvider>) -> PluginManager {
    let mut gate = PermissionGate::new(provider)
        .with_policy(config.undeclared_capabilities)
        .with_audit_capacity(config.audit_capacity);
    if let Some(path) = config.ledger_file() {
        gate = gate.with_store(Arc::new(JsonLedgerStore::new(path.to_path_buf())));
    }
    let catalog = native_catalog(config.log_dir.clone(), config.history_capacity);
    PluginManager::new(
        config.plugin_root.clone(),
        Arc::new(DefaultModuleLoader::new(catalog)),
        CommandRegistry::new(),
        EventBus::new(),
        gate,
    )
}

pub struct Shell {
    manager: PluginManager,
    prompt: String,
    out: Box<dyn Write>,
    usage: UsageTracker,
}

impl Shell {
    /// Takes a manager that has not been started yet and reserves the
    /// built-in names in its registry.
    pub fn new(mut manager: PluginManager, prompt: impl Into<String>, out: Box<dyn Write>) -> Self {
        manager
            .registry_mut()
            .reserve(BUILTIN_OWNER, Builtin::iter().map(<&'static str>::from));
        Self {
            manager,
            prompt: prompt.into(),
            out,
            usage: UsageTracker::new(),
        }
    }

    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// Load every plugin. A core plugin that fails is fatal.
    pub fn start(&mut self) -> anyhow::Result<StartupReport> {
        let report = self.manager.start()?;
        for failure in &report.failed {
            self.say(&format!(
                "plugin {} failed to load: {}",
                failure.name, failure.error
            ));
        }
        if report.is_fatal() {
            let names: Vec<&str> = report
                .core_failures()
                .iter()
                .map(|f| f.name.as_str())
                .collect();
            anyhow::bail!("core plugin failed to load: {}", names.join(", "));
        }
        self.manager.bus().publish(
            events::SHELL_STARTED,
            json!({ "plugins": report.loaded }),
        );
        Ok(report)
    }

    /// Read lines until `exit` or end of input. With a poll interval, changed
    /// plugins are reloaded whenever the input is idle that long.
    pub fn run(&mut self, input: &Receiver<String>, poll: Option<Duration>) {
        loop {
            self.show_prompt();
            let line = match poll {
                Some(interval) => self.wait_for_line(input, interval),
                None => input.recv().ok(),
            };
            let Some(line) = line else {
                self.say("");
                break;
            };
            if self.execute(&line) == Flow::Exit {
                break;
            }
        }
    }

    fn wait_for_line(&mut self, input: &Receiver<String>, interval: Duration) -> Option<String> {
        loop {
            match input.recv_timeout(interval) {
                Ok(line) => return Some(line),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.poll_changes().is_empty() {
                        self.show_prompt();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Run each line in turn, stopping early at `exit`.
    pub fn run_script(&mut self, lines: &[String]) -> Flow {
        for line in lines {
            if self.execute(line) == Flow::Exit {
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    /// Reload plugins whose units changed and report them.
    pub fn poll_changes(&mut self) -> Vec<String> {
        let reloaded = self.manager.poll_changes();
        for name in &reloaded {
            match self.manager.last_error(name) {
                Some(error) => {
                    let line = format!("\nplugin {name} changed but failed to reload: {error}");
                    self.say(&line);
                }
                None => self.say(&format!("\nplugin {name} reloaded")),
            }
        }
        reloaded
    }

    pub fn execute(&mut self, line: &str) -> Flow {
        let outcome = self.manager.dispatch(line);
        match &outcome {
            DispatchOutcome::Builtin { command, .. }
            | DispatchOutcome::Completed { command, .. }
            | DispatchOutcome::Failed { command, .. } => self.usage.record(command),
            _ => {}
        }
        match outcome {
            DispatchOutcome::Builtin { command, args } => match Builtin::from_str(&command) {
                Ok(builtin) => return self.builtin(builtin, &args),
                Err(_) => warn!(command = %command, "reserved name without a built-in"),
            },
            outcome => {
                if let Some(text) = outcome.render() {
                    self.say(&text);
                }
            }
        }
        Flow::Continue
    }

    /// Unload everything, most recent first.
    pub fn shutdown(&mut self) {
        self.manager
            .bus()
            .publish(events::SHELL_STOPPING, json!({}));
        let order = self.manager.shutdown();
        info!(plugins = order.len(), "shell stopped");
    }

    fn builtin(&mut self, builtin: Builtin, args: &[String]) -> Flow {
        let first = args.first().map(String::as_str);
        match builtin {
            Builtin::Help => self.help(),
            Builtin::Plugins => self.plugins(),
            Builtin::Load => self.with_plugin_arg(builtin, first, |shell, name| {
                shell.manager.rescan()?;
                shell.manager.load(name)?;
                Ok(format!("loaded {name}"))
            }),
            Builtin::Unload => self.with_plugin_arg(builtin, first, |shell, name| {
                shell.manager.unload(name)?;
                Ok(format!("unloaded {name}"))
            }),
            Builtin::Reload => match first {
                Some(name) => {
                    let result = self.manager.reload(name);
                    match result {
                        Ok(()) => self.say(&format!("reloaded {name}")),
                        Err(err) => self.say(&format!("error: {err}")),
                    }
                }
                None => {
                    if self.poll_changes().is_empty() {
                        self.say("no plugin changed");
                    }
                }
            },
            Builtin::Rescan => self.rescan(),
            Builtin::Grants => self.grants(first == Some("audit")),
            Builtin::Revoke => self.revoke(args),
            Builtin::Events => self.events(),
            Builtin::Stats => {
                let text = self.usage.stats().render();
                self.say(&text);
            }
            Builtin::Exit | Builtin::Quit => return Flow::Exit,
        }
        Flow::Continue
    }

    fn with_plugin_arg<F>(&mut self, builtin: Builtin, name: Option<&str>, f: F)
    where
        F: FnOnce(&mut Self, &str) -> dockev_plugin::Result<String>,
    {
        let Some(name) = name else {
            self.say(&format!("usage: {}", builtin.usage()));
            return;
        };
        match f(self, name) {
            Ok(text) => self.say(&text),
            Err(err) => self.say(&format!("error: {err}")),
        }
    }

    fn help(&mut self) {
        let mut lines = vec!["built-in commands:".to_string()];
        for builtin in Builtin::iter().filter(|b| *b != Builtin::Quit) {
            lines.push(format!("  {}", builtin.usage()));
        }
        let plugin_commands: Vec<(String, String)> = self
            .manager
            .registry()
            .list()
            .into_iter()
            .filter(|(_, owner)| owner != BUILTIN_OWNER)
            .collect();
        if !plugin_commands.is_empty() {
            lines.push("plugin commands:".to_string());
            for (name, owner) in plugin_commands {
                lines.push(format!("  {name:<24} ({owner})"));
            }
        }
        self.say(&lines.join("\n"));
    }

    fn plugins(&mut self) {
        let statuses = self.manager.list();
        if statuses.is_empty() {
            let root = self.manager.plugin_root().display().to_string();
            self.say(&format!("no plugins in {root}"));
            return;
        }
        let mut lines = Vec::new();
        for status in statuses {
            let name = &status.name;
            let state = status.state.to_string();
            let kind = status.kind.to_string();
            let version = &status.version;
            let mut line = format!("{name:<18} {state:<10} {kind:<9} {version:<8}");
            if !status.commands.is_empty() {
                line.push_str(&status.commands.join(", "));
            }
            if let Some(error) = &status.error {
                line.push_str(&format!("\n    {error}"));
            }
            lines.push(line.trim_end().to_string());
        }
        self.say(&lines.join("\n"));
    }

    fn rescan(&mut self) {
        let added = match self.manager.rescan() {
            Ok(added) => added,
            Err(err) => {
                self.say(&format!("error: {err}"));
                return;
            }
        };
        if added.is_empty() {
            self.say("no new plugins");
            return;
        }
        for name in added {
            match self.manager.load(&name) {
                Ok(()) => self.say(&format!("loaded {name}")),
                Err(err) => self.say(&format!("error: {err}")),
            }
        }
    }

    fn grants(&mut self, audit: bool) {
        let gate = self.manager.gate().clone();
        let lines: Vec<String> = if audit {
            gate.audit_entries()
                .into_iter()
                .map(|e| {
                    let reason = e.reason.unwrap_or_default();
                    format!(
                        "{} {} {} {} {reason}",
                        e.timestamp, e.plugin, e.capability, e.decision
                    )
                    .trim_end()
                    .to_string()
                })
                .collect()
        } else {
            gate.grants()
                .into_iter()
                .map(|g| format!("{:<18} {:<18} {}", g.plugin, g.capability.to_string(), g.state))
                .collect()
        };
        if lines.is_empty() {
            self.say("no permission decisions yet");
        } else {
            self.say(&lines.join("\n"));
        }
    }

    fn revoke(&mut self, args: &[String]) {
        let [plugin, capability] = args else {
            self.say(&format!("usage: {}", Builtin::Revoke.usage()));
            return;
        };
        let Ok(capability) = Capability::from_str(capability) else {
            let known: Vec<String> = Capability::iter().map(|c| c.as_ref().to_string()).collect();
            self.say(&format!(
                "unknown capability '{capability}' (one of: {})",
                known.join(", ")
            ));
            return;
        };
        let previous = self.manager.gate().revoke(plugin, capability);
        self.say(&format!("revoked {plugin}/{capability} (was {previous})"));
    }

    fn events(&mut self) {
        let patterns = self.manager.bus().patterns();
        if patterns.is_empty() {
            self.say("no subscriptions");
            return;
        }
        let lines: Vec<String> = patterns
            .into_iter()
            .map(|(pattern, count)| format!("{pattern:<24} {count}"))
            .collect();
        self.say(&lines.join("\n"));
    }

    fn show_prompt(&mut self) {
        let _ = write!(self.out, "{}", self.prompt);
        let _ = self.out.flush();
    }

    fn say(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaffold::scaffold;
    use dockev_plugin::PluginState;
    use dockev_security::AutoDeny;
    use dockev_security::Decision;
    use dockev_security::GrantState;
    use dockev_security::ScriptedDecisions;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Output(Arc<Mutex<Vec<u8>>>);

    impl Output {
        fn take(&self) -> String {
            let mut buf = self.0.lock().unwrap();
            let text = String::from_utf8(buf.clone()).unwrap();
            buf.clear();
            text
        }
    }

    impl Write for Output {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn config(root: &TempDir) -> HostConfig {
        HostConfig {
            plugin_root: root.path().join("plugins"),
            log_dir: None,
            ledger_path: None,
            persist_ledger: false,
            ..Default::default()
        }
    }

    fn shell(root: &TempDir, provider: Arc<dyn DecisionProvider>) -> (Shell, Output) {
        let config = config(root);
        scaffold(&config.plugin_root).unwrap();
        let out = Output::default();
        let shell = Shell::new(
            build_manager(&config, provider),
            config.prompt.clone(),
            Box::new(out.clone()),
        );
        (shell, out)
    }

    #[test]
    fn test_builtin_names_are_reserved() {
        let root = TempDir::new().unwrap();
        let (shell, _) = shell(&root, Arc::new(AutoDeny));
        for builtin in Builtin::iter() {
            assert_eq!(
                shell.manager().registry().reserved_owner(builtin.as_ref()),
                Some(BUILTIN_OWNER)
            );
        }
    }

    #[test]
    fn test_start_and_dispatch() {
        let root = TempDir::new().unwrap();
        let (mut shell, out) = shell(&root, Arc::new(AutoDeny));
        let report = shell.start().unwrap();
        assert_eq!(report.loaded.len(), 3);

        assert_eq!(shell.execute("hello Ada"), Flow::Continue);
        assert_eq!(out.take(), "Hello, Ada!\n");

        shell.execute("nope");
        assert_eq!(out.take(), "unknown command: nope (try 'help')\n");

        shell.execute("");
        assert_eq!(out.take(), "");

        assert_eq!(shell.execute("quit"), Flow::Exit);
        assert_eq!(shell.execute("ex"), Flow::Exit);
    }

    #[test]
    fn test_help_and_plugins() {
        let root = TempDir::new().unwrap();
        let (mut shell, out) = shell(&root, Arc::new(AutoDeny));
        shell.start().unwrap();

        shell.execute("help");
        let help = out.take();
        assert!(help.contains("built-in commands:"));
        assert!(help.contains("hello"));
        assert!(help.contains("(shell_assistant)"));

        shell.execute("plugins");
        let listing = out.take();
        assert!(listing.contains("system_log"));
        assert!(listing.contains("active"));
        assert!(listing.contains("core"));
    }

    #[test]
    fn test_unload_load_and_reload() {
        let root = TempDir::new().unwrap();
        let (mut shell, out) = shell(&root, Arc::new(AutoDeny));
        shell.start().unwrap();

        shell.execute("unload sample");
        assert_eq!(out.take(), "unloaded sample\n");
        shell.execute("hello");
        assert!(out.take().starts_with("unknown command"));

        shell.execute("load sample");
        assert_eq!(out.take(), "loaded sample\n");
        shell.execute("reload sample");
        assert_eq!(out.take(), "reloaded sample\n");

        shell.execute("unload ghost");
        assert_eq!(out.take(), "error: unknown plugin: ghost\n");
        shell.execute("load");
        assert!(out.take().starts_with("usage: load"));
    }

    #[test]
    fn test_changed_unit_is_reloaded_on_poll() {
        let root = TempDir::new().unwrap();
        let (mut shell, out) = shell(&root, Arc::new(AutoDeny));
        shell.start().unwrap();
        shell.execute("reload");
        assert_eq!(out.take(), "no plugin changed\n");

        let sample = root.path().join("plugins/sample.toml");
        std::fs::write(
            &sample,
            "[register]\ncommands = [{ name = \"hello\", reply = \"howdy\" }]\n[unregister]\n",
        )
        .unwrap();
        assert_eq!(shell.poll_changes(), vec!["sample"]);
        assert_eq!(out.take(), "\nplugin sample reloaded\n");
        shell.execute("hello");
        assert_eq!(out.take(), "howdy\n");
        assert!(shell.manager().registry().entry("time").is_none());

        std::fs::write(&sample, "[register]\n").unwrap();
        shell.execute("reload");
        assert!(out.take().contains("failed to reload"));
        assert_eq!(shell.manager().state("sample"), Some(PluginState::Failed));
    }

    #[test]
    fn test_rescan_loads_new_units() {
        let root = TempDir::new().unwrap();
        let (mut shell, out) = shell(&root, Arc::new(AutoDeny));
        shell.start().unwrap();
        std::fs::write(
            root.path().join("plugins/extra.toml"),
            "[register]\ncommands = [{ name = \"ping\", reply = \"pong\" }]\n[unregister]\n",
        )
        .unwrap();

        shell.execute("rescan");
        assert_eq!(out.take(), "loaded extra\n");
        shell.execute("ping");
        assert_eq!(out.take(), "pong\n");
        shell.execute("rescan");
        assert_eq!(out.take(), "no new plugins\n");
    }

    #[test]
    fn test_grants_and_revoke() {
        let root = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedDecisions::new([Decision::Granted]));
        let (mut shell, out) = shell(&root, provider);
        shell.start().unwrap();

        shell.execute("grants");
        assert_eq!(out.take(), "no permission decisions yet\n");

        shell.execute("run echo ok");
        assert_eq!(out.take(), "ok\n");
        shell.execute("grants");
        let grants = out.take();
        assert!(grants.contains("shell_assistant"));
        assert!(grants.contains("execute_commands"));
        assert!(grants.contains("granted"));
        shell.execute("grants audit");
        assert!(out.take().contains("run `echo ok`"));

        shell.execute("revoke shell_assistant execute_commands");
        assert_eq!(
            out.take(),
            "revoked shell_assistant/execute_commands (was granted)\n"
        );
        assert_eq!(
            shell
                .manager()
                .gate()
                .state("shell_assistant", Capability::ExecuteCommands),
            GrantState::Unrequested
        );

        shell.execute("revoke shell_assistant flying");
        assert!(out.take().starts_with("unknown capability 'flying'"));
        shell.execute("revoke");
        assert!(out.take().starts_with("usage: revoke"));
    }

    #[test]
    fn test_stats_counts_resolved_commands() {
        let root = TempDir::new().unwrap();
        let (mut shell, out) = shell(&root, Arc::new(AutoDeny));
        shell.start().unwrap();

        for line in ["hello", "hell Ada", "hello", "plugins", "nope", "helo", "", "stats"] {
            shell.execute(line);
        }
        let _ = out.take();
        shell.execute("stats");
        let stats = out.take();
        assert!(stats.starts_with("session time: "), "{stats}");
        assert!(stats.contains("\ncommands used: 3\ntotal commands: 6\n"), "{stats}");
        assert!(stats.ends_with("most used:\n  hello: 3\n  stats: 2\n  plugins: 1\n"), "{stats}");
    }

    #[test]
    fn test_unknown_command_suggests_close_name() {
        let root = TempDir::new().unwrap();
        let (mut shell, out) = shell(&root, Arc::new(AutoDeny));
        shell.start().unwrap();

        shell.execute("helo");
        assert_eq!(out.take(), "unknown command: helo (did you mean 'hello'?)\n");
        shell.execute("relaod sample");
        assert_eq!(out.take(), "unknown command: relaod (did you mean 'reload'?)\n");
    }

    #[test]
    fn test_events_lists_subscriptions() {
        let root = TempDir::new().unwrap();
        let (mut shell, out) = shell(&root, Arc::new(AutoDeny));
        shell.start().unwrap();
        shell.execute("events");
        let listing = out.take();
        assert!(listing.contains("command.failed"));
        assert!(listing.contains("plugin.*"));
    }

    #[test]
    fn test_run_loop_until_end_of_input() {
        let root = TempDir::new().unwrap();
        let (mut shell, out) = shell(&root, Arc::new(AutoDeny));
        shell.start().unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send("hello".to_string()).unwrap();
        drop(tx);
        shell.run(&rx, Some(Duration::from_millis(10)));
        assert_eq!(out.take(), "dockev> Hello, World!\ndockev> \n");

        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send("exit".to_string()).unwrap();
        tx.send("hello".to_string()).unwrap();
        shell.run(&rx, None);
        assert_eq!(out.take(), "dockev> ");

        shell.shutdown();
        assert!(shell.manager().load_order().iter().all(|name| {
            shell.manager().state(name) == Some(PluginState::Unloaded)
        }));
    }

    #[test]
    fn test_core_failure_is_fatal() {
        let root = TempDir::new().unwrap();
        let config = config(&root);
        std::fs::create_dir_all(config.plugin_root.join("broken")).unwrap();
        std::fs::write(
            config.plugin_root.join("broken/plugin.toml"),
            "[plugin]\nkind = \"core\"\nentry = \"missing\"\n",
        )
        .unwrap();
        let out = Output::default();
        let mut shell = Shell::new(
            build_manager(&config, Arc::new(AutoDeny)),
            "> ",
            Box::new(out.clone()),
        );
        let err = shell.start().unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(out.take().contains("plugin broken failed to load"));
    }
}
