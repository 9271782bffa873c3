//! Core plugin that keeps a running history of what happened in the shell.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use chrono::Local;
use dockev_plugin::Event;
use dockev_plugin::Plugin;
use dockev_plugin::PluginBus;
use dockev_plugin::PluginHandle;
use dockev_plugin::ShellFacade;
use dockev_plugin::SubscriptionId;
use dockev_plugin::command_handler;
use dockev_plugin::events;
use dockev_security::Capability;
use dockev_security::PermissionDenied;
use serde::Deserialize;

use crate::logging;
use crate::plugins::count_arg;
use crate::plugins::release_commands;

pub const ENTRY: &str = "system_log";

const COMMANDS: [&str; 2] = ["history", "logs"];
const DEFAULT_COUNT: usize = 20;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SystemLogConfig {
    history_capacity: Option<usize>,
}

type History = Arc<Mutex<VecDeque<String>>>;

pub struct SystemLog {
    log_dir: Option<PathBuf>,
    capacity: usize,
    history: History,
}

impl SystemLog {
    pub fn new(log_dir: Option<PathBuf>, capacity: usize) -> Self {
        Self {
            log_dir,
            capacity: capacity.max(1),
            history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// The manifest's `[config]` may override the history size.
    pub fn from_config(
        log_dir: Option<PathBuf>,
        capacity: usize,
        config: &toml::Table,
    ) -> anyhow::Result<Self> {
        let config: SystemLogConfig = toml::Value::Table(config.clone()).try_into()?;
        Ok(Self::new(
            log_dir,
            config.history_capacity.unwrap_or(capacity),
        ))
    }
}

fn describe(event: &Event) -> String {
    let field = |key: &str| {
        event
            .payload
            .get(key)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let detail = match event.name.as_str() {
        events::COMMAND_EXECUTED => field("command"),
        events::COMMAND_FAILED => format!("{}: {}", field("command"), field("error")),
        _ => {
            let name = field("name");
            match event.payload.get("error").and_then(serde_json::Value::as_str) {
                Some(error) => format!("{name}: {error}"),
                None => name,
            }
        }
    };
    format!(
        "{} {} {detail}",
        Local::now().format("%H:%M:%S"),
        event.name
    )
}

fn recent(history: &History, n: usize) -> Vec<String> {
    let history = history.lock().unwrap_or_else(PoisonError::into_inner);
    let skip = history.len().saturating_sub(n);
    history.iter().skip(skip).cloned().collect()
}

impl Plugin for SystemLog {
    fn register(
        &mut self,
        bus: &mut PluginBus,
        shell: &mut ShellFacade<'_>,
    ) -> anyhow::Result<PluginHandle> {
        let mut subscriptions = Vec::new();
        for pattern in [events::COMMAND_EXECUTED, events::COMMAND_FAILED, "plugin.*"] {
            let history = Arc::clone(&self.history);
            let capacity = self.capacity;
            subscriptions.push(bus.subscribe(pattern, move |event: &Event| {
                let mut history = history.lock().unwrap_or_else(PoisonError::into_inner);
                if history.len() == capacity {
                    history.pop_front();
                }
                history.push_back(describe(event));
                Ok(())
            }));
        }

        let history = Arc::clone(&self.history);
        shell.register_command(
            "history",
            command_handler(move |input| {
                let n = count_arg(&input.args, DEFAULT_COUNT)?;
                let lines = recent(&history, n);
                if lines.is_empty() {
                    return Ok(Some("no history yet".to_string()));
                }
                Ok(Some(lines.join("\n")))
            }),
        )?;

        let permissions = shell.permissions();
        let log_dir = self.log_dir.clone();
        shell.register_command(
            "logs",
            command_handler(move |input| {
                let n = count_arg(&input.args, DEFAULT_COUNT)?;
                if !permissions.ensure(Capability::ReadLogs, "show recent host log lines") {
                    let denied = PermissionDenied {
                        plugin: permissions.plugin().to_string(),
                        capability: Capability::ReadLogs,
                    };
                    return Ok(Some(denied.to_string()));
                }
                let Some(dir) = &log_dir else {
                    return Ok(Some("file logging is disabled".to_string()));
                };
                let Some(file) = logging::latest_log_file(dir) else {
                    return Ok(Some(format!("no log file in {}", dir.display())));
                };
                Ok(Some(logging::tail(&file, n)?.join("\n")))
            }),
        )?;

        Ok(Box::new(subscriptions))
    }

    fn unregister(
        &mut self,
        bus: &mut PluginBus,
        shell: &mut ShellFacade<'_>,
        handle: PluginHandle,
    ) -> anyhow::Result<()> {
        if let Ok(subscriptions) = handle.downcast::<Vec<SubscriptionId>>() {
            for id in *subscriptions {
                bus.unsubscribe(id);
            }
        }
        release_commands(shell, &COMMANDS);
        Ok(())
    }
}
