//! Standard plugin that runs shell commands on request and remembers the
//! last failure it saw on the bus.

use std::process::Command;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

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
use tracing::debug;

use crate::plugins::release_commands;

pub const ENTRY: &str = "shell_assistant";

const COMMANDS: [&str; 2] = ["run", "last-error"];

#[derive(Debug, Clone, PartialEq, Eq)]
struct FailedCommand {
    command: String,
    args: Vec<String>,
    error: String,
}

#[derive(Default)]
pub struct ShellAssistant {
    last_failure: Arc<Mutex<Option<FailedCommand>>>,
}

fn run_shell(line: &str) -> anyhow::Result<Option<String>> {
    debug!(line = %line, "running shell command");
    let output = Command::new("sh").arg("-c").arg(line).output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let status = match output.status.code() {
            Some(code) => code.to_string(),
            None => "signal".to_string(),
        };
        if stderr.is_empty() {
            anyhow::bail!("exit status {status}");
        }
        anyhow::bail!("exit status {status}: {stderr}");
    }
    Ok((!stdout.is_empty()).then_some(stdout))
}

impl Plugin for ShellAssistant {
    fn register(
        &mut self,
        bus: &mut PluginBus,
        shell: &mut ShellFacade<'_>,
    ) -> anyhow::Result<PluginHandle> {
        let last_failure = Arc::clone(&self.last_failure);
        let subscription = bus.subscribe(events::COMMAND_FAILED, move |event: &Event| {
            let text = |key: &str| {
                event
                    .payload
                    .get(key)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let args = event
                .payload
                .get("args")
                .and_then(serde_json::Value::as_array)
                .map(|args| {
                    args.iter()
                        .filter_map(|a| a.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            *last_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(FailedCommand {
                command: text("command"),
                args,
                error: text("error"),
            });
            Ok(())
        });

        let permissions = shell.permissions();
        shell.register_command(
            "run",
            command_handler(move |input| {
                if input.args.is_empty() {
                    anyhow::bail!("usage: run <command...>");
                }
                let line = input.args.join(" ");
                if !permissions.ensure(Capability::ExecuteCommands, &format!("run `{line}`")) {
                    let denied = PermissionDenied {
                        plugin: permissions.plugin().to_string(),
                        capability: Capability::ExecuteCommands,
                    };
                    return Ok(Some(denied.to_string()));
                }
                run_shell(&line)
            }),
        )?;

        let last_failure = Arc::clone(&self.last_failure);
        shell.register_command(
            "last-error",
            command_handler(move |_| {
                let last = last_failure.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(failure) = last.as_ref() else {
                    return Ok(Some("no failed command yet".to_string()));
                };
                let mut line = failure.command.clone();
                for arg in &failure.args {
                    line.push(' ');
                    line.push_str(arg);
                }
                Ok(Some(format!("{line}\n  {}", failure.error)))
            }),
        )?;

        Ok(Box::new(subscription))
    }

    fn unregister(
        &mut self,
        bus: &mut PluginBus,
        shell: &mut ShellFacade<'_>,
        handle: PluginHandle,
    ) -> anyhow::Result<()> {
        if let Ok(subscription) = handle.downcast::<SubscriptionId>() {
            bus.unsubscribe(*subscription);
        }
        release_commands(shell, &COMMANDS);
        Ok(())
    }
}
