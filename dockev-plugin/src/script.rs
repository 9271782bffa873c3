//! Declarative plugins described entirely by their manifest.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::bus::SubscriptionId;
use crate::contract::Plugin;
use crate::contract::PluginBus;
use crate::contract::PluginHandle;
use crate::contract::ShellFacade;
use crate::error::PluginError;
use crate::error::Result;
use crate::registry::CommandInput;
use crate::registry::command_handler;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptCommand {
    pub name: String,
    pub reply: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptSubscription {
    pub event: String,
    pub log: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RegisterSection {
    commands: Vec<ScriptCommand>,
    subscribe: Vec<ScriptSubscription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct UnregisterSection {
    log: Option<String>,
}

/// What a script plugin registered, handed back on unregister.
#[derive(Debug, Default)]
struct ScriptHandle {
    commands: Vec<String>,
    subscriptions: Vec<SubscriptionId>,
}

/// A plugin whose `register` and `unregister` bodies are manifest tables.
#[derive(Debug, Clone)]
pub struct ScriptPlugin {
    name: String,
    commands: Vec<ScriptCommand>,
    subscriptions: Vec<ScriptSubscription>,
    unregister_log: Option<String>,
}

impl ScriptPlugin {
    /// Build from a parsed manifest. Both `[register]` and `[unregister]`
    /// must be present.
    pub fn from_manifest(name: &str, manifest: &toml::Table, path: &Path) -> Result<Self> {
        let register: RegisterSection = section(manifest, "register", name, path)?;
        let unregister: UnregisterSection = section(manifest, "unregister", name, path)?;
        Ok(Self {
            name: name.to_string(),
            commands: register.commands,
            subscriptions: register.subscribe,
            unregister_log: unregister.log,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn commands(&self) -> &[ScriptCommand] {
        &self.commands
    }
}

fn section<T: serde::de::DeserializeOwned>(
    manifest: &toml::Table,
    key: &'static str,
    plugin: &str,
    path: &Path,
) -> Result<T> {
    let value = manifest
        .get(key)
        .ok_or_else(|| PluginError::InvalidContract {
            plugin: plugin.to_string(),
            missing: key,
        })?;
    value
        .clone()
        .try_into()
        .map_err(|e: toml::de::Error| PluginError::Manifest {
            path: path.display().to_string(),
            message: format!("[{key}]: {}", e.message()),
        })
}

impl Plugin for ScriptPlugin {
    fn register(
        &mut self,
        bus: &mut PluginBus,
        shell: &mut ShellFacade<'_>,
    ) -> anyhow::Result<PluginHandle> {
        let mut handle = ScriptHandle::default();
        for command in &self.commands {
            let template = command.reply.clone();
            shell.register_command(
                &command.name,
                command_handler(move |input| Ok(Some(render_reply(&template, input)))),
            )?;
            handle.commands.push(command.name.clone());
        }
        for sub in &self.subscriptions {
            let template = sub.log.clone();
            let plugin = self.name.clone();
            let id = bus.subscribe(&sub.event, move |event| {
                let line = render_payload(&template, &event.payload);
                info!(plugin = %plugin, event = %event.name, "{line}");
                Ok(())
            });
            handle.subscriptions.push(id);
        }
        Ok(Box::new(handle))
    }

    fn unregister(
        &mut self,
        bus: &mut PluginBus,
        shell: &mut ShellFacade<'_>,
        handle: PluginHandle,
    ) -> anyhow::Result<()> {
        if let Ok(handle) = handle.downcast::<ScriptHandle>() {
            for id in handle.subscriptions {
                bus.unsubscribe(id);
            }
            for name in &handle.commands {
                shell.unregister_command(name)?;
            }
        }
        if let Some(log) = &self.unregister_log {
            info!(plugin = %self.name, "{log}");
        }
        Ok(())
    }
}

/// Expand `{placeholder}` tokens. `{{` and `}}` are literal braces;
/// `{key:default}` falls back to `default` when `lookup` has no value;
/// unknown keys without a default are left as written.
pub fn render(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            continue;
        }
        let Some(end) = tail.find('}') else {
            out.push_str(tail);
            rest = "";
            break;
        };
        let token = &tail[1..end];
        let (key, default) = match token.split_once(':') {
            Some((key, default)) => (key, Some(default)),
            None => (token, None),
        };
        match (lookup(key), default) {
            (Some(value), _) => out.push_str(&value),
            (None, Some(default)) => out.push_str(default),
            (None, None) => out.push_str(&tail[..=end]),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Render a command reply: `{0}`, `{1}`, `{args}`, `{argc}` and `{now}`.
pub fn render_reply(template: &str, input: &CommandInput) -> String {
    render(template, |key| match key {
        "args" => Some(input.args.join(" ")),
        "argc" => Some(input.args.len().to_string()),
        "now" => Some(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()),
        "command" => Some(input.name.clone()),
        _ => key
            .parse::<usize>()
            .ok()
            .and_then(|i| input.args.get(i).cloned()),
    })
}

/// Render a subscription log line from top-level payload fields.
pub fn render_payload(template: &str, payload: &serde_json::Value) -> String {
    render(template, |key| match payload.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn input(args: &[&str]) -> CommandInput {
        CommandInput {
            name: "hello".into(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_positional_and_default() {
        assert_eq!(
            render_reply("Hello, {0:World}!", &input(&[])),
            "Hello, World!"
        );
        assert_eq!(
            render_reply("Hello, {0:World}!", &input(&["Ada"])),
            "Hello, Ada!"
        );
        assert_eq!(render_reply("{1}", &input(&["a", "b"])), "b");
    }

    #[test]
    fn test_args_and_argc() {
        assert_eq!(
            render_reply("{argc}: {args}", &input(&["x", "y", "z"])),
            "3: x y z"
        );
        assert_eq!(render_reply("[{args}]", &input(&[])), "[]");
    }

    #[test]
    fn test_unknown_and_escaped_tokens_kept() {
        assert_eq!(render_reply("{mystery}", &input(&[])), "{mystery}");
        assert_eq!(render_reply("{{0}} {0:-}", &input(&[])), "{0} -");
        assert_eq!(render_reply("open {brace", &input(&[])), "open {brace");
        assert_eq!(render_reply("close } brace", &input(&[])), "close } brace");
    }

    #[test]
    fn test_now_shape() {
        let out = render_reply("{now}", &input(&[]));
        assert_eq!(out.len(), "2024-01-01 00:00:00".len());
        assert_eq!(&out[4..5], "-");
    }

    #[test]
    fn test_payload_fields() {
        let payload = json!({"name": "sample", "count": 2, "gone": null});
        assert_eq!(
            render_payload("saw {name} x{count} {gone:none}", &payload),
            "saw sample x2 none"
        );
        assert_eq!(render_payload("{name}", &json!("scalar")), "{name}");
    }

    #[test]
    fn test_from_manifest_contract() {
        let path = Path::new("s.toml");
        let ok: toml::Table = "[register]\ncommands = [{ name = \"hi\", reply = \"yo\" }]\n[unregister]\n"
            .parse()
            .unwrap();
        let plugin = ScriptPlugin::from_manifest("s", &ok, path).unwrap();
        assert_eq!(plugin.commands().len(), 1);
        assert_eq!(plugin.name(), "s");

        let no_unregister: toml::Table = "[register]\n".parse().unwrap();
        let err = ScriptPlugin::from_manifest("s", &no_unregister, path).unwrap_err();
        assert!(matches!(
            err,
            PluginError::InvalidContract {
                missing: "unregister",
                ..
            }
        ));

        let no_register: toml::Table = "[unregister]\n".parse().unwrap();
        let err = ScriptPlugin::from_manifest("s", &no_register, path).unwrap_err();
        assert!(matches!(
            err,
            PluginError::InvalidContract {
                missing: "register",
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_section_is_manifest_error() {
        let bad: toml::Table = "[register]\ncommands = [{ name = 1 }]\n[unregister]\n"
            .parse()
            .unwrap();
        let err = ScriptPlugin::from_manifest("s", &bad, Path::new("s.toml")).unwrap_err();
        assert!(matches!(err, PluginError::Manifest { .. }));
    }
}
