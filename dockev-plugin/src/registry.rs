use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::error::PluginError;
use crate::error::Result;

/// Arguments passed to a command handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInput {
    pub name: String,
    pub args: Vec<String>,
}

/// A command implementation. Returns the text to show, if any.
pub type CommandHandler =
    Arc<dyn Fn(&CommandInput) -> anyhow::Result<Option<String>> + Send + Sync>;

/// Wrap a closure as a [`CommandHandler`].
pub fn command_handler<F>(f: F) -> CommandHandler
where
    F: Fn(&CommandInput) -> anyhow::Result<Option<String>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One registered command.
#[derive(Clone)]
pub struct CommandEntry {
    pub name: String,
    pub owner: String,
    pub handler: CommandHandler,
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Name to handler table with per-owner accounting.
///
/// Reserved names belong to the host; they appear in [`list`](Self::list)
/// and [`complete`](Self::complete) but have no handler here.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    entries: BTreeMap<String, CommandEntry>,
    reserved: BTreeMap<String, String>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `names` for `owner` so no plugin can register them.
    pub fn reserve<'a>(&mut self, owner: &str, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            self.reserved.insert(name.to_string(), owner.to_string());
        }
    }

    pub fn reserved_owner(&self, name: &str) -> Option<&str> {
        self.reserved.get(name).map(String::as_str)
    }

    /// Add or replace a command. Replacing is allowed only for the same owner.
    pub fn register(&mut self, name: &str, handler: CommandHandler, owner: &str) -> Result<()> {
        validate_name(name)?;
        if let Some(reserved_by) = self.reserved.get(name) {
            return Err(PluginError::DuplicateCommand {
                name: name.to_string(),
                owner: reserved_by.clone(),
            });
        }
        if let Some(existing) = self.entries.get(name) {
            if existing.owner != owner {
                return Err(PluginError::DuplicateCommand {
                    name: name.to_string(),
                    owner: existing.owner.clone(),
                });
            }
        }
        self.entries.insert(
            name.to_string(),
            CommandEntry {
                name: name.to_string(),
                owner: owner.to_string(),
                handler,
            },
        );
        Ok(())
    }

    /// Remove a command owned by `owner`. Absent names are a no-op.
    pub fn unregister(&mut self, name: &str, owner: &str) -> Result<()> {
        match self.entries.get(name) {
            None => Ok(()),
            Some(entry) if entry.owner != owner => Err(PluginError::NotOwner {
                name: name.to_string(),
                owner: entry.owner.clone(),
                caller: owner.to_string(),
            }),
            Some(_) => {
                self.entries.remove(name);
                Ok(())
            }
        }
    }

    /// Remove every command of `owner`, returning the removed names.
    pub fn unregister_owner(&mut self, owner: &str) -> Vec<String> {
        let names = self.owned_by(owner);
        for name in &names {
            self.entries.remove(name);
        }
        names
    }

    pub fn resolve(&self, name: &str) -> Result<CommandHandler> {
        self.entries
            .get(name)
            .map(|entry| Arc::clone(&entry.handler))
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    pub fn entry(&self, name: &str) -> Option<&CommandEntry> {
        self.entries.get(name)
    }

    /// `(name, owner)` pairs sorted by name, reserved names included.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut all: Vec<(String, String)> = self
            .entries
            .values()
            .map(|e| (e.name.clone(), e.owner.clone()))
            .chain(
                self.reserved
                    .iter()
                    .map(|(name, owner)| (name.clone(), owner.clone())),
            )
            .collect();
        all.sort();
        all
    }

    pub fn owned_by(&self, owner: &str) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.owner == owner)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Sorted command names starting with `prefix`.
    pub fn complete(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .keys()
            .chain(self.reserved.keys())
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The known name closest to a mistyped `word`, if any scores at least
    /// [`SUGGESTION_CUTOFF`]. Reserved names count.
    pub fn closest(&self, word: &str) -> Option<String> {
        let word = word.to_lowercase();
        let mut best: Option<(f64, &String)> = None;
        for name in self.entries.keys().chain(self.reserved.keys()) {
            let score = similarity(&word, &name.to_lowercase());
            if score < SUGGESTION_CUTOFF {
                continue;
            }
            match best {
                Some((top, _)) if top >= score => {}
                _ => best = Some((score, name)),
            }
        }
        best.map(|(_, name)| name.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        Err(PluginError::InvalidCommandName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Lowest [`similarity`] at which an unknown command gets a suggestion.
pub const SUGGESTION_CUTOFF: f64 = 0.6;

/// Ratcliff/Obershelp similarity in `0.0..=1.0`: twice the number of
/// matching characters over the combined length.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

/// Longest common run, then the same on both sides of it.
fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (mut at_a, mut at_b, mut len) = (0, 0, 0);
    for i in 0..a.len() {
        for j in 0..b.len() {
            let run = a[i..]
                .iter()
                .zip(&b[j..])
                .take_while(|(x, y)| x == y)
                .count();
            if run > len {
                (at_a, at_b, len) = (i, j, run);
            }
        }
    }
    if len == 0 {
        return 0;
    }
    len + matching_chars(&a[..at_a], &b[..at_b])
        + matching_chars(&a[at_a + len..], &b[at_b + len..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reply(text: &'static str) -> CommandHandler {
        command_handler(move |_| Ok(Some(text.to_string())))
    }

    fn call(reg: &CommandRegistry, name: &str) -> Option<String> {
        let handler = reg.resolve(name).unwrap();
        handler(&CommandInput {
            name: name.into(),
            args: vec![],
        })
        .unwrap()
    }

    #[test]
    fn test_register_and_resolve() {
        let mut reg = CommandRegistry::new();
        reg.register("ping", reply("pong"), "net").unwrap();

        assert_eq!(call(&reg, "ping").as_deref(), Some("pong"));
        assert!(matches!(reg.resolve("pong"), Err(PluginError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_rejection_keeps_first() {
        let mut reg = CommandRegistry::new();
        reg.register("x", reply("first"), "a").unwrap();
        let err = reg.register("x", reply("second"), "b").unwrap_err();
        assert!(matches!(
            err,
            PluginError::DuplicateCommand { ref owner, .. } if owner == "a"
        ));
        assert_eq!(call(&reg, "x").as_deref(), Some("first"));
        assert_eq!(reg.entry("x").unwrap().owner, "a");
    }

    #[test]
    fn test_same_owner_replaces() {
        let mut reg = CommandRegistry::new();
        reg.register("x", reply("old"), "a").unwrap();
        reg.register("x", reply("new"), "a").unwrap();
        assert_eq!(call(&reg, "x").as_deref(), Some("new"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_unregister_ownership() {
        let mut reg = CommandRegistry::new();
        reg.register("x", reply("x"), "a").unwrap();

        let err = reg.unregister("x", "b").unwrap_err();
        assert!(matches!(err, PluginError::NotOwner { .. }));
        assert!(reg.resolve("x").is_ok());

        reg.unregister("missing", "b").unwrap();
        reg.unregister("x", "a").unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn test_unregister_owner_and_owned_by() {
        let mut reg = CommandRegistry::new();
        reg.register("b", reply("b"), "p1").unwrap();
        reg.register("a", reply("a"), "p1").unwrap();
        reg.register("c", reply("c"), "p2").unwrap();

        assert_eq!(reg.owned_by("p1"), vec!["a", "b"]);
        assert_eq!(reg.unregister_owner("p1"), vec!["a", "b"]);
        assert_eq!(reg.list(), vec![("c".to_string(), "p2".to_string())]);
        assert!(reg.unregister_owner("p1").is_empty());
    }

    #[test]
    fn test_reserved_names() {
        let mut reg = CommandRegistry::new();
        reg.reserve("shell", ["help", "exit"]);

        let err = reg.register("help", reply("mine"), "plugin").unwrap_err();
        assert!(matches!(
            err,
            PluginError::DuplicateCommand { ref owner, .. } if owner == "shell"
        ));
        assert!(reg.resolve("help").is_err());
        assert_eq!(reg.reserved_owner("exit"), Some("shell"));
        assert_eq!(
            reg.list(),
            vec![
                ("exit".to_string(), "shell".to_string()),
                ("help".to_string(), "shell".to_string()),
            ]
        );
    }

    #[test]
    fn test_complete_prefix() {
        let mut reg = CommandRegistry::new();
        reg.reserve("shell", ["help"]);
        reg.register("hello", reply("h"), "p").unwrap();
        reg.register("history", reply("h"), "p").unwrap();
        reg.register("time", reply("t"), "p").unwrap();

        assert_eq!(reg.complete("he"), vec!["hello", "help"]);
        assert_eq!(reg.complete("hi"), vec!["history"]);
        assert!(reg.complete("zz").is_empty());
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("hello", "hello"), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        assert!((similarity("helo", "hello") - 8.0 / 9.0).abs() < 1e-9);
        assert!(similarity("nope", "help") < SUGGESTION_CUTOFF);
    }

    #[test]
    fn test_closest_includes_reserved_names() {
        let mut reg = CommandRegistry::new();
        reg.register("hello", reply("hi"), "greet").unwrap();
        reg.register("history", reply("h"), "log").unwrap();
        reg.reserve("shell", ["reload"]);

        assert_eq!(reg.closest("helo").as_deref(), Some("hello"));
        assert_eq!(reg.closest("HISTROY").as_deref(), Some("history"));
        assert_eq!(reg.closest("relaod").as_deref(), Some("reload"));
        assert_eq!(reg.closest("zzz"), None);
        assert_eq!(reg.closest(""), None);
    }

    #[test]
    fn test_invalid_names() {
        let mut reg = CommandRegistry::new();
        assert!(matches!(
            reg.register("", reply(""), "p"),
            Err(PluginError::InvalidCommandName(_))
        ));
        assert!(matches!(
            reg.register("two words", reply(""), "p"),
            Err(PluginError::InvalidCommandName(_))
        ));
    }
}
