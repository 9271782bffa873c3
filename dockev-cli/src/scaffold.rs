//! Default plugin units written into a fresh plugin root.

use std::path::Path;
use std::path::PathBuf;

use tracing::info;

const SYSTEM_LOG: &str = r#"[plugin]
kind = "core"
entry = "system_log"
version = "0.1.0"
description = "Keeps a history of commands and plugin events"
"#;

const SHELL_ASSISTANT: &str = r#"[plugin]
entry = "shell_assistant"
version = "0.1.0"
description = "Runs shell commands and reports the last failure"
depends_on = ["system_log"]
capabilities = ["execute_commands", "read_logs"]
"#;

const SAMPLE: &str = r#"[plugin]
version = "0.1.0"
description = "Example declarative plugin; edit me while the shell runs"

[register]
commands = [
    { name = "hello", reply = "Hello, {0:World}!" },
    { name = "time", reply = "{now}" },
]

[unregister]
"#;

const UNITS: [(&str, &str); 3] = [
    ("system_log/plugin.toml", SYSTEM_LOG),
    ("shell_assistant/plugin.toml", SHELL_ASSISTANT),
    ("sample.toml", SAMPLE),
];

/// Write the default units when `root` is missing or empty. Returns the
/// files written; a root with anything in it is left alone.
pub fn scaffold(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    if root.exists() && std::fs::read_dir(root)?.next().is_some() {
        return Ok(Vec::new());
    }
    let mut written = Vec::new();
    for (rel, contents) in UNITS {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        written.push(path);
    }
    info!(root = %root.display(), files = written.len(), "wrote default plugins");
    Ok(written)
}
