pub mod cli_args;
pub mod config;
pub mod logging;
pub mod plugins;
pub mod prompt;
pub mod scaffold;
pub mod shell;
pub mod usage;

pub use cli_args::ArgsValidationError;
pub use cli_args::DockevCliArgs;
pub use config::ConfigError;
pub use config::HostConfig;
pub use prompt::TerminalPrompt;
pub use shell::Builtin;
pub use shell::Flow;
pub use shell::Shell;
pub use shell::build_manager;
