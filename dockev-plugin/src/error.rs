use crate::lifecycle::PluginState;

/// Boxed cause carried by [`PluginError::LoadError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by plugin discovery, loading, and registration.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin '{plugin}' does not expose `{missing}`")]
    InvalidContract {
        plugin: String,
        missing: &'static str,
    },

    #[error("command '{name}' is already registered by '{owner}'")]
    DuplicateCommand { name: String, owner: String },

    #[error("command '{name}' belongs to '{owner}', not '{caller}'")]
    NotOwner {
        name: String,
        owner: String,
        caller: String,
    },

    #[error("command not found: {0}")]
    NotFound(String),

    #[error("invalid command name: {0:?}")]
    InvalidCommandName(String),

    #[error("plugin '{plugin}' depends on unavailable plugin '{dependency}'")]
    DependencyUnavailable { plugin: String, dependency: String },

    #[error("failed to load plugin '{plugin}': {source}")]
    LoadError {
        plugin: String,
        #[source]
        source: BoxError,
    },

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("plugin '{plugin}' cannot go from {from} to {to}")]
    InvalidTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("invalid manifest {path}: {message}")]
    Manifest { path: String, message: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    pub fn load(plugin: &str, source: impl Into<BoxError>) -> Self {
        Self::LoadError {
            plugin: plugin.to_string(),
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
