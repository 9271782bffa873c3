pub mod bus;
pub mod contract;
pub mod descriptor;
pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod script;

// Re-export key types for convenience.
pub use bus::{
    Event, EventBus, EventHandler, EventPublisher, PublishReport, SubscriptionId,
    SubscriptionInfo, events,
};
pub use contract::{Plugin, PluginBus, PluginHandle, ShellFacade};
pub use descriptor::{EntryKind, MANIFEST_FILE, ManifestHeader, PluginDescriptor, PluginKind};
pub use error::{PluginError, Result};
pub use lifecycle::{LifecycleEvent, LifecycleTracker, PluginState};
pub use loader::{
    DefaultModuleLoader, Fingerprint, ModuleLoader, NativeCatalog, NativeFactory, changed,
    discover, import_unit, refresh,
};
pub use manager::{
    ActivePlugin, DispatchOutcome, PluginManager, PluginStatus, StartupFailure, StartupReport,
};
pub use registry::{CommandEntry, CommandHandler, CommandInput, CommandRegistry, command_handler};
pub use script::ScriptPlugin;
