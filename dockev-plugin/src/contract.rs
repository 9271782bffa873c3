//! What a plugin implements and what it is handed while registering.

use std::any::Any;

use dockev_security::ScopedPermissions;
use serde_json::Value;

use crate::bus::Event;
use crate::bus::EventBus;
use crate::bus::EventPublisher;
use crate::bus::PublishReport;
use crate::bus::SubscriptionId;
use crate::error::Result;
use crate::registry::CommandHandler;
use crate::registry::CommandRegistry;

/// Opaque value returned by `register` and handed back to `unregister`.
pub type PluginHandle = Box<dyn Any + Send>;

/// The contract every loadable unit fulfils.
///
/// `register` performs all command registration and event subscription and
/// may be called again after `unregister`. `unregister` undoes it and must
/// succeed when nothing is registered. The host removes anything left
/// behind regardless of what `unregister` returns.
pub trait Plugin: Send {
    fn register(
        &mut self,
        bus: &mut PluginBus,
        shell: &mut ShellFacade<'_>,
    ) -> anyhow::Result<PluginHandle>;

    fn unregister(
        &mut self,
        bus: &mut PluginBus,
        shell: &mut ShellFacade<'_>,
        handle: PluginHandle,
    ) -> anyhow::Result<()>;
}

/// A plugin's view of the event bus; every subscription is owned by it.
#[derive(Debug, Clone)]
pub struct PluginBus {
    owner: String,
    bus: EventBus,
}

impl PluginBus {
    pub fn new(owner: &str, bus: EventBus) -> Self {
        Self {
            owner: owner.to_string(),
            bus,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn subscribe<F>(&mut self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(pattern, &self.owner, handler)
    }

    /// Drop one of this plugin's subscriptions. Ids owned by other plugins
    /// are ignored.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let owned = self
            .bus
            .subscriptions_of(&self.owner)
            .iter()
            .any(|s| s.id == id);
        owned && self.bus.unsubscribe(id)
    }

    pub fn unsubscribe_all(&mut self) -> usize {
        self.bus.unsubscribe_all(&self.owner)
    }

    pub fn publish(&self, name: &str, payload: Value) -> PublishReport {
        self.bus.publish_from(&self.owner, name, payload)
    }

    /// A handle command closures can keep for publishing later.
    pub fn publisher(&self) -> EventPublisher {
        self.bus.publisher(&self.owner)
    }
}

/// The slice of the shell a plugin may touch.
pub struct ShellFacade<'a> {
    owner: String,
    registry: &'a mut CommandRegistry,
    permissions: ScopedPermissions,
}

impl std::fmt::Debug for ShellFacade<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellFacade")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl<'a> ShellFacade<'a> {
    pub fn new(
        owner: &str,
        registry: &'a mut CommandRegistry,
        permissions: ScopedPermissions,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            registry,
            permissions,
        }
    }

    pub fn register_command(&mut self, name: &str, handler: CommandHandler) -> Result<()> {
        self.registry.register(name, handler, &self.owner)
    }

    pub fn unregister_command(&mut self, name: &str) -> Result<()> {
        self.registry.unregister(name, &self.owner)
    }

    /// Permission view bound to this plugin.
    pub fn permissions(&self) -> ScopedPermissions {
        self.permissions.clone()
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}
