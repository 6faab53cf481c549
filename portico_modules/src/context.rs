use crate::*;

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{any::Any, collections::HashMap, sync::Arc};

/// Supplies each module's startup parameters.
///
/// Consulted before every load and reload, so that a reload sees edited
/// settings. An error fails the load.
pub trait ConfigProvider: Send + Sync {
    fn module_config(&self, name: &str) -> anyhow::Result<Option<Value>>;
}

/// A provider for hosts with no module configuration at all.
pub struct NoModuleConfig;

impl ConfigProvider for NoModuleConfig {
    fn module_config(&self, _name: &str) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }
}

impl ConfigProvider for HashMap<String, Value> {
    fn module_config(&self, name: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.get(name).cloned())
    }
}

/// What a module's lifecycle callbacks get to work with.
pub struct ModuleContext<'a> {
    registry: &'a ModuleRegistry,
    record: &'a Arc<ModuleRecord>,
    config: Option<Value>,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(
        registry: &'a ModuleRegistry,
        record: &'a Arc<ModuleRecord>,
        config: Option<Value>,
    ) -> Self {
        Self {
            registry,
            record,
            config,
        }
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// A handle on the module being loaded, for listeners and connection
    /// handlers to take references with.
    pub fn handle(&self) -> ModuleHandle {
        self.registry.handle_for(self.record)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        self.registry
    }

    /// Raw configuration for this module, if the host has any.
    pub fn config(&self) -> Option<&Value> {
        self.config.as_ref()
    }

    /// Deserialise this module's configuration, falling back to the type's
    /// default when there is none.
    pub fn parse_config<T: DeserializeOwned + Default>(&self) -> Result<T, ModuleError> {
        match &self.config {
            None => Ok(T::default()),
            Some(value) => T::deserialize(value).map_err(|e| ModuleError::Config {
                name: self.name().to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Shared services the host made available to modules.
    pub fn host<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.registry.host()?.downcast_ref()
    }

    /// Declare a dependency on another module, loading it if necessary.
    ///
    /// The returned reference keeps the other module loaded, and must be handed
    /// back through [`unrequire_module`](Self::unrequire_module) during this
    /// module's unload, most recently required first.
    pub fn require_module(&self, name: &str) -> Result<ModuleRef, ModuleError> {
        let name = normalize_module_name(name);

        let handle = match self.registry.state_of(name) {
            Some(ModuleState::Running) => self.registry.handle(name),
            None | Some(ModuleState::Registered) => {
                tracing::debug!(module = %self.name(), dependency = %name, "loading required module");
                self.registry.load(name)?;
                self.registry.handle(name)
            }
            // Loading here means a dependency cycle; the other states are
            // transient and the caller can retry.
            Some(state) => {
                return Err(ModuleError::Busy {
                    name: name.to_string(),
                    state,
                })
            }
        }
        .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

        let module_ref = handle
            .acquire()
            .ok_or_else(|| ModuleError::NotRunning(name.to_string()))?;

        self.record.add_dependency(name);
        tracing::debug!(module = %self.name(), dependency = %name, "acquired dependency");
        Ok(module_ref)
    }

    /// Release a dependency acquired with [`require_module`](Self::require_module).
    pub fn unrequire_module(&self, module_ref: ModuleRef) {
        self.record.remove_dependency(module_ref.name());
        tracing::debug!(module = %self.name(), dependency = %module_ref.name(), "released dependency");
        module_ref.release();
    }
}
