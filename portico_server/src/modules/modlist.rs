use super::{host_services, stop_module_listener};
use crate::console::describe_module;

use portico_modules::{builtin_module, Module, ModuleContext, ModuleHandle, ModuleRef};
use serde::Deserialize;
use service_listener::{Connection, ListenerSpec};

/// Settings for the `modlist` module.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ModlistConfig {
    pub port: u16,
}

impl Default for ModlistConfig {
    fn default() -> Self {
        Self { port: 7011 }
    }
}

/// Writes the module table to every client that connects.
///
/// Holds a reference on `motd` for as long as it is loaded.
#[derive(Default)]
pub struct ModlistModule {
    port: Option<u16>,
    motd: Option<ModuleRef>,
}

builtin_module!("modlist", ModlistModule::default());

fn send_listing(mut connection: Connection, handle: &ModuleHandle) {
    let mut text = String::new();
    if let Some(registry) = handle.registry() {
        for summary in registry.list_modules() {
            text.push_str(&describe_module(&summary));
            text.push_str("\r\n");
        }
    }
    text.push_str("End of module list\r\n");

    if let Err(e) = connection.send(&text) {
        tracing::debug!(connection = %connection.id, "could not send module list: {}", e);
    }
    connection.close();
}

impl Module for ModlistModule {
    fn name(&self) -> &str {
        "modlist"
    }

    fn description(&self) -> &str {
        "Module listing service"
    }

    fn load(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
        let config: ModlistConfig = ctx.parse_config()?;
        let host = host_services(ctx)?;

        let motd = ctx.require_module("motd")?;

        // Through the weak handle, so the handler doesn't keep the registry alive.
        let handle = ctx.handle();
        let started = host.listeners.start_listener(
            ListenerSpec::new(config.port, "modlist"),
            move |connection| send_listing(connection, &handle),
            Some(ctx.handle()),
        );

        match started {
            Ok(info) => {
                self.port = Some(info.port());
                self.motd = Some(motd);
                Ok(())
            }
            Err(e) => {
                ctx.unrequire_module(motd);
                Err(e.into())
            }
        }
    }

    fn unload(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
        stop_module_listener(ctx, self.port.take())?;
        if let Some(motd) = self.motd.take() {
            ctx.unrequire_module(motd);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::*;
    use portico_modules::ModuleState;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    fn settings() -> HashMap<String, Value> {
        HashMap::from([
            ("motd".to_string(), json!({ "port": 0 })),
            ("modlist".to_string(), json!({ "port": 0 })),
        ])
    }

    #[test]
    fn lists_modules_and_holds_motd() {
        let host = loopback_host();
        let registry = registry(&host, settings());
        registry.load("modlist").unwrap();

        assert_eq!(registry.state_of("motd"), Some(ModuleState::Running));
        assert!(registry.unload("motd").unwrap_err().is_in_use());

        let mut client = connect(port_of(&host, "modlist"));
        let listing = read_rest(&mut client);
        let lines: Vec<&str> = listing.split("\r\n").collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("modlist "));
        assert!(lines[1].starts_with("motd "));
        assert!(lines[1].contains("in use (1 refs)"));
        assert_eq!(lines[2], "End of module list");

        wait_for_idle(&host);
        registry.unload("modlist").unwrap();
        registry.unload("motd").unwrap();
        assert!(host.listeners.list_listeners().is_empty());
    }

    #[test]
    fn shutdown_unloads_dependents_first() {
        let host = loopback_host();
        let registry = registry(&host, settings());
        registry.load("motd").unwrap();
        registry.load("modlist").unwrap();

        assert_eq!(registry.unload_all(), Vec::<String>::new());
        assert!(registry.list_modules().is_empty());
    }
}
