use super::{host_services, stop_module_listener};

use portico_modules::{builtin_module, Module, ModuleContext};
use serde::Deserialize;
use service_listener::{
    Connection, DelimitedReader, IpFilter, ListenerSpec, ReadError, ReadOutcome, MAX_LISTENER_PORTS,
};
use std::{io::Write, sync::Arc};

/// Settings for the `echo` module.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EchoConfig {
    /// One to three ports, all speaking the same protocol.
    pub ports: Vec<u16>,
    pub service: String,
    pub delimiter: String,
    /// How long a client may stay silent before it is disconnected; negative
    /// waits forever.
    pub idle_timeout_ms: i32,
    pub buffer_size: usize,
    pub allow: Option<IpFilter>,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            ports: vec![7007],
            service: "echo".to_string(),
            delimiter: "\n".to_string(),
            idle_timeout_ms: 60_000,
            buffer_size: 1024,
            allow: None,
        }
    }
}

/// Echoes every delimited record back to the client.
#[derive(Default)]
pub struct EchoModule {
    port: Option<u16>,
}

builtin_module!("echo", EchoModule::default());

fn serve(mut connection: Connection, settings: &EchoConfig) {
    let delimiter = settings.delimiter.as_bytes();
    let mut reader = DelimitedReader::new(
        vec![0u8; settings.buffer_size],
        delimiter,
        settings.idle_timeout_ms,
    );

    loop {
        match reader.read_one(&connection) {
            Ok(ReadOutcome::Record(_)) => {
                let mut reply = reader.record().to_vec();
                reply.extend_from_slice(delimiter);
                if let Err(e) = connection.write_all(&reply) {
                    tracing::debug!(connection = %connection.id, "echo write failed: {}", e);
                    break;
                }
            }
            Ok(ReadOutcome::TimedOut) => {
                let _ = connection.send("Idle timeout\r\n");
                break;
            }
            Ok(ReadOutcome::Closed) => break,
            Err(ReadError::BufferExhausted { capacity }) => {
                let _ = connection.send(&format!("Line longer than {} bytes\r\n", capacity));
                break;
            }
            Err(e) => {
                tracing::debug!(connection = %connection.id, "echo read failed: {}", e);
                break;
            }
        }
    }

    connection.close();
}

impl Module for EchoModule {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Line echo service"
    }

    fn load(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
        let config: EchoConfig = ctx.parse_config()?;
        if config.delimiter.is_empty() {
            anyhow::bail!("echo delimiter can't be empty");
        }
        if config.ports.is_empty() || config.ports.len() > MAX_LISTENER_PORTS {
            anyhow::bail!(
                "echo needs between 1 and {} ports, got {}",
                MAX_LISTENER_PORTS,
                config.ports.len()
            );
        }

        let mut spec = ListenerSpec::new(config.ports[0], config.service.clone());
        for port in &config.ports[1..] {
            spec = spec.with_port(*port, config.service.clone());
        }
        if let Some(allow) = &config.allow {
            spec = spec.allow(allow.clone());
        }

        let host = host_services(ctx)?;
        let settings = Arc::new(config);
        let info = host.listeners.start_listener(
            spec,
            move |connection| serve(connection, &settings),
            Some(ctx.handle()),
        )?;

        self.port = Some(info.port());
        Ok(())
    }

    fn unload(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
        stop_module_listener(ctx, self.port.take())
    }
}
