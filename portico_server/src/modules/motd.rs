use super::{host_services, stop_module_listener};

use anyhow::Context;
use parking_lot::RwLock;
use portico_modules::{builtin_module, Module, ModuleContext};
use serde::Deserialize;
use service_listener::{ConnectionError, DelimitedReader, ListenerSpec, ReadOutcome, Session};
use std::{io::Write, path::PathBuf, sync::Arc};

/// Settings for the `motd` module.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MotdConfig {
    pub port: u16,
    /// The message itself, used when no `file` is set.
    pub message: Option<String>,
    /// Read the message from this file instead.
    pub file: Option<PathBuf>,
    pub handshake_timeout_ms: i32,
}

impl Default for MotdConfig {
    fn default() -> Self {
        Self {
            port: 7010,
            message: None,
            file: None,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl MotdConfig {
    fn read_message(&self, server_name: &str) -> anyhow::Result<String> {
        match (&self.file, &self.message) {
            (Some(file), _) => std::fs::read_to_string(file)
                .with_context(|| format!("reading message of the day from {}", file.display())),
            (None, Some(message)) => Ok(message.clone()),
            (None, None) => Ok(format!("Welcome to {}", server_name)),
        }
    }
}

/// Sends the message of the day to clients that pass a line-ending check.
///
/// Reconfiguring re-reads the message; the port only changes on reload.
#[derive(Default)]
pub struct MotdModule {
    port: Option<u16>,
    message: Arc<RwLock<String>>,
}

builtin_module!("motd", MotdModule::default());

impl MotdModule {
    fn refresh(&self, ctx: &ModuleContext<'_>) -> anyhow::Result<MotdConfig> {
        let host = host_services(ctx)?;
        let config: MotdConfig = ctx.parse_config()?;
        *self.message.write() = config.read_message(&host.server_name)?;
        Ok(config)
    }
}

// Greet the client and insist on a CRLF-terminated reply.
fn handshake(session: &mut Session, server_name: &str, timeout_ms: i32) -> Result<(), ConnectionError> {
    session.connection_mut().send(&format!("{} motd service ready\r\n", server_name))?;

    let mut reader = DelimitedReader::new([0u8; 512], b"\n", timeout_ms);
    match reader.read_one(&*session)? {
        ReadOutcome::Record(_) if reader.record().ends_with(b"\r") => Ok(()),
        ReadOutcome::Record(_) => {
            session.connection_mut().send("Lines must end with CRLF\r\n")?;
            Err(ConnectionError::Handshake("line not terminated with CRLF".to_string()))
        }
        ReadOutcome::TimedOut => Err(ConnectionError::TimedOut),
        ReadOutcome::Closed => Err(ConnectionError::Closed),
    }
}

fn send_message(mut session: Session, message: &RwLock<String>) {
    let mut text = String::new();
    for line in message.read().lines() {
        text.push_str(line);
        text.push_str("\r\n");
    }

    if let Err(e) = session.write_all(text.as_bytes()) {
        tracing::debug!(connection = %session.id(), "could not send motd: {}", e);
    }
    session.close();
}

impl Module for MotdModule {
    fn name(&self) -> &str {
        "motd"
    }

    fn description(&self) -> &str {
        "Message of the day"
    }

    fn load(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
        let host = host_services(ctx)?;
        let config = self.refresh(ctx)?;

        let server_name = host.server_name.clone();
        let timeout_ms = config.handshake_timeout_ms;
        let message = Arc::clone(&self.message);

        let info = host.listeners.start_listener_with_handshake(
            ListenerSpec::new(config.port, "motd"),
            move |session| handshake(session, &server_name, timeout_ms),
            move |session| send_message(session, &message),
            Some(ctx.handle()),
        )?;

        self.port = Some(info.port());
        Ok(())
    }

    fn reload(&mut self, ctx: &ModuleContext<'_>) -> Option<anyhow::Result<()>> {
        Some(self.refresh(ctx).map(|_| ()))
    }

    fn unload(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
        stop_module_listener(ctx, self.port.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::FileConfigProvider, modules::test_support::*};
    use pretty_assertions::assert_eq;

    fn write_settings(path: &std::path::Path, message: &str) {
        let text = format!(
            "{{ modules: {{ settings: {{ motd: {{ port: 0, message: {:?}, \"handshake-timeout-ms\": 2000 }} }} }} }}",
            message
        );
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn handshake_gates_the_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portico.json5");
        write_settings(&path, "Hello\nand welcome");

        let host = loopback_host();
        let registry = registry(&host, FileConfigProvider::new(&path));
        registry.load("motd").unwrap();
        let port = port_of(&host, "motd");

        let mut client = connect(port);
        assert_eq!(read_line(&mut client), "test.portico motd service ready\r\n");
        client.get_mut().write_all(b"HELLO\r\n").unwrap();
        assert_eq!(read_rest(&mut client), "Hello\r\nand welcome\r\n");

        let mut sloppy = connect(port);
        read_line(&mut sloppy);
        sloppy.get_mut().write_all(b"HELLO\n").unwrap();
        assert_eq!(read_rest(&mut sloppy), "Lines must end with CRLF\r\n");

        wait_for_idle(&host);
        registry.unload("motd").unwrap();
    }

    #[test]
    fn reconfigure_rereads_the_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portico.json5");
        write_settings(&path, "before");

        let host = loopback_host();
        let registry = registry(&host, FileConfigProvider::new(&path));
        registry.load("motd").unwrap();
        let port = port_of(&host, "motd");

        write_settings(&path, "after");
        registry.reconfigure("motd").unwrap();
        assert_eq!(port_of(&host, "motd"), port);

        let mut client = connect(port);
        read_line(&mut client);
        client.get_mut().write_all(b"HELLO\r\n").unwrap();
        assert_eq!(read_rest(&mut client), "after\r\n");

        wait_for_idle(&host);
        registry.unload("motd").unwrap();
    }

    #[test]
    fn unreadable_message_file_fails_the_load() {
        let host = loopback_host();
        let registry = registry(
            &host,
            std::collections::HashMap::from([(
                "motd".to_string(),
                serde_json::json!({ "port": 0, "file": "/nonexistent/motd.txt" }),
            )]),
        );

        assert!(registry.load("motd").is_err());
        assert!(host.listeners.list_listeners().is_empty());
    }
}
