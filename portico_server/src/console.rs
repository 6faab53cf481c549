//! The operator console.
//!
//! A line protocol on a Unix domain socket. Each command line gets zero or
//! more lines of output, then `OK` or `ERR <reason>`.

use crate::Host;

use portico_modules::{ModuleRegistry, ModuleSummary, ReloadOutcome};
use service_listener::ListenerInfo;
use std::{str::FromStr, sync::Arc};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    select,
    sync::{broadcast, mpsc},
    task,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Modules,
    Listeners,
    Load(String),
    Unload(String),
    Reload(String),
    /// Reload now, or as soon as the module is no longer referenced.
    QuickReload(String),
    Reconfigure(String),
    Help,
    Shutdown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command {0}; try help")]
    Unknown(String),
    #[error("Usage: {0} <module>")]
    MissingModule(&'static str),
    #[error("Too many arguments to {0}")]
    TooManyArguments(&'static str),
}

impl FromStr for ConsoleCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandError::Empty)?.to_ascii_lowercase();
        let arg = words.next().map(str::to_string);
        let extra = words.next().is_some();

        let (command, name): (fn(String) -> Self, &'static str) = match verb.as_str() {
            "load" => (Self::Load, "load"),
            "unload" => (Self::Unload, "unload"),
            "reload" => (Self::Reload, "reload"),
            "qreload" => (Self::QuickReload, "qreload"),
            "reconfigure" => (Self::Reconfigure, "reconfigure"),
            bare => {
                let command = match bare {
                    "modules" => Self::Modules,
                    "listeners" => Self::Listeners,
                    "help" => Self::Help,
                    "shutdown" => Self::Shutdown,
                    other => return Err(CommandError::Unknown(other.to_string())),
                };
                if arg.is_some() {
                    return Err(CommandError::TooManyArguments(command.verb()));
                }
                return Ok(command);
            }
        };

        if extra {
            return Err(CommandError::TooManyArguments(name));
        }
        arg.map(command).ok_or(CommandError::MissingModule(name))
    }
}

impl ConsoleCommand {
    fn verb(&self) -> &'static str {
        match self {
            Self::Modules => "modules",
            Self::Listeners => "listeners",
            Self::Load(_) => "load",
            Self::Unload(_) => "unload",
            Self::Reload(_) => "reload",
            Self::QuickReload(_) => "qreload",
            Self::Reconfigure(_) => "reconfigure",
            Self::Help => "help",
            Self::Shutdown => "shutdown",
        }
    }
}

/// The output of one console command.
#[derive(Debug, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub outcome: Result<(), String>,
}

impl Reply {
    fn ok(lines: Vec<String>) -> Self {
        Self {
            lines,
            outcome: Ok(()),
        }
    }

    fn err(reason: impl ToString) -> Self {
        Self {
            lines: Vec::new(),
            outcome: Err(reason.to_string()),
        }
    }

    pub fn render(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        match &self.outcome {
            Ok(()) => text.push_str("OK\n"),
            Err(reason) => {
                text.push_str("ERR ");
                text.push_str(reason);
                text.push('\n');
            }
        }
        text
    }
}

/// One line of a module listing.
pub fn describe_module(summary: &ModuleSummary) -> String {
    let mut line = format!(
        "{:<12} {:<16} {}",
        summary.name,
        summary.status().to_string(),
        summary.description
    );
    if summary.listeners > 0 {
        line.push_str(&format!(" [{} listener(s)]", summary.listeners));
    }
    if !summary.dependencies.is_empty() {
        line.push_str(&format!(" (requires {})", summary.dependencies.join(", ")));
    }
    line
}

fn describe_listener(info: &ListenerInfo) -> String {
    let ports: Vec<String> = info
        .ports
        .iter()
        .map(|p| format!("{}/{}", p.port, p.service))
        .collect();
    format!(
        "{} {} owner={} connections={}{}",
        info.id,
        ports.join(","),
        info.owner.as_deref().unwrap_or("-"),
        info.connections,
        if info.accepting { "" } else { " (not accepting)" }
    )
}

const HELP: &[&str] = &[
    "modules              list loaded modules",
    "listeners            list network listeners",
    "load <module>        load a module",
    "unload <module>      unload a module that is not in use",
    "reload <module>      reload a module that is not in use",
    "qreload <module>     reload a module, waiting until it is no longer in use",
    "reconfigure <module> have a module re-read its settings",
    "shutdown             stop the server",
];

/// Run one command. Blocks while modules load or unload.
pub fn execute(command: &ConsoleCommand, registry: &ModuleRegistry, host: &Host) -> Reply {
    match command {
        ConsoleCommand::Modules => {
            let modules = registry.list_modules();
            if modules.is_empty() {
                return Reply::ok(vec!["No modules loaded".to_string()]);
            }
            Reply::ok(modules.iter().map(describe_module).collect())
        }
        ConsoleCommand::Listeners => {
            Reply::ok(host.listeners.list_listeners().iter().map(describe_listener).collect())
        }
        ConsoleCommand::Load(name) => match registry.load(name) {
            Ok(()) => Reply::ok(vec![format!("Loaded {}", name)]),
            Err(e) => Reply::err(e),
        },
        ConsoleCommand::Unload(name) => match registry.unload(name) {
            Ok(()) => Reply::ok(vec![format!("Unloaded {}", name)]),
            Err(e) => Reply::err(e),
        },
        ConsoleCommand::Reload(name) | ConsoleCommand::QuickReload(name) => {
            let try_delayed = matches!(command, ConsoleCommand::QuickReload(_));
            match registry.reload(name, try_delayed) {
                Ok(ReloadOutcome::Reloaded) => Reply::ok(vec![format!("Reloaded {}", name)]),
                Ok(ReloadOutcome::Deferred) => Reply::ok(vec![format!(
                    "{} is in use; it will be reloaded when released",
                    name
                )]),
                Err(e) => Reply::err(e),
            }
        }
        ConsoleCommand::Reconfigure(name) => match registry.reconfigure(name) {
            Ok(()) => Reply::ok(vec![format!("Reconfigured {}", name)]),
            Err(e) => Reply::err(e),
        },
        ConsoleCommand::Help => {
            let mut lines = vec![format!(
                "{}, up {}s",
                host.server_name,
                host.uptime().as_secs()
            )];
            lines.extend(HELP.iter().map(|line| line.to_string()));
            Reply::ok(lines)
        }
        ConsoleCommand::Shutdown => Reply::ok(vec!["Shutting down".to_string()]),
    }
}

/// The console's accept task.
pub struct ConsoleServer {
    shutdown_requests: mpsc::Receiver<()>,
    stop: broadcast::Sender<()>,
    server_task: task::JoinHandle<()>,
}

impl ConsoleServer {
    /// Start serving `listener`. Must be called within a tokio runtime.
    pub fn start(listener: UnixListener, registry: ModuleRegistry, host: Arc<Host>) -> Self {
        let (shutdown_send, shutdown_requests) = mpsc::channel(1);
        let (stop, _) = broadcast::channel(1);

        let server_task = tokio::spawn(Self::accept_loop(
            listener,
            registry,
            host,
            shutdown_send,
            stop.clone(),
        ));

        Self {
            shutdown_requests,
            stop,
            server_task,
        }
    }

    /// Wait for an operator to issue `shutdown`.
    pub async fn shutdown_requested(&mut self) {
        if self.shutdown_requests.recv().await.is_none() {
            // The accept loop is gone; nobody can ask any more.
            std::future::pending::<()>().await;
        }
    }

    /// Close the console and every open console session.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.server_task.await {
            tracing::error!("console task failed: {}", e);
        }
    }

    async fn accept_loop(
        listener: UnixListener,
        registry: ModuleRegistry,
        host: Arc<Host>,
        shutdown_send: mpsc::Sender<()>,
        stop: broadcast::Sender<()>,
    ) {
        let mut stopped = stop.subscribe();
        loop {
            select! {
                _ = stopped.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tracing::debug!("console client connected");
                        tokio::spawn(serve_client(
                            stream,
                            registry.clone(),
                            Arc::clone(&host),
                            shutdown_send.clone(),
                            stop.subscribe(),
                        ));
                    }
                    Err(e) => tracing::warn!("console accept failed: {}", e),
                }
            }
        }
    }
}

async fn serve_client(
    stream: UnixStream,
    registry: ModuleRegistry,
    host: Arc<Host>,
    shutdown_send: mpsc::Sender<()>,
    mut stop: broadcast::Receiver<()>,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = select! {
            _ = stop.recv() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("console read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        tracing::info!(command = %line.trim(), "console command");

        let (reply, shutdown) = match line.parse::<ConsoleCommand>() {
            Ok(command) => {
                let shutdown = command == ConsoleCommand::Shutdown;
                let registry = registry.clone();
                let host = Arc::clone(&host);
                let reply = task::spawn_blocking(move || execute(&command, &registry, &host))
                    .await
                    .unwrap_or_else(|e| Reply::err(format!("command failed: {}", e)));
                (reply, shutdown)
            }
            Err(e) => (Reply::err(e), false),
        };

        if let Err(e) = write.write_all(reply.render().as_bytes()).await {
            tracing::debug!("console write failed: {}", e);
            break;
        }
        if shutdown {
            let _ = shutdown_send.send(()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    fn settings() -> HashMap<String, Value> {
        HashMap::from([
            ("echo".to_string(), json!({ "ports": [0] })),
            ("motd".to_string(), json!({ "port": 0 })),
            ("modlist".to_string(), json!({ "port": 0 })),
        ])
    }

    #[test]
    fn commands_parse() {
        assert_eq!("modules".parse(), Ok(ConsoleCommand::Modules));
        assert_eq!("  LOAD echo ".parse(), Ok(ConsoleCommand::Load("echo".to_string())));
        assert_eq!(
            "qreload motd".parse(),
            Ok(ConsoleCommand::QuickReload("motd".to_string()))
        );
        assert_eq!("".parse::<ConsoleCommand>(), Err(CommandError::Empty));
        assert_eq!("unload".parse::<ConsoleCommand>(), Err(CommandError::MissingModule("unload")));
        assert_eq!(
            "load a b".parse::<ConsoleCommand>(),
            Err(CommandError::TooManyArguments("load"))
        );
        assert_eq!(
            "shutdown now".parse::<ConsoleCommand>(),
            Err(CommandError::TooManyArguments("shutdown"))
        );
        assert_eq!(
            "restart".parse::<ConsoleCommand>(),
            Err(CommandError::Unknown("restart".to_string()))
        );
    }

    #[test]
    fn replies_end_with_a_status_line() {
        assert_eq!(Reply::ok(vec!["a".into(), "b".into()]).render(), "a\nb\nOK\n");
        assert_eq!(Reply::err("no such module").render(), "ERR no such module\n");
    }

    #[test]
    fn module_commands_drive_the_registry() {
        let host = loopback_host();
        let registry = registry(&host, settings());
        let run = |line: &str| execute(&line.parse().unwrap(), &registry, &host);

        assert_eq!(run("modules").lines, vec!["No modules loaded".to_string()]);

        assert_eq!(run("load modlist").outcome, Ok(()));
        let listing = run("modules").lines;
        assert_eq!(listing.len(), 2);
        assert!(listing[0].contains("(requires motd)"));
        assert!(listing[1].contains("in use (1 refs)"));
        assert_eq!(run("listeners").lines.len(), 2);

        assert!(run("unload motd").outcome.unwrap_err().contains("in use"));
        assert!(run("reload motd").outcome.is_err());
        assert_eq!(
            run("qreload motd").lines,
            vec!["motd is in use; it will be reloaded when released".to_string()]
        );
        assert!(run("modules").lines[1].contains("pending reload"));

        assert_eq!(run("reconfigure motd").outcome, Ok(()));
        assert!(run("reconfigure modlist")
            .outcome
            .unwrap_err()
            .contains("no reload handler"));

        assert_eq!(run("unload modlist").outcome, Ok(()));
        assert_eq!(registry.list_modules().len(), 1);
        assert!(!registry.list_modules()[0].pending_reload);
        assert_eq!(run("unload motd").outcome, Ok(()));
        assert!(run("unload motd").outcome.is_err());
        assert!(run("listeners").lines.is_empty());
    }

    async fn send(client: &mut BufReader<UnixStream>, line: &str) -> Vec<String> {
        client.get_mut().write_all(line.as_bytes()).await.unwrap();
        client.get_mut().write_all(b"\n").await.unwrap();

        let mut reply = Vec::new();
        loop {
            let mut text = String::new();
            client.read_line(&mut text).await.unwrap();
            let text = text.trim_end().to_string();
            let last = text == "OK" || text.starts_with("ERR");
            reply.push(text);
            if last {
                return reply;
            }
        }
    }

    #[tokio::test]
    async fn console_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.sock");

        let host = loopback_host();
        let registry = registry(&host, settings());
        let mut console = ConsoleServer::start(
            UnixListener::bind(&path).unwrap(),
            registry.clone(),
            Arc::clone(&host),
        );

        let mut client = BufReader::new(UnixStream::connect(&path).await.unwrap());
        assert_eq!(send(&mut client, "load echo").await, vec!["Loaded echo", "OK"]);
        assert_eq!(send(&mut client, "frobnicate").await, vec!["ERR Unknown command frobnicate; try help"]);
        assert_eq!(send(&mut client, "unload echo").await, vec!["Unloaded echo", "OK"]);
        assert_eq!(send(&mut client, "shutdown").await, vec!["Shutting down", "OK"]);

        console.shutdown_requested().await;
        console.stop().await;

        let mut rest = String::new();
        client.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "");
    }
}
