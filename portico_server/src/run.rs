use crate::{
    config::{FileConfigProvider, ServerConfig},
    console::ConsoleServer,
    Host,
};

use anyhow::Context;
use portico_modules::{DynamicLoader, ModuleRegistry, StaticLoader};
use service_listener::socket::make_unix_socket;
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    net::UnixListener,
    signal::unix::{signal, SignalKind},
    task,
};
use tracing_subscriber::util::SubscriberInitExt;

fn build_registry(config_path: &Path, config: &ServerConfig, host: &Arc<Host>) -> ModuleRegistry {
    let mut builder = ModuleRegistry::builder().loader(StaticLoader::new());
    if let Some(directory) = &config.modules.directory {
        builder = builder.loader(DynamicLoader::new(directory));
    }
    builder
        .config_provider(FileConfigProvider::new(config_path))
        .host(Arc::clone(host))
        .build()
}

fn open_console(config: &ServerConfig) -> anyhow::Result<UnixListener> {
    let console = &config.console;
    let socket = make_unix_socket(&console.path, console.mode, console.uid, console.gid)
        .with_context(|| format!("creating console socket {}", console.path.display()))?;
    socket.set_nonblocking(true)?;
    Ok(UnixListener::from_std(socket)?)
}

// The async entry point. Because `run_server` can fork into the background
// depending on options, the tokio runtime is only created after that.
async fn do_run_server(config_path: PathBuf, config: ServerConfig) -> anyhow::Result<()> {
    crate::tracing_config::build_subscriber(config.log.clone())?.init();

    tracing::info!(server = %config.server_name, "starting");

    let host = Host::from_config(&config);
    let registry = build_registry(&config_path, &config, &host);

    let mut console = ConsoleServer::start(open_console(&config)?, registry.clone(), Arc::clone(&host));

    let plan = config.modules.plan.clone();
    let autoload_registry = registry.clone();
    let started = task::spawn_blocking(move || autoload_registry.load_modules(&plan)).await?;
    tracing::info!(started, listeners = host.listeners.list_listeners().len(), "ready");

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => tracing::info!("got SIGINT"),
        _ = terminate.recv() => tracing::info!("got SIGTERM"),
        _ = console.shutdown_requested() => tracing::info!("shutdown requested from console"),
    }

    console.stop().await;

    let shutdown_host = Arc::clone(&host);
    let (stragglers, stopped) = task::spawn_blocking(move || {
        let stragglers = registry.unload_all();
        (stragglers, shutdown_host.listeners.stop_all())
    })
    .await?;

    if !stragglers.is_empty() {
        tracing::warn!(modules = ?stragglers, "modules still in use at shutdown");
    }
    tracing::info!(stopped_listeners = stopped, "shut down");

    if let Err(e) = std::fs::remove_file(&config.console.path) {
        tracing::debug!("could not remove console socket: {}", e);
    }
    Ok(())
}

/// Run the service host.
///
/// Loads a `ServerConfig` from `config_path`, reporting configuration errors
/// before anything else happens. Unless `foreground` is set, the process then
/// daemonises, redirecting standard output and error to the files named in the
/// config's logging section and writing its pid file, if any.
///
/// This function creates its own tokio runtime, and must not be called from
/// within one.
pub fn run_server(config_path: impl AsRef<Path>, foreground: bool) -> anyhow::Result<()> {
    let config_path = config_path.as_ref().to_path_buf();
    let config = ServerConfig::load_file(&config_path)?;

    if !config.log.dir.is_dir() {
        std::fs::create_dir_all(&config.log.dir)
            .with_context(|| format!("creating log directory {}", config.log.dir.display()))?;
    }

    if !foreground {
        let mut daemon = daemonize::Daemonize::new()
            .exit_action(|| println!("Running in background mode"))
            .working_directory(std::env::current_dir()?);

        if let Some(stdout) = &config.log.stdout {
            daemon = daemon.stdout(File::create(config.log.prefix_file(stdout))?);
        }
        if let Some(stderr) = &config.log.stderr {
            daemon = daemon.stderr(File::create(config.log.prefix_file(stderr))?);
        }
        if let Some(pidfile) = &config.log.pidfile {
            daemon = daemon.pid_file(config.log.prefix_file(pidfile));
        }

        daemon.start().context("failed to fork to background")?;
    }

    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(do_run_server(config_path, config))
}
