//! Service modules compiled into the host.
//!
//! Each registers itself with `builtin_module!`, so `StaticLoader::new()`
//! finds it without further wiring.

use crate::Host;

use anyhow::anyhow;
use portico_modules::ModuleContext;

mod echo;
pub use echo::{EchoConfig, EchoModule};

mod motd;
pub use motd::{MotdConfig, MotdModule};

mod modlist;
pub use modlist::{ModlistConfig, ModlistModule};

pub(crate) fn host_services<'a>(ctx: &'a ModuleContext<'_>) -> anyhow::Result<&'a Host> {
    ctx.host::<Host>()
        .ok_or_else(|| anyhow!("module {} needs the host's listener services", ctx.name()))
}

// Stop the listener a module registered, if it registered one.
pub(crate) fn stop_module_listener(ctx: &ModuleContext<'_>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port {
        let host = host_services(ctx)?;
        drop(host.listeners.stop_listener(port)?);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::Host;

    use portico_modules::{ConfigProvider, ModuleRegistry, StaticLoader};
    use service_listener::ListenerSettings;
    use std::{
        io::{BufRead, BufReader, Read},
        net::{IpAddr, Ipv4Addr, TcpStream},
        sync::Arc,
        time::{Duration, Instant},
    };

    pub fn loopback_host() -> Arc<Host> {
        Arc::new(Host::new(
            "test.portico",
            ListenerSettings {
                bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                poll_interval: Duration::from_millis(20),
            },
        ))
    }

    pub fn registry(host: &Arc<Host>, config: impl ConfigProvider + 'static) -> ModuleRegistry {
        ModuleRegistry::builder()
            .loader(StaticLoader::new())
            .config_provider(config)
            .host(Arc::clone(host))
            .build()
    }

    pub fn port_of(host: &Host, module: &str) -> u16 {
        host.listeners
            .list_listeners()
            .iter()
            .find(|info| info.owner.as_deref() == Some(module))
            .map(|info| info.port())
            .unwrap()
    }

    /// Wait for every connection thread to finish, and so to release its
    /// module reference.
    pub fn wait_for_idle(host: &Host) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while host.listeners.list_listeners().iter().any(|info| info.connections > 0) {
            assert!(Instant::now() < deadline, "connections still open");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn connect(port: u16) -> BufReader<TcpStream> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        BufReader::new(stream)
    }

    pub fn read_line(client: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        client.read_line(&mut line).unwrap();
        line
    }

    pub fn read_rest(client: &mut BufReader<TcpStream>) -> String {
        let mut text = String::new();
        let _ = client.read_to_string(&mut text);
        text
    }
}
