use crate::*;
use crate::internal::*;

use portico_modules::ModuleHandle;

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, TcpListener},
    sync::Arc,
    time::Duration,
};

/// Settings shared by every listener in a collection.
#[derive(Clone,Debug)]
pub struct ListenerSettings
{
    /// Address every listening socket binds to.
    pub bind_address: IpAddr,
    /// How long each accept thread waits in `poll` before checking whether it
    /// has been asked to stop.
    pub poll_interval: Duration,
}

impl Default for ListenerSettings
{
    fn default() -> Self
    {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// The set of network listeners registered by modules, keyed by port.
///
/// A listener serving several ports is reachable through any of them.
pub struct ListenerCollection
{
    settings: ListenerSettings,
    listener_id_generator: ListenerIdGenerator,
    listeners: Mutex<HashMap<u16, Arc<Listener>>>,
}

impl ListenerCollection
{
    pub fn new(settings: ListenerSettings) -> Self
    {
        Self {
            settings,
            listener_id_generator: ListenerIdGenerator::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ListenerSettings
    {
        &self.settings
    }

    /// Listen on the ports in `spec`, passing each accepted connection to
    /// `handler` on a new thread.
    ///
    /// Either every port is bound or none is. While `owner` is given, each
    /// connection holds a reference to that module for as long as its
    /// handler runs.
    pub fn start_listener(
            &self,
            spec: ListenerSpec,
            handler: impl Fn(Connection) + Send + Sync + 'static,
            owner: Option<ModuleHandle>,
        ) -> Result<ListenerInfo, ListenerError>
    {
        self.add_listener(spec, ListenerHandler::Raw(Arc::new(handler)), owner)
    }

    /// As [`start_listener`](Self::start_listener), but each connection is
    /// wrapped in a [`Session`] and passed through `handshake` first. If the
    /// handshake fails the session is closed and `handler` never sees it.
    pub fn start_listener_with_handshake(
            &self,
            spec: ListenerSpec,
            handshake: impl Fn(&mut Session) -> Result<(), ConnectionError> + Send + Sync + 'static,
            handler: impl Fn(Session) + Send + Sync + 'static,
            owner: Option<ModuleHandle>,
        ) -> Result<ListenerInfo, ListenerError>
    {
        let handler = ListenerHandler::Handshake {
            handshake: Arc::new(handshake),
            handler: Arc::new(handler),
        };
        self.add_listener(spec, handler, owner)
    }

    fn add_listener(&self, spec: ListenerSpec, handler: ListenerHandler, owner: Option<ModuleHandle>) -> Result<ListenerInfo, ListenerError>
    {
        let count = spec.ports.len();
        if count == 0 || count > MAX_LISTENER_PORTS
        {
            return Err(ListenerError::InvalidPortCount(count));
        }

        {
            let listeners = self.listeners.lock();
            if let Some(taken) = spec.ports.iter().find(|p| p.port != 0 && listeners.contains_key(&p.port))
            {
                return Err(ListenerError::PortInUse(taken.port));
            }
        }

        // Leaving early drops, and so closes, whatever was bound so far.
        let mut sockets = Vec::with_capacity(count);
        let mut ports = Vec::with_capacity(count);
        for requested in &spec.ports
        {
            let socket = socket::make_tcp_socket(self.settings.bind_address, requested.port)
                .map_err(|source| ListenerError::Bind { port: requested.port, source })?;
            socket.set_nonblocking(true)?;
            let port = socket.local_addr()?.port();

            sockets.push(socket);
            ports.push(ServicePort::new(port, requested.service.clone()));
        }

        let mut listeners = self.listeners.lock();

        let id = self.listener_id_generator.next();
        let listener = Arc::new(Listener::start(AcceptLoop {
            id,
            sockets,
            ports: ports.clone(),
            allow: spec.allow,
            handler,
            owner,
            poll_interval: self.settings.poll_interval,
        })?);

        for port in &ports
        {
            listeners.insert(port.port, Arc::clone(&listener));
        }

        tracing::info!(listener = %id, ports = ?ports, owner = ?listener.info().owner, "started listener");
        Ok(listener.info())
    }

    /// Stop the listener serving `port`, and every other port it serves.
    ///
    /// Returns once its accept thread has finished, handing back the
    /// listening sockets, still open. Dropping them closes them. Connections
    /// already accepted are unaffected.
    pub fn stop_listener(&self, port: u16) -> Result<Vec<TcpListener>, ListenerError>
    {
        let listener = self.listeners.lock().get(&port).cloned().ok_or(ListenerError::NotListening(port))?;

        if listener.is_accept_thread()
        {
            return Err(ListenerError::StopFromAcceptThread(port));
        }

        self.listeners.lock().retain(|_, l| !Arc::ptr_eq(l, &listener));

        let sockets = listener.stop()?;
        tracing::info!(listener = %listener.id, ports = ?listener.ports, "stopped listener");
        Ok(sockets)
    }

    /// Stop every listener, closing their sockets. Returns how many there were.
    pub fn stop_all(&self) -> usize
    {
        let first_ports: Vec<u16> = self.list_listeners().iter().map(ListenerInfo::port).collect();

        let mut stopped = 0;
        for port in first_ports
        {
            match self.stop_listener(port)
            {
                Ok(_sockets) => stopped += 1,
                Err(e) => tracing::warn!(port, "error stopping listener: {}", e),
            }
        }
        stopped
    }

    /// A snapshot of every listener, in the order they were started.
    pub fn list_listeners(&self) -> Vec<ListenerInfo>
    {
        let mut seen: Vec<Arc<Listener>> = Vec::new();
        for listener in self.listeners.lock().values()
        {
            if !seen.iter().any(|l| Arc::ptr_eq(l, listener))
            {
                seen.push(Arc::clone(listener));
            }
        }

        let mut infos: Vec<ListenerInfo> = seen.iter().map(|l| l.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

impl Drop for ListenerCollection
{
    fn drop(&mut self)
    {
        self.stop_all();
    }
}
