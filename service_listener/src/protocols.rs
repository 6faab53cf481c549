use crate::*;

use serde::{Serialize,Deserialize};
use std::sync::Arc;

/// Most ports a single listener may serve.
pub const MAX_LISTENER_PORTS: usize = 3;

/// One port of a listener, and the name of the service spoken on it.
#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub struct ServicePort
{
    pub port: u16,
    pub service: String,
}

impl ServicePort
{
    pub fn new(port: u16, service: impl Into<String>) -> Self
    {
        Self { port, service: service.into() }
    }
}

/// What a module asks the listener collection to listen on.
///
/// Cooperating ports, such as a plain and an implicit-TLS port for the same
/// protocol, share one handler and one accept thread.
#[derive(Clone,Debug)]
pub struct ListenerSpec
{
    pub ports: Vec<ServicePort>,
    pub allow: Option<IpFilter>,
}

impl ListenerSpec
{
    pub fn new(port: u16, service: impl Into<String>) -> Self
    {
        Self { ports: vec![ServicePort::new(port, service)], allow: None }
    }

    pub fn with_port(mut self, port: u16, service: impl Into<String>) -> Self
    {
        self.ports.push(ServicePort::new(port, service));
        self
    }

    /// Only accept connections from addresses the filter permits.
    pub fn allow(mut self, filter: IpFilter) -> Self
    {
        self.allow = Some(filter);
        self
    }
}

/// Takes over an accepted connection. Runs on the connection's own thread.
pub type ConnectionHandler = Arc<dyn Fn(Connection) + Send + Sync>;

/// Runs first on a new session; an error ends the session before the main
/// handler sees it.
pub type HandshakeHandler = Arc<dyn Fn(&mut Session) -> Result<(), ConnectionError> + Send + Sync>;

/// Takes over a session whose handshake succeeded.
pub type SessionHandler = Arc<dyn Fn(Session) + Send + Sync>;

#[derive(Clone)]
pub(crate) enum ListenerHandler
{
    Raw(ConnectionHandler),
    Handshake
    {
        handshake: HandshakeHandler,
        handler: SessionHandler,
    },
}

/// A snapshot of one running listener.
#[derive(Clone,Debug,PartialEq,Eq,Serialize)]
pub struct ListenerInfo
{
    pub id: ListenerId,
    /// Ports as actually bound, so a requested port 0 shows the one assigned.
    pub ports: Vec<ServicePort>,
    pub owner: Option<String>,
    pub connections: usize,
    /// False once the accept loop has ended on a fatal error.
    pub accepting: bool,
}

impl ListenerInfo
{
    /// The first port, which identifies the listener to
    /// [`ListenerCollection::stop_listener`].
    pub fn port(&self) -> u16
    {
        self.ports[0].port
    }
}
