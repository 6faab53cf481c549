use crate::*;

use portico_modules::{ModuleHandle, ModuleRef};

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

struct ConnectionCount(Arc<AtomicUsize>);

impl ConnectionCount
{
    fn new(count: &Arc<AtomicUsize>) -> Self
    {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for ConnectionCount
{
    fn drop(&mut self)
    {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One accepted connection and the handler that will serve it.
pub(crate) struct ConnectionTask
{
    connection: Connection,
    handler: ListenerHandler,
    module_ref: Option<ModuleRef>,
    _count: ConnectionCount,
}

impl ConnectionTask
{
    /// Start serving `connection` on a thread of its own. While it is served
    /// the owning module stays referenced; if the module is already going
    /// away the connection is closed instead.
    pub fn spawn(connection: Connection, handler: &ListenerHandler, owner: Option<&ModuleHandle>, connections: &Arc<AtomicUsize>)
    {
        let module_ref = match owner
        {
            Some(owner) => match owner.acquire()
            {
                Some(module_ref) => Some(module_ref),
                None => {
                    tracing::info!(module = %owner.name(), connection = %connection.id, "module is not running, refusing connection");
                    connection.close();
                    return;
                }
            },
            None => None,
        };

        let task = Self {
            connection,
            handler: handler.clone(),
            module_ref,
            _count: ConnectionCount::new(connections),
        };

        let name = format!("conn-{}", task.connection.id);
        if let Err(e) = thread::Builder::new().name(name).spawn(move || task.run())
        {
            tracing::error!("Error starting connection thread: {}", e);
        }
    }

    fn run(self)
    {
        let Self { connection, handler, module_ref, _count } = self;
        let id = connection.id;
        tracing::debug!(connection = %id, service = %connection.service, remote = %connection.remote_addr, "connection started");

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            match &handler
            {
                ListenerHandler::Raw(handle) => handle(connection),
                ListenerHandler::Handshake { handshake, handler } => {
                    let mut session = Session::new(connection);
                    match handshake(&mut session)
                    {
                        Ok(()) => handler(session),
                        Err(e) => {
                            tracing::info!(connection = %id, "handshake failed: {}", e);
                            session.close();
                        }
                    }
                }
            }
        }));
        if result.is_err()
        {
            tracing::error!(connection = %id, "connection handler panicked");
        }

        // The handler may be code from the module's shared library, so it has
        // to go before the reference that keeps the library loaded.
        drop(handler);
        drop(module_ref);
        tracing::debug!(connection = %id, "connection finished");
    }
}
