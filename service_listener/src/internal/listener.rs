use crate::*;
use crate::internal::*;

use portico_modules::{ListenerHold, ModuleHandle};

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
};
use parking_lot::Mutex;
use std::{
    io,
    net::TcpListener,
    os::unix::io::AsRawFd,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

/// Pause after an accept failure that is expected to clear up by itself,
/// such as running out of descriptors.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything the accept thread needs, moved into it on start.
pub(crate) struct AcceptLoop
{
    pub id: ListenerId,
    pub sockets: Vec<TcpListener>,
    pub ports: Vec<ServicePort>,
    pub allow: Option<IpFilter>,
    pub handler: ListenerHandler,
    pub owner: Option<ModuleHandle>,
    pub poll_interval: Duration,
}

pub(crate) struct Listener
{
    pub id: ListenerId,
    pub ports: Vec<ServicePort>,
    owner: Option<String>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    // Yields the listening sockets back when joined.
    accept_thread: Mutex<Option<JoinHandle<Vec<TcpListener>>>>,
    thread_id: ThreadId,
}

impl Listener
{
    /// Start the accept thread. If that fails the sockets are closed.
    pub fn start(accept: AcceptLoop) -> io::Result<Self>
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));
        let id = accept.id;
        let ports = accept.ports.clone();
        let owner = accept.owner.as_ref().map(|h| h.name().to_string());

        let thread_name = format!("accept-{}", ports.first().map_or(0, |p| p.port));
        let shutdown_flag = Arc::clone(&shutdown);
        let connection_count = Arc::clone(&connections);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || accept.run(shutdown_flag, connection_count))?;

        Ok(Self {
            id,
            ports,
            owner,
            shutdown,
            connections,
            thread_id: handle.thread().id(),
            accept_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn is_accept_thread(&self) -> bool
    {
        thread::current().id() == self.thread_id
    }

    /// Signal the accept loop, wait for it to finish, and take back the
    /// sockets it was using. They are still open.
    pub fn stop(&self) -> Result<Vec<TcpListener>, ListenerError>
    {
        self.shutdown.store(true, Ordering::SeqCst);

        let handle = self.accept_thread.lock().take();
        match handle
        {
            Some(handle) => handle.join().map_err(|_| ListenerError::AcceptThreadPanicked(self.ports[0].port)),
            None => Ok(Vec::new()),
        }
    }

    pub fn info(&self) -> ListenerInfo
    {
        ListenerInfo {
            id: self.id,
            ports: self.ports.clone(),
            owner: self.owner.clone(),
            connections: self.connections.load(Ordering::SeqCst),
            accepting: self.accept_thread.lock().as_ref().map_or(false, |h| !h.is_finished()),
        }
    }
}

impl Drop for Listener
{
    fn drop(&mut self)
    {
        // A listener dropped without being stopped lets its thread wind down
        // on its own.
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn is_transient(e: &io::Error) -> bool
{
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
            | Some(libc::ECONNABORTED) | Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EPROTO)
    ) || matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

impl AcceptLoop
{
    fn run(self, shutdown: Arc<AtomicBool>, connections: Arc<AtomicUsize>) -> Vec<TcpListener>
    {
        let hold: Option<ListenerHold> = self.owner.as_ref().map(ModuleHandle::hold_listener);
        let id_gen = ConnectionIdGenerator::new(self.id, 1);
        let services: Vec<Arc<str>> = self.ports.iter().map(|p| Arc::from(p.service.as_str())).collect();
        let timeout = self.poll_interval.as_millis().min(i32::MAX as u128) as i32;

        let mut fds: Vec<PollFd> = self.sockets
            .iter()
            .map(|s| PollFd::new(s.as_raw_fd(), PollFlags::POLLIN))
            .collect();

        tracing::info!(listener = %self.id, ports = ?self.ports, "accept loop started");

        'accept: while !shutdown.load(Ordering::SeqCst)
        {
            match poll(&mut fds, timeout)
            {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => (),
                Err(e) => {
                    tracing::error!(listener = %self.id, "poll failed, listener stopping: {}", e);
                    break;
                }
            }

            for (index, fd) in fds.iter().enumerate()
            {
                if fd.revents().map_or(true, |r| r.is_empty())
                {
                    continue;
                }

                match socket::timed_accept(&self.sockets[index], 0, self.allow.as_ref())
                {
                    Ok(AcceptOutcome::Accepted(stream, remote_addr)) => {
                        let port = &self.ports[index];
                        let connection = Connection::new(id_gen.next(), Arc::clone(&services[index]), port.port, remote_addr, stream);
                        ConnectionTask::spawn(connection, &self.handler, self.owner.as_ref(), &connections);
                    }
                    Ok(AcceptOutcome::TimedOut) | Ok(AcceptOutcome::Rejected(_)) => (),
                    Err(e) if is_transient(&e) => {
                        tracing::warn!(listener = %self.id, port = self.ports[index].port, "accept failed: {}", e);
                        thread::sleep(TRANSIENT_BACKOFF);
                    }
                    Err(e) => {
                        tracing::error!(listener = %self.id, port = self.ports[index].port, "accept failed, listener stopping: {}", e);
                        break 'accept;
                    }
                }
            }
        }

        drop(hold);
        tracing::info!(listener = %self.id, "accept loop finished");
        self.sockets
    }
}
