use crate::*;

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    os::unix::io::{AsRawFd, RawFd},
    sync::Arc,
    time::Duration,
};

/// A connection accepted by a listener, owned by the handler it was given to.
pub struct Connection
{
    pub id: ConnectionId,
    /// Name of the service whose port accepted this connection.
    pub service: Arc<str>,
    pub local_port: u16,
    pub remote_addr: SocketAddr,
    stream: TcpStream,
}

impl Connection
{
    pub(crate) fn new(id: ConnectionId, service: Arc<str>, local_port: u16, remote_addr: SocketAddr, stream: TcpStream) -> Self
    {
        Self {
            id,
            service,
            local_port,
            remote_addr,
            stream,
        }
    }

    pub fn stream(&self) -> &TcpStream
    {
        &self.stream
    }

    /// A second handle on the same socket, e.g. for a writer thread.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream>
    {
        self.stream.try_clone()
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) -> io::Result<()>
    {
        self.stream.set_read_timeout(timeout)
    }

    /// The client's hostname, or its address if it has none.
    pub fn remote_hostname(&self) -> String
    {
        socket::hostname_of(self.remote_addr.ip())
    }

    /// Whether the client has closed its end.
    pub fn peer_closed(&self) -> bool
    {
        socket::pending_shutdown(self.stream.as_raw_fd())
    }

    /// Send the provided text to the client.
    pub fn send(&mut self, text: &str) -> Result<(), ConnectionError>
    {
        Ok(self.stream.write_all(text.as_bytes())?)
    }

    /// Close the connection.
    pub fn close(self)
    {
        tracing::debug!(connection = %self.id, "closing connection");
        socket::close_socket(self.stream);
    }
}

impl Read for Connection
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        self.stream.read(buf)
    }
}

impl Write for Connection
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>
    {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()>
    {
        self.stream.flush()
    }
}

impl AsRawFd for Connection
{
    fn as_raw_fd(&self) -> RawFd
    {
        self.stream.as_raw_fd()
    }
}

/// A client session: a connection that has been handed to a handshake-gated
/// service.
pub struct Session
{
    connection: Connection,
}

impl Session
{
    pub(crate) fn new(connection: Connection) -> Self
    {
        Self { connection }
    }

    pub fn id(&self) -> ConnectionId
    {
        self.connection.id
    }

    pub fn connection(&self) -> &Connection
    {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection
    {
        &mut self.connection
    }

    /// End the session and close its connection.
    pub fn close(self)
    {
        tracing::debug!(session = %self.id(), service = %self.connection.service, "session ended");
        self.connection.close();
    }
}

impl Read for Session
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        self.connection.read(buf)
    }
}

impl Write for Session
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>
    {
        self.connection.write(buf)
    }

    fn flush(&mut self) -> io::Result<()>
    {
        self.connection.flush()
    }
}

impl AsRawFd for Session
{
    fn as_raw_fd(&self) -> RawFd
    {
        self.connection.as_raw_fd()
    }
}
