use thiserror::Error;

/// An error that might occur on a single connection.
#[derive(Error,Debug)]
pub enum ConnectionError
{
    #[error("Connection closed")]
    Closed,
    #[error("Timed out waiting for the peer")]
    TimedOut,
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("I/O Error: {0}")]
    IoError(String),
}

/// An error that might occur when starting or stopping a listener.
#[derive(Error,Debug)]
pub enum ListenerError
{
    #[error("A listener needs between one and three ports, got {0}")]
    InvalidPortCount(usize),
    #[error("Port {0} already has a listener")]
    PortInUse(u16),
    #[error("Could not listen on port {port}: {source}")]
    Bind
    {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("No listener on port {0}")]
    NotListening(u16),
    #[error("Listener on port {0} can't be stopped from its own accept thread")]
    StopFromAcceptThread(u16),
    #[error("Accept thread for port {0} panicked")]
    AcceptThreadPanicked(u16),
    #[error("I/O Error: {0}")]
    IoError(String),
}

/// An error from [`DelimitedReader`](crate::DelimitedReader).
#[derive(Error,Debug)]
pub enum ReadError
{
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Read buffer of {capacity} bytes is full with no delimiter")]
    BufferExhausted { capacity: usize },
}

impl From<std::io::Error> for ListenerError
{
    fn from(e: std::io::Error) -> Self
    {
        Self::IoError(e.to_string())
    }
}

impl From<std::io::Error> for ConnectionError
{
    fn from(e: std::io::Error) -> Self
    {
        match e.kind()
        {
            std::io::ErrorKind::UnexpectedEof => Self::Closed,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::TimedOut,
            _ => Self::IoError(e.to_string())
        }
    }
}

impl From<ReadError> for ConnectionError
{
    fn from(e: ReadError) -> Self
    {
        match e
        {
            ReadError::Io(e) => e.into(),
            e => Self::IoError(e.to_string())
        }
    }
}
