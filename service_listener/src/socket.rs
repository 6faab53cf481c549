//! Socket primitives shared by the listener machinery and by service modules.
//!
//! Everything here is IPv4 and IPv6 aware. Functions that wait take their
//! timeout in milliseconds, with a negative value meaning "wait forever", to
//! match `poll(2)`.

use ipnet::IpNet;
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    poll::{poll, PollFd, PollFlags},
    sys::socket::{getpeername, recv, MsgFlags, SockaddrLike, SockaddrStorage},
    unistd::{chown, Gid, Uid},
};
use serde::Deserialize;
use std::{
    ffi::CStr,
    fs,
    io,
    net::{
        IpAddr, Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener, TcpStream, ToSocketAddrs,
        UdpSocket,
    },
    os::unix::{
        fs::PermissionsExt,
        io::{AsRawFd, RawFd},
        net::UnixListener,
    },
    path::Path,
    time::Duration,
};

fn errno_to_io(e: Errno) -> io::Error
{
    io::Error::from_raw_os_error(e as i32)
}

/// Bind a listening TCP socket. Port 0 picks an ephemeral port; ask the
/// returned listener for its `local_addr` to find out which.
///
/// The standard library sets `SO_REUSEADDR` on Unix, so a port that was just
/// released can be bound again straight away.
pub fn make_tcp_socket(address: IpAddr, port: u16) -> io::Result<TcpListener>
{
    let listener = TcpListener::bind(SocketAddr::new(address, port))?;
    tracing::debug!(%address, port = listener.local_addr()?.port(), "bound TCP socket");
    Ok(listener)
}

/// Bind a listening Unix domain socket at `path`, replacing any stale socket
/// file, and apply the given permissions and ownership.
pub fn make_unix_socket(path: &Path, mode: u32, uid: Option<u32>, gid: Option<u32>) -> io::Result<UnixListener>
{
    match fs::remove_file(path)
    {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;

    if uid.is_some() || gid.is_some()
    {
        chown(path, uid.map(Uid::from_raw), gid.map(Gid::from_raw)).map_err(errno_to_io)?;
    }

    Ok(listener)
}

/// Switch a descriptor between blocking and non-blocking mode.
pub fn set_blocking(fd: RawFd, blocking: bool) -> io::Result<()>
{
    let current = fcntl(fd, FcntlArg::F_GETFL).map_err(errno_to_io)?;
    let mut flags = OFlag::from_bits_truncate(current);
    flags.set(OFlag::O_NONBLOCK, !blocking);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(errno_to_io)?;
    Ok(())
}

/// Wait up to `timeout_ms` for `fd` to become readable. A hangup counts as
/// readable, since the following read will report it.
pub fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool>
{
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, timeout_ms)
    {
        Ok(0) => Ok(false),
        Ok(_) => Ok(fds[0].revents().map_or(false, |r| !r.is_empty())),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(errno_to_io(e)),
    }
}

/// Every address `host` resolves to. IP literals resolve to themselves.
pub fn resolve_hostname(host: &str) -> io::Result<Vec<IpAddr>>
{
    Ok((host, 0).to_socket_addrs()?.map(|a| a.ip()).collect())
}

/// Whether `host` resolves to at least one address.
pub fn hostname_has_ip(host: &str) -> bool
{
    matches!(resolve_hostname(host), Ok(addrs) if !addrs.is_empty())
}

/// Whether `host` is written as a dotted-quad IPv4 address.
pub fn hostname_is_ipv4(host: &str) -> bool
{
    host.parse::<Ipv4Addr>().is_ok()
}

/// Connect to `host:port`, trying each resolved address in turn.
pub fn tcp_connect(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream>
{
    let mut last_error = None;
    for address in resolve_hostname(host)?
    {
        match TcpStream::connect_timeout(&SocketAddr::new(address, port), timeout)
        {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(%host, %address, port, "connect failed: {}", e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} has no addresses", host))))
}

/// What [`timed_accept`] found.
#[derive(Debug)]
pub enum AcceptOutcome
{
    Accepted(TcpStream, SocketAddr),
    /// Nothing arrived within the timeout.
    TimedOut,
    /// A client connected from an address the filter does not allow. Its
    /// connection has already been closed.
    Rejected(SocketAddr),
}

/// Wait up to `timeout_ms` for a connection on `listener` and accept it. The
/// accepted stream is always in blocking mode.
pub fn timed_accept(listener: &TcpListener, timeout_ms: i32, allow: Option<&IpFilter>) -> io::Result<AcceptOutcome>
{
    if !wait_readable(listener.as_raw_fd(), timeout_ms)?
    {
        return Ok(AcceptOutcome::TimedOut);
    }

    let (stream, address) = match listener.accept()
    {
        Ok(accepted) => accepted,
        // Another thread, or an aborted connection, got there first.
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(AcceptOutcome::TimedOut),
        Err(e) => return Err(e),
    };

    if let Some(filter) = allow
    {
        if !filter.permits(&address.ip())
        {
            tracing::info!(%address, "rejecting connection from disallowed address");
            close_socket(stream);
            return Ok(AcceptOutcome::Rejected(address));
        }
    }

    stream.set_nonblocking(false)?;
    Ok(AcceptOutcome::Accepted(stream, address))
}

/// Shut down both directions and close.
pub fn close_socket(stream: TcpStream)
{
    if let Err(e) = stream.shutdown(Shutdown::Both)
    {
        if e.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!("error shutting down socket: {}", e);
        }
    }
}

/// Whether the peer has closed its end, without consuming any pending data.
pub fn pending_shutdown(fd: RawFd) -> bool
{
    let mut byte = [0u8; 1];
    match recv(fd, &mut byte, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT)
    {
        Ok(0) => true,
        Ok(_) => false,
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => false,
        Err(_) => true,
    }
}

/// The address this host uses for outbound traffic. Connecting a UDP socket
/// sends nothing; it only makes the kernel pick a route.
pub fn local_ip() -> io::Result<IpAddr>
{
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
    Ok(socket.local_addr()?.ip())
}

const HOST_BUFFER_LEN: usize = 1025;

/// Reverse-resolve an address, falling back to its textual form.
pub fn hostname_of(address: IpAddr) -> String
{
    let mut host = [0 as libc::c_char; HOST_BUFFER_LEN];

    let rc = unsafe
    {
        match address
        {
            IpAddr::V4(v4) => {
                let mut sin: libc::sockaddr_in = std::mem::zeroed();
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
                libc::getnameinfo(
                    &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
            IpAddr::V6(v6) => {
                let mut sin6: libc::sockaddr_in6 = std::mem::zeroed();
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_addr.s6_addr = v6.octets();
                libc::getnameinfo(
                    &sin6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
    };

    if rc != 0
    {
        return address.to_string();
    }
    unsafe { CStr::from_ptr(host.as_ptr()) }.to_string_lossy().into_owned()
}

/// The peer address of a connected socket descriptor.
pub fn remote_ip(fd: RawFd) -> io::Result<IpAddr>
{
    let peer: SockaddrStorage = getpeername(fd)?;
    if let Some(v4) = peer.as_sockaddr_in()
    {
        Ok(IpAddr::V4(*SocketAddrV4::from(*v4).ip()))
    }
    else if let Some(v6) = peer.as_sockaddr_in6()
    {
        Ok(IpAddr::V6(*SocketAddrV6::from(*v6).ip()))
    }
    else
    {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("descriptor {} is not an internet socket (family {:?})", fd, peer.family()),
        ))
    }
}

// IPv4 clients on a dual-stack socket show up as ::ffff:a.b.c.d.
fn canonical(address: &IpAddr) -> IpAddr
{
    match address
    {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*address),
        v4 => *v4,
    }
}

/// Whether `address` lies in the network written as `cidr`. Malformed
/// networks match nothing.
pub fn cidr_match(address: &IpAddr, cidr: &str) -> bool
{
    match cidr.parse::<IpNet>()
    {
        Ok(net) => net.contains(&canonical(address)),
        Err(_) => {
            tracing::warn!(%cidr, "invalid network in address match");
            false
        }
    }
}

/// Match an address against a single address, a CIDR network, or a hostname.
///
/// Hostnames are resolved on every call; build an [`IpFilter`] to check many
/// addresses against the same patterns.
pub fn ip_match(address: &IpAddr, pattern: &str) -> bool
{
    IpPattern::parse(pattern).matches(address)
}

#[derive(Debug, Clone)]
enum IpPattern
{
    Address(IpAddr),
    Network(IpNet),
    // The addresses the name had when the pattern was parsed.
    Hostname(String, Vec<IpAddr>),
}

impl IpPattern
{
    fn parse(pattern: &str) -> Self
    {
        if let Ok(address) = pattern.parse::<IpAddr>()
        {
            Self::Address(address)
        }
        else if let Ok(net) = pattern.parse::<IpNet>()
        {
            Self::Network(net)
        }
        else
        {
            let addresses = match resolve_hostname(pattern)
            {
                Ok(resolved) => resolved.iter().map(canonical).collect(),
                Err(e) => {
                    tracing::warn!(host = %pattern, "could not resolve host in address match: {}", e);
                    Vec::new()
                }
            };
            Self::Hostname(pattern.to_string(), addresses)
        }
    }

    fn matches(&self, address: &IpAddr) -> bool
    {
        let address = canonical(address);
        match self
        {
            Self::Address(a) => canonical(a) == address,
            Self::Network(net) => net.contains(&address),
            Self::Hostname(_, addresses) => addresses.contains(&address),
        }
    }
}

/// A set of addresses, networks and hostnames that may connect to a listener.
///
/// Deserialises from a list of strings, e.g. `["127.0.0.1", "10.0.0.0/8"]`.
///
/// Hostnames are looked up once, when the filter is built, so checking a
/// client never blocks the accept loop on DNS. A name that fails to resolve
/// matches nothing. Pick up DNS changes by building a new filter, e.g. by
/// reloading the module that owns the listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct IpFilter
{
    patterns: Vec<IpPattern>,
}

impl IpFilter
{
    pub fn new<S: AsRef<str>>(patterns: impl IntoIterator<Item = S>) -> Self
    {
        Self {
            patterns: patterns.into_iter().map(|p| IpPattern::parse(p.as_ref())).collect()
        }
    }

    pub fn permits(&self, address: &IpAddr) -> bool
    {
        self.patterns.iter().any(|p| p.matches(address))
    }
}

impl From<Vec<String>> for IpFilter
{
    fn from(patterns: Vec<String>) -> Self
    {
        Self::new(patterns)
    }
}
