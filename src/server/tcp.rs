use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

use crate::error::Error;
use crate::server::{BindAddr, Shared};

/// How long `accept()` blocks before returning to poll the `ready` flag.
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// The bound listening socket.
///
/// `socket2` keeps the setup portable: close-on-exec (or the
/// non-inheritable handle flag on Windows) is applied by `Socket::new`
/// and `accept`, and the pre-bind options (`SO_REUSEADDR`, `TCP_NODELAY`,
/// `IPV6_V6ONLY`) are plain method calls.
#[derive(Debug)]
pub(crate) struct Listener {
    sock: Socket,
    bound: BoundAddr,
}

#[derive(Debug, Clone)]
pub(crate) enum BoundAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Listener {
    /// Accepts one connection, blocking at most [`ACCEPT_POLL_TIMEOUT`].
    pub(crate) fn accept(&self) -> io::Result<(Socket, Option<SocketAddr>)> {
        let (sock, addr) = self.sock.accept()?;
        Ok((sock, addr.as_socket()))
    }

    pub(crate) fn bound(&self) -> &BoundAddr {
        &self.bound
    }
}

pub(crate) fn bind(addr: &BindAddr, shared: &Shared) -> crate::Result<Listener> {
    match addr {
        BindAddr::Tcp(host, port) => bind_tcp(host, *port, shared),
        BindAddr::Unix(path) => bind_unix(path, shared),
    }
}

fn bind_tcp(host: &str, port: u16, shared: &Shared) -> crate::Result<Listener> {
    let candidates = resolve(host, port)?;

    let mut last_err = None;
    for candidate in candidates {
        trace!("trying to bind {}", candidate);
        match try_bind_tcp(candidate, shared) {
            Ok(listener) => {
                debug!("listening on {:?}", listener.bound);
                return Ok(listener);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::new_listen(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no socket could be created")
    })))
}

/// Resolves a bind host. Address literals skip the resolver so `0.0.0.0`
/// and `::` binds never depend on one.
fn resolve(host: &str, port: u16) -> crate::Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    match (host, port).to_socket_addrs() {
        Ok(addrs) => Ok(addrs.collect()),
        Err(e) => Err(Error::new_listen(e)),
    }
}

fn try_bind_tcp(addr: SocketAddr, shared: &Shared) -> io::Result<Listener> {
    let domain = Domain::for_address(addr);
    let sock = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;

    sock.set_reuse_address(true)?;
    if shared.nodelay {
        sock.set_nodelay(true)?;
    }
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        // dual-stack on a `::` bind; some TCP stacks lack the option
        let _ = sock.set_only_v6(false);
    }

    let sock = match &shared.tls {
        Some(tls) => tls.bind(sock)?,
        None => sock,
    };

    sock.bind(&SockAddr::from(addr))?;
    sock.set_read_timeout(Some(ACCEPT_POLL_TIMEOUT))?;
    sock.listen(shared.backlog)?;

    let bound = sock
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .unwrap_or(addr);
    Ok(Listener {
        sock,
        bound: BoundAddr::Tcp(bound),
    })
}

#[cfg(unix)]
fn bind_unix(path: &PathBuf, shared: &Shared) -> crate::Result<Listener> {
    // reuse the path if a previous instance left its socket behind
    let _ = std::fs::remove_file(path);

    let sock = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(Error::new_listen)?;
    let addr = SockAddr::unix(path).map_err(Error::new_listen)?;
    sock.bind(&addr).map_err(Error::new_listen)?;

    // make the socket reachable for every local user; failing is fine
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777));

    sock.set_read_timeout(Some(ACCEPT_POLL_TIMEOUT))
        .map_err(Error::new_listen)?;
    sock.listen(shared.backlog).map_err(Error::new_listen)?;
    debug!("listening on unix socket {}", path.display());

    Ok(Listener {
        sock,
        bound: BoundAddr::Unix(path.clone()),
    })
}

#[cfg(not(unix))]
fn bind_unix(_path: &PathBuf, _shared: &Shared) -> crate::Result<Listener> {
    Err(Error::new_listen(io::Error::new(
        io::ErrorKind::Unsupported,
        "UNIX domain sockets are not supported on this platform",
    )))
}
