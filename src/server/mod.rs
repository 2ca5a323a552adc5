//! The server: configuration, socket lifecycle, accept loop, shutdown.

use std::io::{self, Write as _};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::error::Error;
use crate::proto::h1::Protocol;
use crate::service::Gateway;
use crate::stats::ServerStats;
use crate::tls::{TlsAdapter, TlsEnv, TlsError};

use self::conn::{Connection, Transport};
use self::pool::WorkerPool;
use self::tcp::{BoundAddr, Listener};

pub(crate) mod conn;
pub(crate) mod pool;
pub(crate) mod request;
pub(crate) mod tcp;

const PLAINTEXT_ON_TLS: &str = "The client sent a plain HTTP request, but \
                                this server only speaks HTTPS on this port.";

/// Configuration shared read-only between the acceptor and the workers.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) protocol: Protocol,
    pub(crate) server_name: String,
    pub(crate) software: String,
    pub(crate) max_request_header_size: u64,
    pub(crate) max_request_body_size: u64,
    pub(crate) timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) backlog: i32,
    pub(crate) nodelay: bool,
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) tls: Option<Arc<dyn TlsAdapter>>,
    pub(crate) stats: Arc<ServerStats>,
}

/// Where a [`Server`] listens.
#[derive(Debug, Clone)]
pub enum BindAddr {
    /// A TCP `(host, port)` pair. The host may be any address literal or
    /// hostname; `0.0.0.0` / `::` listen on every interface. The empty
    /// string is rejected.
    Tcp(String, u16),
    /// A UNIX domain socket path.
    Unix(PathBuf),
}

impl From<(&str, u16)> for BindAddr {
    fn from((host, port): (&str, u16)) -> BindAddr {
        BindAddr::Tcp(host.to_string(), port)
    }
}

impl From<(String, u16)> for BindAddr {
    fn from((host, port): (String, u16)) -> BindAddr {
        BindAddr::Tcp(host, port)
    }
}

impl From<SocketAddr> for BindAddr {
    fn from(addr: SocketAddr) -> BindAddr {
        BindAddr::Tcp(addr.ip().to_string(), addr.port())
    }
}

impl From<PathBuf> for BindAddr {
    fn from(path: PathBuf) -> BindAddr {
        BindAddr::Unix(path)
    }
}

/// Configures and builds a [`Server`].
///
/// All options carry the engine's defaults; only the bind address and the
/// gateway are mandatory.
#[derive(Debug)]
pub struct Builder {
    bind_addr: BindAddr,
    min_threads: usize,
    max_threads: isize,
    server_name: Option<String>,
    protocol: Protocol,
    backlog: i32,
    shutdown_timeout: Duration,
    timeout: Duration,
    max_request_header_size: u64,
    max_request_body_size: u64,
    nodelay: bool,
    version: String,
    software: Option<String>,
    tls: Option<Arc<dyn TlsAdapter>>,
    stats: Option<Arc<ServerStats>>,
}

impl Builder {
    fn new(bind_addr: BindAddr) -> Builder {
        Builder {
            bind_addr,
            min_threads: 10,
            max_threads: -1,
            server_name: None,
            protocol: Protocol::HTTP_11,
            backlog: 5,
            shutdown_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            max_request_header_size: 0,
            max_request_body_size: 0,
            nodelay: true,
            version: format!("hearth/{}", env!("CARGO_PKG_VERSION")),
            software: None,
            tls: None,
            stats: None,
        }
    }

    /// Minimum number of worker threads (default 10, floor 1).
    pub fn min_threads(mut self, n: usize) -> Builder {
        self.min_threads = n;
        self
    }

    /// Maximum number of worker threads; negative means unbounded
    /// (the default).
    pub fn max_threads(mut self, n: isize) -> Builder {
        self.max_threads = n;
        self
    }

    /// Server name for the `Server` response header; defaults to the OS
    /// hostname.
    pub fn server_name(mut self, name: impl Into<String>) -> Builder {
        self.server_name = Some(name.into());
        self
    }

    /// The protocol version advertised in responses (default
    /// [`Protocol::HTTP_11`]). This also bounds the response feature set.
    pub fn protocol(mut self, protocol: Protocol) -> Builder {
        self.protocol = protocol;
        self
    }

    /// The `listen()` backlog (default 5).
    pub fn request_queue_size(mut self, backlog: i32) -> Builder {
        self.backlog = backlog;
        self
    }

    /// Grace given to workers on shutdown (default 5 seconds).
    pub fn shutdown_timeout(mut self, grace: Duration) -> Builder {
        self.shutdown_timeout = grace;
        self
    }

    /// Per-connection socket timeout (default 10 seconds).
    pub fn timeout(mut self, timeout: Duration) -> Builder {
        self.timeout = timeout;
        self
    }

    /// Cap on request-line + header bytes; 0 (the default) disables it.
    pub fn max_request_header_size(mut self, bytes: u64) -> Builder {
        self.max_request_header_size = bytes;
        self
    }

    /// Cap on request body bytes; 0 (the default) disables it.
    pub fn max_request_body_size(mut self, bytes: u64) -> Builder {
        self.max_request_body_size = bytes;
        self
    }

    /// Whether to set `TCP_NODELAY` (default true).
    pub fn nodelay(mut self, nodelay: bool) -> Builder {
        self.nodelay = nodelay;
        self
    }

    /// Overrides the engine version string.
    pub fn version(mut self, version: impl Into<String>) -> Builder {
        self.version = version.into();
        self
    }

    /// Overrides the software identifier (defaults to
    /// `"<version> Server"`).
    pub fn software(mut self, software: impl Into<String>) -> Builder {
        self.software = Some(software.into());
        self
    }

    /// Serves TLS through the given adapter.
    pub fn tls(mut self, adapter: Arc<dyn TlsAdapter>) -> Builder {
        self.tls = Some(adapter);
        self
    }

    /// Injects a statistics registry.
    pub fn stats(mut self, stats: Arc<ServerStats>) -> Builder {
        self.stats = Some(stats);
        self
    }

    /// Builds the server around the given gateway.
    pub fn build(self, gateway: impl Gateway) -> crate::Result<Server> {
        if let BindAddr::Tcp(host, _) = &self.bind_addr {
            if host.is_empty() {
                return Err(Error::new_listen(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "a host of '' is not allowed; use '0.0.0.0' (IPv4) or '::' \
                     (IPv6) to listen on all active interfaces",
                )));
            }
        }

        let stats = self.stats.unwrap_or_else(|| Arc::new(ServerStats::new(false)));
        let shared = Arc::new(Shared {
            protocol: self.protocol,
            server_name: self.server_name.unwrap_or_else(hostname),
            software: self
                .software
                .unwrap_or_else(|| format!("{} Server", self.version)),
            max_request_header_size: self.max_request_header_size,
            max_request_body_size: self.max_request_body_size,
            timeout: self.timeout,
            shutdown_timeout: self.shutdown_timeout,
            backlog: self.backlog,
            nodelay: self.nodelay,
            gateway: Arc::new(gateway),
            tls: self.tls,
            stats: stats.clone(),
        });

        Ok(Server {
            pool: WorkerPool::new(self.min_threads, self.max_threads, stats),
            shared,
            bind_addr: self.bind_addr,
            listener: Mutex::new(None),
            bound: Mutex::new(None),
            ready: AtomicBool::new(false),
            interrupt: Mutex::new(None),
            start_time: Mutex::new(None),
            run_time: Mutex::new(Duration::ZERO),
        })
    }
}

/// An HTTP/1 server: one acceptor loop feeding a pool of worker threads.
///
/// All state is interior-mutable, so the usual shape is an
/// `Arc<Server>`: one thread blocks in [`start`], any other may call
/// [`stop`].
///
/// [`start`]: Server::start
/// [`stop`]: Server::stop
#[derive(Debug)]
pub struct Server {
    shared: Arc<Shared>,
    bind_addr: BindAddr,
    pool: WorkerPool,
    listener: Mutex<Option<Listener>>,
    bound: Mutex<Option<BoundAddr>>,
    ready: AtomicBool,
    interrupt: Mutex<Option<Error>>,
    start_time: Mutex<Option<Instant>>,
    run_time: Mutex<Duration>,
}

impl Server {
    /// Starts configuring a server listening on `addr`.
    pub fn builder(addr: impl Into<BindAddr>) -> Builder {
        Builder::new(addr.into())
    }

    /// Binds the listener, spawns the workers, and runs the accept loop
    /// until [`stop`] flips the ready flag. Returns the interrupt error
    /// if one was raised.
    ///
    /// [`stop`]: Server::stop
    pub fn start(&self) -> crate::Result<()> {
        *self.interrupt.lock().unwrap() = None;

        let listener = tcp::bind(&self.bind_addr, &self.shared)?;
        *self.bound.lock().unwrap() = Some(listener.bound().clone());
        *self.listener.lock().unwrap() = Some(listener);

        self.pool.start();
        *self.start_time.lock().unwrap() = Some(Instant::now());
        self.ready.store(true, Ordering::SeqCst);

        while self.ready.load(Ordering::SeqCst) {
            if let Err(e) = self.tick() {
                error!("error in accept loop: {}", e);
            }
        }

        match self.interrupt.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Like [`start`], but guarantees [`stop`] has run before an error
    /// is returned.
    ///
    /// [`start`]: Server::start
    /// [`stop`]: Server::stop
    pub fn safe_start(&self) -> crate::Result<()> {
        match self.start() {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("shutting down after startup failure: {}", e);
                self.stop();
                Err(e)
            }
        }
    }

    /// Accepts one connection and hands it to the pool.
    fn tick(&self) -> crate::Result<()> {
        let accepted = {
            let guard = self.listener.lock().unwrap();
            let listener = match guard.as_ref() {
                Some(listener) => listener,
                None => return Ok(()),
            };
            match listener.accept() {
                Ok(pair) => pair,
                Err(e) => return self.accept_error(e),
            }
        };

        self.shared.stats.record_accept();
        if !self.ready.load(Ordering::SeqCst) {
            // shutdown raced the accept; the self-connect poke lands here
            return Ok(());
        }

        let (sock, accepted_addr) = accepted;
        let configured = sock
            .set_read_timeout(Some(self.shared.timeout))
            .and_then(|()| sock.set_write_timeout(Some(self.shared.timeout)));
        if let Err(e) = configured {
            debug!("dropping connection: could not set socket timeouts: {}", e);
            return Ok(());
        }

        let (transport, remote_addr, tls_env) = match &self.bind_addr {
            BindAddr::Tcp(..) => {
                if self.shared.nodelay {
                    let _ = sock.set_nodelay(true);
                }
                // some stacks report no peer for a dying connection
                let remote = accepted_addr.or_else(|| self.synthesized_remote());
                let stream = TcpStream::from(sock);
                match &self.shared.tls {
                    Some(tls) => match tls.wrap(stream) {
                        Ok((transport, env)) => (transport, remote, env),
                        Err(TlsError::Plaintext(raw)) => {
                            self.reject_plaintext(raw);
                            return Ok(());
                        }
                        Err(TlsError::FatalAlert(e)) => {
                            debug!("TLS handshake failed: {}", e);
                            return Ok(());
                        }
                    },
                    None => (Box::new(stream) as Box<dyn Transport>, remote, TlsEnv::new()),
                }
            }
            BindAddr::Unix(_) => (unix_transport(sock), None, TlsEnv::new()),
        };

        let conn = Connection::new(self.shared.clone(), transport, remote_addr, tls_env);
        self.pool.put(conn);
        Ok(())
    }

    fn accept_error(&self, e: io::Error) -> crate::Result<()> {
        match e.kind() {
            // the polling timeout, or a signal
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Ok(())
            }
            // the connection died between accept queue and us
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused => {
                debug!("accepted connection already errored: {}", e);
                Ok(())
            }
            _ => {
                self.shared.stats.record_socket_error();
                if !self.ready.load(Ordering::SeqCst) {
                    // the listener was closed under us during shutdown
                    return Ok(());
                }
                Err(Error::new_io(e))
            }
        }
    }

    fn synthesized_remote(&self) -> Option<SocketAddr> {
        match self.local_addr()? {
            SocketAddr::V4(_) => Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
            SocketAddr::V6(_) => Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)),
        }
    }

    /// Answers plaintext HTTP on a TLS port with a raw 400 and drops the
    /// socket.
    fn reject_plaintext(&self, mut stream: TcpStream) {
        warn!("{}", PLAINTEXT_ON_TLS);
        let mut buf = Vec::with_capacity(128 + PLAINTEXT_ON_TLS.len());
        self.shared.protocol.extend(&mut buf);
        buf.extend_from_slice(b" 400 Bad Request\r\nContent-Length: ");
        let mut len = itoa::Buffer::new();
        buf.extend_from_slice(len.format(PLAINTEXT_ON_TLS.len()).as_bytes());
        buf.extend_from_slice(b"\r\nContent-Type: text/plain\r\n\r\n");
        buf.extend_from_slice(PLAINTEXT_ON_TLS.as_bytes());
        let _ = stream.write_all(&buf);
    }

    /// Gracefully shuts down: stops accepting, unblocks the acceptor,
    /// closes the listener, and drains the workers within the configured
    /// grace window.
    pub fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);

        if let Some(started) = self.start_time.lock().unwrap().take() {
            *self.run_time.lock().unwrap() += started.elapsed();
        }

        // Touch our own socket so a blocked accept() returns immediately.
        if let Some(addr) = self.local_addr() {
            let target = match addr.ip() {
                ip if ip.is_unspecified() && ip.is_ipv4() => {
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
                }
                ip if ip.is_unspecified() => {
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
                }
                _ => addr,
            };
            let _ = TcpStream::connect_timeout(&target, Duration::from_secs(1));
        }

        if let Some(listener) = self.listener.lock().unwrap().take() {
            drop(listener);
        }

        self.pool.stop(self.shared.shutdown_timeout);
        debug!("server stopped after {:?} total runtime", self.runtime());
    }

    /// Records the error and shuts the server down; [`start`] returns it.
    ///
    /// [`start`]: Server::start
    pub fn interrupt(&self, err: Error) {
        *self.interrupt.lock().unwrap() = Some(err);
        self.stop();
    }

    /// Whether the accept loop is up.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Blocks until the accept loop is up, or until `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_ready() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// The bound TCP address, once the listener is up. Useful with a
    /// port-0 bind.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.bound.lock().unwrap().as_ref() {
            Some(BoundAddr::Tcp(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// Total time spent serving, across starts and stops.
    pub fn runtime(&self) -> Duration {
        let base = *self.run_time.lock().unwrap();
        match *self.start_time.lock().unwrap() {
            Some(started) => base + started.elapsed(),
            None => base,
        }
    }

    /// The statistics registry this server reports into.
    pub fn stats(&self) -> Arc<ServerStats> {
        self.shared.stats.clone()
    }
}

#[cfg(unix)]
fn unix_transport(sock: socket2::Socket) -> Box<dyn Transport> {
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    Box::new(unsafe { std::os::unix::net::UnixStream::from_raw_fd(sock.into_raw_fd()) })
}

#[cfg(not(unix))]
fn unix_transport(_sock: socket2::Socket) -> Box<dyn Transport> {
    unreachable!("UNIX binds are rejected at startup on this platform")
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    let ok = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0 };
    if ok {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "localhost".to_string()
}

#[cfg(not(unix))]
fn hostname() -> String {
    "localhost".to_string()
}
