use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::error::Error;
use crate::proto::h1::io::Buffered;
use crate::server::request::Request;
use crate::server::Shared;
use crate::tls::TlsEnv;

/// A per-connection byte stream the server can serve HTTP over.
///
/// Implemented for plain TCP and UNIX streams; TLS adapters provide their
/// own wrapped implementations.
pub trait Transport: Read + Write + Send {
    /// Half-closes the stream for writing, when the transport supports
    /// it. Used for the lingering close.
    fn shutdown_write(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Write)
    }
}

#[cfg(unix)]
impl Transport for UnixStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        UnixStream::shutdown(self, std::net::Shutdown::Write)
    }
}

#[cfg(test)]
impl Transport for crate::mock::Duplex {}

/// One accepted socket, owned by a single worker at a time.
///
/// A connection serves an arbitrary number of requests back to back; the
/// loop in [`communicate`] constructs one [`Request`] per cycle.
///
/// [`communicate`]: Connection::communicate
pub(crate) struct Connection {
    pub(crate) io: Buffered<Box<dyn Transport>>,
    pub(crate) server: Arc<Shared>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) tls_env: TlsEnv,
    pub(crate) linger: bool,
    pub(crate) requests_seen: u64,
}

impl Connection {
    pub(crate) fn new(
        server: Arc<Shared>,
        transport: Box<dyn Transport>,
        remote_addr: Option<SocketAddr>,
        tls_env: TlsEnv,
    ) -> Connection {
        Connection {
            io: Buffered::new(transport),
            server,
            remote_addr,
            tls_env,
            linger: false,
            requests_seen: 0,
        }
    }

    /// Reads each request off the socket and responds, until the
    /// connection should close. Never lets a failure escape: every error
    /// either becomes a canned response or a silent close.
    pub(crate) fn communicate(&mut self) {
        loop {
            let mut req = Request::new(
                &self.server,
                &mut self.io,
                self.remote_addr,
                &self.tls_env,
            );

            let parsed = req.parse();
            if self.server.stats.enabled() {
                self.requests_seen += 1;
            }
            if let Err(e) = parsed {
                Self::handle_failure(&mut req, &mut self.linger, e);
                return;
            }
            if !req.ready() {
                // parsing already answered with a 4xx/5xx; let the
                // connection close
                return;
            }

            if let Err(e) = req.respond() {
                Self::handle_failure(&mut req, &mut self.linger, e);
                return;
            }
            if req.close_connection() {
                return;
            }
            trace!("connection kept alive after {} request(s)", self.requests_seen);
        }
    }

    /// The error ladder: timeouts, TLS conditions, gone peers, everything
    /// else. Responses are only attempted while no header bytes have gone
    /// out.
    fn handle_failure(req: &mut Request<'_>, linger: &mut bool, e: Error) {
        if e.is_timeout() {
            // An idle keep-alive that expired closes silently; a request
            // that started and then stalled earns a 408 when possible.
            if req.started_request() && !req.sent_headers() {
                let _ = req.simple_response(b"408 Request Timeout", "");
            }
            return;
        }
        if e.is_fatal_tls_alert() {
            debug!("closing connection after fatal TLS alert");
            return;
        }
        if e.is_tls_plaintext() {
            let msg = "The client sent a plain HTTP request, but \
                       this server only speaks HTTPS on this port.";
            warn!("{}", msg);
            if !req.sent_headers() {
                if req.simple_response(b"400 Bad Request", msg).is_ok() {
                    *linger = true;
                }
            }
            return;
        }
        if e.is_ignorable_socket() {
            return;
        }
        if e.is_io() {
            warn!("socket error while serving connection: {}", e);
            if !req.sent_headers() {
                let _ = req.simple_response(b"500 Internal Server Error", "");
            }
            return;
        }
        error!("unhandled error while serving connection: {}", e);
        if !req.sent_headers() {
            let _ = req.simple_response(b"500 Internal Server Error", "");
        }
    }

    /// Flushes and drops the socket. With `linger` set, the write half is
    /// shut down first and the peer gets a bounded window to finish
    /// reading the response before the FIN turns into a reset.
    pub(crate) fn close(mut self) {
        let _ = self.io.flush();
        if self.linger {
            let _ = self.io.io_mut().shutdown_write();
            for _ in 0..16 {
                match self.io.read(4096) {
                    Ok(data) if data.is_empty() => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }
    }
}
