//! The TLS adapter contract.
//!
//! hearth does not speak TLS itself. An application that wants HTTPS hands
//! the server a [`TlsAdapter`], which gets a chance to reconfigure the
//! listening socket and wraps each accepted stream into an encrypted
//! [`Transport`] plus a map of connection facts (cipher, client cert
//! fields, ...) that is exposed to the gateway.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::net::TcpStream;

use socket2::Socket;

use crate::server::conn::Transport;

/// TLS facts about one accepted connection, exposed to the gateway.
pub type TlsEnv = HashMap<String, String>;

/// Failure modes of [`TlsAdapter::wrap`].
#[derive(Debug)]
pub enum TlsError {
    /// The client sent plaintext HTTP to the TLS port. Carries the raw
    /// stream back so the server can answer with a plaintext
    /// `400 Bad Request` explaining the situation.
    Plaintext(TcpStream),
    /// The handshake failed beyond recovery; the connection is dropped
    /// without a response.
    FatalAlert(io::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Plaintext(_) => f.write_str("plain HTTP sent to a TLS port"),
            TlsError::FatalAlert(e) => write!(f, "fatal TLS alert: {}", e),
        }
    }
}

impl StdError for TlsError {}

/// Wraps accepted sockets into encrypted streams.
///
/// Implementations must be shareable across worker threads.
pub trait TlsAdapter: Send + Sync {
    /// Hook to reconfigure (or replace) the listening socket before
    /// `listen()` is called on it. The default is a pass-through.
    fn bind(&self, sock: Socket) -> io::Result<Socket> {
        Ok(sock)
    }

    /// Performs the handshake over an accepted stream and returns the
    /// encrypted transport together with the TLS environment.
    fn wrap(&self, sock: TcpStream) -> Result<(Box<dyn Transport>, TlsEnv), TlsError>;
}

impl fmt::Debug for dyn TlsAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn TlsAdapter")
    }
}

/// Marker payload adapters put inside an `io::Error` when an established
/// stream turns out to be plaintext (lazy-handshake adapters).
#[derive(Debug)]
pub struct PlaintextHttp;

impl fmt::Display for PlaintextHttp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("plain HTTP sent to a TLS port")
    }
}

impl StdError for PlaintextHttp {}

/// Marker payload for an unrecoverable TLS failure on an established
/// stream. Connections failing this way are closed without a response.
#[derive(Debug)]
pub struct FatalAlert;

impl fmt::Display for FatalAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fatal TLS alert")
    }
}

impl StdError for FatalAlert {}

/// Builds the `io::Error` a lazy-handshake adapter should surface for
/// plaintext traffic.
pub fn plaintext_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, PlaintextHttp)
}

/// Builds the `io::Error` an adapter should surface for a fatal alert.
pub fn fatal_alert_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, FatalAlert)
}

pub(crate) fn is_plaintext_error(e: &io::Error) -> bool {
    source_is::<PlaintextHttp>(e)
}

pub(crate) fn is_fatal_alert(e: &io::Error) -> bool {
    source_is::<FatalAlert>(e)
}

fn source_is<T: StdError + 'static>(e: &io::Error) -> bool {
    let mut source = e.get_ref().map(|c| c as &(dyn StdError + 'static));
    while let Some(cause) = source {
        if cause.is::<T>() {
            return true;
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_detected_through_io_errors() {
        assert!(is_plaintext_error(&plaintext_io_error()));
        assert!(!is_fatal_alert(&plaintext_io_error()));
        assert!(is_fatal_alert(&fatal_alert_io_error()));
        assert!(!is_plaintext_error(&io::Error::new(
            io::ErrorKind::InvalidData,
            "unrelated"
        )));
    }
}
