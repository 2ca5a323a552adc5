//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::tls;

/// Result type often returned from methods that can have hearth `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while serving HTTP connections.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The peer sent bytes that violate the HTTP/1 grammar.
    Parse(Parse),
    /// A configured size limit was exceeded while reading a request.
    MaxSize(MaxSize),
    /// The gateway produced a status line that cannot be emitted.
    Status,
    /// The gateway returned an error or panicked.
    Gateway,
    /// A read or write on the connection timed out.
    Timeout,
    /// An `io::Error` on the connection that is not a timeout.
    Io,
    /// A TLS-level condition reported by the adapter.
    Tls(Tls),
    /// The listening socket could not be created or bound.
    Listen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parse {
    Line,
    RequestLine,
    UriFragment,
    UriEscape,
    Version,
    Header,
    HeaderEnd,
    TooManyHeaders,
    ContentLength,
    Chunk,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MaxSize {
    Headers,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tls {
    /// The client spoke plaintext HTTP on a TLS port.
    Plaintext,
    /// The handshake or record layer failed beyond recovery.
    FatalAlert,
}

impl Parse {
    /// Text suitable for the body of a `400 Bad Request`.
    pub(crate) fn describe(&self) -> &'static str {
        match *self {
            Parse::Line => "HTTP requires CRLF terminators",
            Parse::RequestLine => "Malformed Request-Line",
            Parse::UriFragment => "Illegal #fragment in Request-URI.",
            Parse::UriEscape => "Illegal percent-escape in Request-URI.",
            Parse::Version => "Malformed Request-Line: bad protocol token",
            Parse::Header => "Illegal header line.",
            Parse::HeaderEnd => "Illegal end of headers.",
            Parse::TooManyHeaders => "Too many header fields.",
            Parse::ContentLength => "Invalid Content-Length header.",
            Parse::Chunk => "Bad chunked transfer coding.",
            Parse::Trailer => "Illegal trailer line.",
        }
    }
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_max_size(which: MaxSize) -> Error {
        Error::new(Kind::MaxSize(which))
    }

    pub(crate) fn new_status() -> Error {
        Error::new(Kind::Status)
    }

    pub(crate) fn new_gateway<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Gateway).with(cause)
    }

    pub(crate) fn new_listen(cause: io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    /// Classifies an `io::Error` from the connection: timeouts and TLS
    /// signals smuggled through the stream get their own kinds.
    pub(crate) fn new_io(cause: io::Error) -> Error {
        let kind = match cause.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Kind::Timeout,
            _ if tls::is_plaintext_error(&cause) => Kind::Tls(Tls::Plaintext),
            _ if tls::is_fatal_alert(&cause) => Kind::Tls(Tls::FatalAlert),
            _ => Kind::Io,
        };
        Error::new(kind).with(cause)
    }

    pub(crate) fn parse_kind(&self) -> Option<Parse> {
        match self.inner.kind {
            Kind::Parse(p) => Some(p),
            _ => None,
        }
    }

    /// Returns true if the peer violated the HTTP/1 grammar.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if a configured size limit was exceeded.
    pub fn is_max_size(&self) -> bool {
        matches!(self.inner.kind, Kind::MaxSize(_))
    }

    /// Returns true if a request body overran `max_request_body_size`.
    pub fn is_body_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::MaxSize(MaxSize::Body))
    }

    /// Returns true if a connection read or write timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if this wraps a connection `io::Error`.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the listener could not be created or bound.
    pub fn is_listen(&self) -> bool {
        matches!(self.inner.kind, Kind::Listen)
    }

    /// Returns true if the gateway failed or produced an illegal status.
    pub fn is_gateway(&self) -> bool {
        matches!(self.inner.kind, Kind::Gateway | Kind::Status)
    }

    pub(crate) fn is_status(&self) -> bool {
        matches!(self.inner.kind, Kind::Status)
    }

    /// Returns true for plaintext-HTTP-on-a-TLS-port.
    pub fn is_tls_plaintext(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls(Tls::Plaintext))
    }

    /// Returns true for an unrecoverable TLS failure.
    pub fn is_fatal_tls_alert(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls(Tls::FatalAlert))
    }

    /// Socket errors that mean the peer is simply gone; responses are
    /// pointless and the condition is not worth logging loudly.
    pub(crate) fn is_ignorable_socket(&self) -> bool {
        match self.inner.kind {
            Kind::Io => matches!(
                self.io_kind(),
                Some(
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::NotConnected
                )
            ),
            _ => false,
        }
    }

    fn io_kind(&self) -> Option<io::ErrorKind> {
        self.inner
            .cause
            .as_deref()
            .and_then(|c| c.downcast_ref::<io::Error>())
            .map(io::Error::kind)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Line) => "invalid line terminator",
            Kind::Parse(Parse::RequestLine) => "invalid request line",
            Kind::Parse(Parse::UriFragment) => "fragment in request URI",
            Kind::Parse(Parse::UriEscape) => "invalid percent-escape in request URI",
            Kind::Parse(Parse::Version) => "invalid HTTP version",
            Kind::Parse(Parse::Header) => "invalid header line",
            Kind::Parse(Parse::HeaderEnd) => "connection closed inside header block",
            Kind::Parse(Parse::TooManyHeaders) => "too many header fields",
            Kind::Parse(Parse::ContentLength) => "invalid Content-Length",
            Kind::Parse(Parse::Chunk) => "invalid chunked transfer coding",
            Kind::Parse(Parse::Trailer) => "invalid chunk trailer",
            Kind::MaxSize(MaxSize::Headers) => "request header block over limit",
            Kind::MaxSize(MaxSize::Body) => "request body over limit",
            Kind::Status => "illegal response status from gateway",
            Kind::Gateway => "gateway error",
            Kind::Timeout => "connection timed out",
            Kind::Io => "connection error",
            Kind::Tls(Tls::Plaintext) => "plain HTTP sent to a TLS port",
            Kind::Tls(Tls::FatalAlert) => "fatal TLS alert",
            Kind::Listen => "error creating the listening socket",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("hearth::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_is_one_pointer() {
        assert_eq!(std::mem::size_of::<Error>(), std::mem::size_of::<usize>());
    }

    #[test]
    fn timeouts_are_classified() {
        let e = Error::new_io(io::Error::new(io::ErrorKind::WouldBlock, "timed out"));
        assert!(e.is_timeout());
        let e = Error::new_io(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        assert!(e.is_timeout());
        let e = Error::new_io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(e.is_io() && !e.is_timeout());
    }

    #[test]
    fn ignorable_socket_kinds() {
        let gone = Error::new_io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(gone.is_ignorable_socket());
        let real = Error::new_io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!real.is_ignorable_socket());
    }
}
