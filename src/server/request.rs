use std::cmp;
use std::fmt;
use std::io::Write as _;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;
use tracing::trace;

use crate::error::{Error, Parse};
use crate::proto::h1::date;
use crate::proto::h1::decode::{BodyReader, ChunkedReader, KnownLengthReader, SizeCheck};
use crate::proto::h1::headers::{self, Headers};
use crate::proto::h1::io::Buffered;
use crate::proto::h1::{Protocol, CRLF};
use crate::server::conn::Transport;
use crate::server::Shared;
use crate::tls::TlsEnv;

const ENTITY_TOO_LARGE: &str =
    "The entity sent with the request exceeds the maximum allowed bytes.";
const HEADERS_TOO_LARGE: &str =
    "The headers sent with the request exceed the maximum allowed bytes.";
const URI_TOO_LONG: &str =
    "The Request-URI sent with the request exceeds the maximum allowed bytes.";

/// One HTTP request/response cycle on a connection.
///
/// A request borrows its connection's buffered streams for the duration of
/// one cycle: the driver parses it, hands it to the gateway, and discards
/// it once the response is on the wire. The gateway reads the body through
/// [`read_body`]/[`read_body_line`], sets the status and outbound headers,
/// and emits bytes with [`write`].
///
/// [`read_body`]: Request::read_body
/// [`read_body_line`]: Request::read_body_line
/// [`write`]: Request::write
pub struct Request<'a> {
    server: &'a Shared,
    io: &'a mut Buffered<Box<dyn Transport>>,
    remote_addr: Option<SocketAddr>,
    tls_env: &'a TlsEnv,

    method: Bytes,
    uri: Bytes,
    scheme: Bytes,
    authority: Bytes,
    path: Bytes,
    query: Bytes,
    request_protocol: Protocol,
    response_protocol: Protocol,
    inheaders: Headers,
    outheaders: Vec<(Bytes, Bytes)>,
    status: Bytes,
    content_length: u64,

    size_check: SizeCheck,
    body: Option<BodyReader>,

    ready: bool,
    started_request: bool,
    sent_headers: bool,
    close_connection: bool,
    chunked_read: bool,
    chunked_write: bool,
    allow_message_body: bool,
}

impl<'a> Request<'a> {
    pub(crate) fn new(
        server: &'a Shared,
        io: &'a mut Buffered<Box<dyn Transport>>,
        remote_addr: Option<SocketAddr>,
        tls_env: &'a TlsEnv,
    ) -> Request<'a> {
        let scheme = if server.tls.is_some() {
            Bytes::from_static(b"https")
        } else {
            Bytes::from_static(b"http")
        };
        Request {
            size_check: SizeCheck::new(server.max_request_header_size),
            server,
            io,
            remote_addr,
            tls_env,
            method: Bytes::new(),
            uri: Bytes::new(),
            scheme,
            authority: Bytes::new(),
            path: Bytes::new(),
            query: Bytes::new(),
            request_protocol: Protocol::HTTP_10,
            // lowest common version until the request line is read
            response_protocol: Protocol::HTTP_10,
            inheaders: Headers::new(),
            outheaders: Vec::new(),
            status: Bytes::from_static(b"200 OK"),
            content_length: 0,
            body: None,
            ready: false,
            started_request: false,
            sent_headers: false,
            close_connection: false,
            chunked_read: false,
            chunked_write: false,
            allow_message_body: true,
        }
    }

    // === parsing ===

    /// Parses the next request start-line and message-headers.
    ///
    /// Protocol violations are answered on the spot with a canned response
    /// and leave `ready` false; only socket-level failures surface as
    /// errors.
    pub(crate) fn parse(&mut self) -> crate::Result<()> {
        match self.read_request_line() {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(ref e) if e.is_max_size() => {
                self.simple_response(b"414 Request-URI Too Long", URI_TOO_LONG)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match self.read_request_headers() {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(ref e) if e.is_max_size() => {
                self.simple_response(b"413 Request Entity Too Large", HEADERS_TOO_LARGE)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.ready = true;
        Ok(())
    }

    fn read_request_line(&mut self) -> crate::Result<bool> {
        let mut line = self.size_check.read_line(&mut *self.io, None)?;

        // From here on a stalled peer earns a 408 rather than silence.
        self.started_request = true;

        if line.is_empty() {
            // the peer closed before sending a request
            return Ok(false);
        }

        if line.as_ref() == CRLF {
            // RFC 2616 §4.1: ignore one leading CRLF before the
            // request line. Only one, or idle peers could feed us
            // empty lines forever.
            line = self.size_check.read_line(&mut *self.io, None)?;
            if line.is_empty() {
                return Ok(false);
            }
        }

        if !line.ends_with(CRLF) {
            self.simple_response(b"400 Bad Request", Parse::Line.describe())?;
            return Ok(false);
        }

        let stripped = trim_bytes(&line);
        let mut fields = stripped.splitn(3, |&b| b == b' ');
        let (method, uri, proto_token) = match (fields.next(), fields.next(), fields.next()) {
            (Some(m), Some(u), Some(p)) if !m.is_empty() && !u.is_empty() => (m, u, p),
            _ => {
                self.simple_response(b"400 Bad Request", Parse::RequestLine.describe())?;
                return Ok(false);
            }
        };

        let req_protocol = match Protocol::parse(proto_token) {
            Some(p) => p,
            None => {
                self.simple_response(b"400 Bad Request", Parse::RequestLine.describe())?;
                return Ok(false);
            }
        };

        self.method = Bytes::copy_from_slice(method);
        self.uri = Bytes::copy_from_slice(uri);
        trace!(
            "request line: {} {}",
            String::from_utf8_lossy(method),
            String::from_utf8_lossy(uri)
        );

        let (scheme, authority, path) = match parse_request_uri(uri) {
            Ok(parts) => parts,
            Err(e) => {
                self.simple_response(b"400 Bad Request", e)?;
                return Ok(false);
            }
        };

        if let Some(ref path) = path {
            if path.contains(&b'#') {
                self.simple_response(b"400 Bad Request", Parse::UriFragment.describe())?;
                return Ok(false);
            }
        }

        if let Some(scheme) = scheme {
            self.scheme = scheme.into();
        }
        self.authority = authority.map(Bytes::from).unwrap_or_default();

        let path = path.unwrap_or_default();
        let (path, query) = match path.iter().position(|&b| b == b'?') {
            Some(q) => (&path[..q], &path[q + 1..]),
            None => (&path[..], &[][..]),
        };
        self.query = Bytes::copy_from_slice(query);

        // Unquote the path, but leave %2F intact: a URI must be split
        // into components before its escapes can be decoded, and a
        // decoded slash would change the component structure.
        self.path = match unquote_path(path) {
            Ok(p) => p.into(),
            Err(e) => {
                self.simple_response(b"400 Bad Request", e.describe())?;
                return Ok(false);
            }
        };

        // Respond with min(request, server). RFC 2616 §10.5.6: 505 only
        // when the major versions differ.
        let srv_protocol = self.server.protocol;
        if srv_protocol.major() != req_protocol.major() {
            self.simple_response(b"505 HTTP Version Not Supported", "")?;
            return Ok(false);
        }
        self.request_protocol = req_protocol;
        self.response_protocol = cmp::min(req_protocol, srv_protocol);

        Ok(true)
    }

    fn read_request_headers(&mut self) -> crate::Result<bool> {
        if let Err(e) = headers::read_headers(&mut *self.io, &mut self.size_check, &mut self.inheaders)
        {
            if let Some(parse) = e.parse_kind() {
                self.simple_response(b"400 Bad Request", parse.describe())?;
                return Ok(false);
            }
            return Err(e);
        }

        let content_length = self
            .inheaders
            .get("Content-Length")
            .map(parse_content_length);
        self.content_length = match content_length {
            Some(Some(n)) => n,
            Some(None) => {
                self.simple_response(b"400 Bad Request", Parse::ContentLength.describe())?;
                return Ok(false);
            }
            None => 0,
        };

        let mrbs = self.server.max_request_body_size;
        if mrbs != 0 && self.content_length > mrbs {
            self.simple_response(b"413 Request Entity Too Large", ENTITY_TOO_LARGE)?;
            return Ok(false);
        }

        // Persistent connection support.
        let connection = self.inheaders.get("Connection").unwrap_or(&[]);
        if self.response_protocol == Protocol::HTTP_11 {
            // both sides are HTTP/1.1: persistent unless asked otherwise
            if connection == &b"close"[..] {
                self.close_connection = true;
            }
        } else if connection != &b"Keep-Alive"[..] {
            // one side is HTTP/1.0: close unless explicitly kept alive
            self.close_connection = true;
        }

        // Transfer-Encoding support. Any token other than "chunked" is
        // unimplemented, even alongside a "chunked" we do understand.
        if self.response_protocol == Protocol::HTTP_11 {
            if let Some(te) = self.inheaders.get("Transfer-Encoding") {
                let te = te.to_vec();
                for enc in te.split(|&b| b == b',') {
                    let enc = trim_bytes(enc).to_ascii_lowercase();
                    if enc.is_empty() {
                        continue;
                    }
                    if enc == &b"chunked"[..] {
                        self.chunked_read = true;
                    } else {
                        self.simple_response(b"501 Unimplemented", "")?;
                        self.close_connection = true;
                        return Ok(false);
                    }
                }
            }
        }

        // Expect/continue (RFC 7231 §5.1.1): answer immediately rather
        // than making the client guess.
        if self.inheaders.get("Expect") == Some(&b"100-continue"[..]) {
            let mut msg = Vec::with_capacity(32);
            self.server.protocol.extend(&mut msg);
            msg.extend_from_slice(b" 100 Continue\r\n\r\n");
            let result = self.io.write_all(&msg).and_then(|()| self.io.flush());
            if let Err(e) = result {
                let e = Error::new_io(e);
                if !e.is_ignorable_socket() {
                    return Err(e);
                }
            }
        }

        Ok(true)
    }

    // === responding ===

    /// Installs the body reader and runs the gateway, then finishes the
    /// response framing.
    pub(crate) fn respond(&mut self) -> crate::Result<()> {
        let mrbs = self.server.max_request_body_size;
        self.body = Some(if self.chunked_read {
            BodyReader::Chunked(ChunkedReader::new(mrbs))
        } else {
            BodyReader::Known(KnownLengthReader::new(self.content_length))
        });

        let gateway = self.server.gateway.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| gateway.respond(self)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if e.is_body_too_large() && !self.sent_headers {
                    self.simple_response(b"413 Request Entity Too Large", ENTITY_TOO_LARGE)?;
                    self.close_connection = true;
                    return Ok(());
                }
                if e.is_status() {
                    // a 500 already went out from the failing write()
                    self.close_connection = true;
                    return Ok(());
                }
                return Err(e);
            }
            Err(panic) => return Err(Error::new_gateway(panic_message(panic))),
        }

        if self.ready && !self.sent_headers {
            self.sent_headers = true;
            if !self.send_headers()? {
                self.close_connection = true;
                return Ok(());
            }
        }
        if self.chunked_write {
            self.io.write_all(b"0\r\n\r\n").map_err(Error::new_io)?;
        }
        self.io.flush().map_err(Error::new_io)?;
        Ok(())
    }

    /// Writes body bytes to the client, sending the headers first if they
    /// have not gone out yet.
    pub fn write(&mut self, chunk: &[u8]) -> crate::Result<()> {
        if !self.sent_headers {
            self.sent_headers = true;
            if !self.send_headers()? {
                self.close_connection = true;
                return Err(Error::new_status());
            }
        }
        if !self.allow_message_body {
            return Ok(());
        }
        if self.chunked_write {
            if chunk.is_empty() {
                return Ok(());
            }
            let mut framed = Vec::with_capacity(chunk.len() + 16);
            write!(framed, "{:X}\r\n", chunk.len()).expect("writing to a Vec cannot fail");
            framed.extend_from_slice(chunk);
            framed.extend_from_slice(CRLF);
            self.io.write_all(&framed).map_err(Error::new_io)
        } else {
            self.io.write_all(chunk).map_err(Error::new_io)
        }
    }

    /// Assembles and sends the response status line and headers. Returns
    /// false when the stored status is unusable (a `500 Illegal Status`
    /// has then already been written).
    fn send_headers(&mut self) -> crate::Result<bool> {
        let hkeys: Vec<Vec<u8>> = self
            .outheaders
            .iter()
            .map(|(k, _)| k.to_ascii_lowercase())
            .collect();
        let has = |name: &[u8]| hkeys.iter().any(|k| k == name);

        let status: u16 = match std::str::from_utf8(&self.status[..cmp::min(3, self.status.len())])
            .ok()
            .and_then(|s| s.parse().ok())
        {
            Some(code) => code,
            None => {
                self.simple_response(
                    b"500 Illegal Status",
                    "Illegal response status from the gateway (non-numeric).",
                )?;
                return Ok(false);
            }
        };

        if status == 413 {
            // close to avoid reading garbage the client keeps sending
            self.close_connection = true;
        }

        if status < 200 || matches!(status, 204 | 205 | 304) {
            // RFC 7230 §3.3: no message body on 1xx/204/304 (nor on 205
            // in practice), so no length and no chunking either
            self.outheaders
                .retain(|(k, _)| !k.eq_ignore_ascii_case(b"content-length"));
            self.allow_message_body = false;
        } else if !has(b"content-length") {
            if self.response_protocol == Protocol::HTTP_11 && self.method.as_ref() != &b"HEAD"[..] {
                self.chunked_write = true;
                self.outheaders.push((
                    Bytes::from_static(b"Transfer-Encoding"),
                    Bytes::from_static(b"chunked"),
                ));
            } else {
                // closing the connection is the only way to mark the end
                self.close_connection = true;
            }
        }

        if !has(b"connection") {
            if self.response_protocol == Protocol::HTTP_11 {
                if self.close_connection {
                    self.outheaders
                        .push((Bytes::from_static(b"Connection"), Bytes::from_static(b"close")));
                }
            } else if !self.close_connection {
                self.outheaders.push((
                    Bytes::from_static(b"Connection"),
                    Bytes::from_static(b"Keep-Alive"),
                ));
            }
        }

        if !self.close_connection && !self.chunked_read {
            // The next pipelined request starts right after this body;
            // whatever the gateway left unread must come off the socket
            // before the response concludes.
            if let Some(BodyReader::Known(body)) = self.body.as_mut() {
                if body.remaining() > 0 {
                    body.drain(&mut *self.io)?;
                }
            }
        }

        if !has(b"date") {
            let mut value = Vec::with_capacity(date::DATE_VALUE_LENGTH);
            date::extend(&mut value);
            self.outheaders
                .push((Bytes::from_static(b"Date"), value.into()));
        }

        if !has(b"server") {
            self.outheaders.push((
                Bytes::from_static(b"Server"),
                Bytes::copy_from_slice(self.server.server_name.as_bytes()),
            ));
        }

        let mut buf = Vec::with_capacity(256);
        self.server.protocol.extend(&mut buf);
        buf.push(b' ');
        buf.extend_from_slice(&self.status);
        buf.extend_from_slice(CRLF);
        for (k, v) in &self.outheaders {
            buf.extend_from_slice(k);
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(v);
            buf.extend_from_slice(CRLF);
        }
        buf.extend_from_slice(CRLF);
        self.io.write_all(&buf).map_err(Error::new_io)?;
        Ok(true)
    }

    /// Writes a self-contained canned response.
    pub(crate) fn simple_response(&mut self, status: &[u8], msg: &str) -> crate::Result<()> {
        let mut status = status.to_vec();
        let mut connection_close = false;

        if status.starts_with(b"413") || status.starts_with(b"414") {
            self.close_connection = true;
            if self.response_protocol == Protocol::HTTP_11 {
                connection_close = true;
            } else {
                // HTTP/1.0 predates 413/414; send a plain 400 instead
                status = b"400 Bad Request".to_vec();
            }
        }

        let mut buf = Vec::with_capacity(128 + msg.len());
        self.server.protocol.extend(&mut buf);
        buf.push(b' ');
        buf.extend_from_slice(&status);
        buf.extend_from_slice(b"\r\nContent-Length: ");
        let mut len = itoa::Buffer::new();
        buf.extend_from_slice(len.format(msg.len()).as_bytes());
        buf.extend_from_slice(b"\r\nContent-Type: text/plain\r\n");
        if connection_close {
            buf.extend_from_slice(b"Connection: close\r\n");
        }
        buf.extend_from_slice(CRLF);
        buf.extend_from_slice(msg.as_bytes());

        let result = self.io.write_all(&buf).and_then(|()| self.io.flush());
        if let Err(e) = result {
            let e = Error::new_io(e);
            if !e.is_ignorable_socket() {
                return Err(e);
            }
        }
        Ok(())
    }

    // === gateway-facing surface ===

    /// Sets the response status from a code; the standard reason phrase
    /// is filled in, empty for unknown-but-legal codes.
    pub fn set_status(&mut self, code: u16) -> crate::Result<()> {
        self.apply_status(code, None)
    }

    /// Sets the response status from a `"code reason"` line (the reason
    /// is optional).
    pub fn set_status_line(&mut self, value: &str) -> crate::Result<()> {
        let value = if value.is_empty() { "200" } else { value };
        let (code, reason) = match value.split_once(' ') {
            Some((code, reason)) => (code, Some(reason.trim())),
            None => (value, None),
        };
        let code: u16 = code.parse().map_err(|_| Error::new_status())?;
        self.apply_status(code, reason)
    }

    fn apply_status(&mut self, code: u16, reason: Option<&str>) -> crate::Result<()> {
        if !(100..=599).contains(&code) {
            return Err(Error::new_status());
        }
        let reason = match reason {
            Some(reason) => reason,
            None => http::StatusCode::from_u16(code)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or(""),
        };
        let mut status = Vec::with_capacity(4 + reason.len());
        let mut digits = itoa::Buffer::new();
        status.extend_from_slice(digits.format(code).as_bytes());
        if !reason.is_empty() {
            status.push(b' ');
            status.extend_from_slice(reason.as_bytes());
        }
        self.status = status.into();
        Ok(())
    }

    /// Appends an outbound header. Duplicates are allowed and emitted in
    /// insertion order.
    pub fn add_header(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.outheaders.push((name.into(), value.into()));
    }

    /// Reads up to `size` body bytes (all remaining when `None`). An
    /// empty return means the body is exhausted.
    pub fn read_body(&mut self, size: Option<usize>) -> crate::Result<Bytes> {
        match self.body.as_mut() {
            Some(body) => body.read(&mut *self.io, size),
            None => Ok(Bytes::new()),
        }
    }

    /// Reads one body line (up to and including LF), bounded by `size`.
    pub fn read_body_line(&mut self, size: Option<usize>) -> crate::Result<Bytes> {
        match self.body.as_mut() {
            Some(body) => body.read_line(&mut *self.io, size),
            None => Ok(Bytes::new()),
        }
    }

    /// Reads body lines until exhaustion, or until at least `hint` bytes
    /// have accumulated (`0` = no limit).
    pub fn read_body_lines(&mut self, hint: usize) -> crate::Result<Vec<Bytes>> {
        let mut total = 0;
        let mut lines = Vec::new();
        loop {
            let line = self.read_body_line(None)?;
            if line.is_empty() {
                return Ok(lines);
            }
            total += line.len();
            lines.push(line);
            if hint > 0 && total >= hint {
                return Ok(lines);
            }
        }
    }

    /// Reads the trailer block of a chunked body. Fails unless the body
    /// was chunked and has been read to the end.
    pub fn read_trailer_lines(&mut self) -> crate::Result<Vec<Bytes>> {
        match self.body.as_mut() {
            Some(BodyReader::Chunked(body)) => body.read_trailer_lines(&mut *self.io),
            _ => Err(Error::new_parse(Parse::Trailer)),
        }
    }

    /// The request method, verbatim from the request line.
    pub fn method(&self) -> &[u8] {
        &self.method
    }

    /// The raw request URI.
    pub fn uri(&self) -> &[u8] {
        &self.uri
    }

    /// The URI scheme: from an absolute-URI request line, else `http` or
    /// `https` depending on the listener.
    pub fn scheme(&self) -> &[u8] {
        &self.scheme
    }

    /// The authority component (e.g. from a CONNECT request), possibly
    /// empty.
    pub fn authority(&self) -> &[u8] {
        &self.authority
    }

    /// The decoded request path. Percent-escapes are decoded except
    /// `%2F`, which stays literal.
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// The raw query string (never decoded).
    pub fn query(&self) -> &[u8] {
        &self.query
    }

    /// The protocol version the client spoke.
    pub fn protocol(&self) -> Protocol {
        self.request_protocol
    }

    /// The negotiated response protocol: `min(client, server)`.
    pub fn response_protocol(&self) -> Protocol {
        self.response_protocol
    }

    /// The parsed request headers.
    pub fn headers(&self) -> &Headers {
        &self.inheaders
    }

    /// The peer address, when the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// TLS facts about the connection (empty without TLS).
    pub fn tls_env(&self) -> &TlsEnv {
        self.tls_env
    }

    /// Whether the request body arrived with chunked transfer-coding.
    pub fn is_chunked(&self) -> bool {
        self.chunked_read
    }

    /// False once the status code ruled out a message body (1xx, 204,
    /// 205, 304); writes are then discarded.
    pub fn allow_message_body(&self) -> bool {
        self.allow_message_body
    }

    /// Asks the driver to close the connection after this response.
    pub fn set_close_connection(&mut self, close: bool) {
        self.close_connection = close;
    }

    /// The configured software identifier (`SERVER_SOFTWARE`).
    pub fn server_software(&self) -> &str {
        &self.server.software
    }

    pub(crate) fn ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn started_request(&self) -> bool {
        self.started_request
    }

    pub(crate) fn sent_headers(&self) -> bool {
        self.sent_headers
    }

    pub(crate) fn close_connection(&self) -> bool {
        self.close_connection
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &String::from_utf8_lossy(&self.method))
            .field("uri", &String::from_utf8_lossy(&self.uri))
            .field("protocol", &self.request_protocol)
            .field("ready", &self.ready)
            .field("sent_headers", &self.sent_headers)
            .field("close_connection", &self.close_connection)
            .finish()
    }
}

/// Splits a Request-URI into `(scheme, authority, path)`.
///
/// A Request-URI is one of `*`, an absolute-URI, an abs_path, or an
/// authority (RFC 2616 §5.1.2). A URI starting with `//` is an abs_path
/// whose first segment is empty, never a net_path.
fn parse_request_uri(
    uri: &[u8],
) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>), &'static str> {
    if uri == b"*" {
        return Ok((None, None, Some(uri.to_vec())));
    }

    if let Some(i) = find(uri, b"://") {
        if i > 0 && !uri[..i].contains(&b'?') {
            // an absolute-URI
            let scheme = uri[..i].to_ascii_lowercase();
            let remainder = &uri[i + 3..];
            let slash = match remainder.iter().position(|&b| b == b'/') {
                Some(slash) => slash,
                None => return Err("Malformed Request-URI: absolute-URI without a path"),
            };
            let authority = remainder[..slash].to_vec();
            let path = remainder[slash..].to_vec();
            return Ok((Some(scheme), Some(authority), Some(path)));
        }
    }

    if uri.starts_with(b"/") {
        // an abs_path
        Ok((None, None, Some(uri.to_vec())))
    } else {
        // an authority (e.g. CONNECT)
        Ok((None, Some(uri.to_vec()), None))
    }
}

/// Percent-decodes a path while preserving `%2F` (any case) literally:
/// the path is split on `%2F`, each atom is decoded, and the atoms are
/// rejoined with `%2F`.
fn unquote_path(path: &[u8]) -> Result<Vec<u8>, Parse> {
    let mut out = Vec::with_capacity(path.len());
    let mut first = true;
    for atom in split_quoted_slash(path) {
        if !first {
            out.extend_from_slice(b"%2F");
        }
        first = false;
        percent_decode_into(atom, &mut out)?;
    }
    Ok(out)
}

fn split_quoted_slash(path: &[u8]) -> Vec<&[u8]> {
    let mut atoms = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 3 <= path.len() {
        if path[i] == b'%' && path[i + 1] == b'2' && (path[i + 2] | 0x20) == b'f' {
            atoms.push(&path[start..i]);
            i += 3;
            start = i;
        } else {
            i += 1;
        }
    }
    atoms.push(&path[start..]);
    atoms
}

fn percent_decode_into(atom: &[u8], out: &mut Vec<u8>) -> Result<(), Parse> {
    let mut i = 0;
    while i < atom.len() {
        if atom[i] == b'%' {
            if i + 3 > atom.len() {
                return Err(Parse::UriEscape);
            }
            let hi = hex_val(atom[i + 1]).ok_or(Parse::UriEscape)?;
            let lo = hex_val(atom[i + 2]).ok_or(Parse::UriEscape)?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(atom[i]);
            i += 1;
        }
    }
    Ok(())
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn parse_content_length(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.parse().ok()
}

fn trim_bytes(mut b: &[u8]) -> &[u8] {
    while let Some((&first, rest)) = b.split_first() {
        if first.is_ascii_whitespace() {
            b = rest;
        } else {
            break;
        }
    }
    while let Some((&last, rest)) = b.split_last() {
        if last.is_ascii_whitespace() {
            b = rest;
        } else {
            break;
        }
    }
    b
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "gateway panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_forms() {
        assert_eq!(
            parse_request_uri(b"*").unwrap(),
            (None, None, Some(b"*".to_vec()))
        );
        assert_eq!(
            parse_request_uri(b"/a/b?c=d").unwrap(),
            (None, None, Some(b"/a/b?c=d".to_vec()))
        );
        assert_eq!(
            parse_request_uri(b"http://Example.com:8080/x/y").unwrap(),
            (
                Some(b"http".to_vec()),
                Some(b"Example.com:8080".to_vec()),
                Some(b"/x/y".to_vec())
            )
        );
        assert_eq!(
            parse_request_uri(b"example.com:443").unwrap(),
            (None, Some(b"example.com:443".to_vec()), None)
        );
        assert!(parse_request_uri(b"http://example.com").is_err());
    }

    #[test]
    fn double_slash_is_a_path() {
        assert_eq!(
            parse_request_uri(b"//evil/path").unwrap(),
            (None, None, Some(b"//evil/path".to_vec()))
        );
    }

    #[test]
    fn unquote_preserves_quoted_slash() {
        assert_eq!(unquote_path(b"/a%2Fb/c").unwrap(), b"/a%2Fb/c".to_vec());
        assert_eq!(unquote_path(b"/a%2fb").unwrap(), b"/a%2Fb".to_vec());
        assert_eq!(unquote_path(b"/a%20b").unwrap(), b"/a b".to_vec());
        assert_eq!(
            unquote_path(b"/x%2Fy%20z").unwrap(),
            b"/x%2Fy z".to_vec()
        );
        assert_eq!(unquote_path(b"/plain").unwrap(), b"/plain".to_vec());
    }

    #[test]
    fn unquote_rejects_bad_escapes() {
        assert!(unquote_path(b"/a%zz").is_err());
        assert!(unquote_path(b"/a%2").is_err());
        assert!(unquote_path(b"/a%").is_err());
    }

    #[test]
    fn content_length_is_strict() {
        assert_eq!(parse_content_length(b"42"), Some(42));
        assert_eq!(parse_content_length(b"0"), Some(0));
        assert_eq!(parse_content_length(b"-1"), None);
        assert_eq!(parse_content_length(b"4 2"), None);
        assert_eq!(parse_content_length(b"abc"), None);
    }
}
