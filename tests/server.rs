//! End-to-end tests over real sockets.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hearth::{Builder, Gateway, Request, Server, ServerStats};

fn serve_with(
    gateway: impl Gateway,
    tweak: impl FnOnce(Builder) -> Builder,
) -> (Arc<Server>, SocketAddr, thread::JoinHandle<()>) {
    let _ = pretty_env_logger::try_init();
    let builder = Server::builder(("127.0.0.1", 0))
        .min_threads(2)
        .timeout(Duration::from_secs(2))
        .shutdown_timeout(Duration::from_secs(2));
    let server = Arc::new(tweak(builder).build(gateway).expect("build server"));
    let runner = server.clone();
    let handle = thread::spawn(move || {
        let _ = runner.start();
    });
    assert!(server.wait_ready(Duration::from_secs(5)), "server never came up");
    let addr = server.local_addr().expect("bound tcp address");
    (server, addr, handle)
}

fn serve(gateway: impl Gateway) -> (Arc<Server>, SocketAddr, thread::JoinHandle<()>) {
    serve_with(gateway, |b| b)
}

/// Writes `wire` and reads until the server closes the connection.
fn roundtrip(addr: SocketAddr, wire: &[u8]) -> String {
    let mut sock = TcpStream::connect(addr).expect("connect");
    sock.write_all(wire).expect("send request");
    let mut response = Vec::new();
    sock.read_to_end(&mut response).expect("read response");
    String::from_utf8_lossy(&response).into_owned()
}

fn ok_gateway(req: &mut Request<'_>) -> hearth::Result<()> {
    req.set_status(200)?;
    req.write(b"ok")
}

fn echo_gateway(req: &mut Request<'_>) -> hearth::Result<()> {
    let body = req.read_body(None)?;
    req.set_status(200)?;
    req.add_header("Content-Type", "application/octet-stream");
    req.write(&body)
}

#[test]
fn pipelined_requests_answered_in_order_on_one_socket() {
    let (server, addr, handle) = serve(ok_gateway);

    let wire = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n\
                 GET /b HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n";
    let text = roundtrip(addr, wire);

    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2, "{}", text);
    assert_eq!(text.matches("Transfer-Encoding: chunked").count(), 2);
    assert_eq!(text.matches("2\r\nok\r\n0\r\n\r\n").count(), 2);
    assert!(text.ends_with("0\r\n\r\n"));

    server.stop();
    handle.join().unwrap();
}

#[test]
fn chunked_request_body_reaches_the_gateway_reassembled() {
    let (server, addr, handle) = serve(echo_gateway);

    let wire = b"POST /echo HTTP/1.1\r\nHost: h\r\n\
                 Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
                 5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let text = roundtrip(addr, wire);

    assert!(text.starts_with("HTTP/1.1 200 OK"), "{}", text);
    assert!(text.contains("B\r\nhello world\r\n"), "{}", text);

    server.stop();
    handle.join().unwrap();
}

#[test]
fn oversize_headers_rejected_with_close() {
    let (server, addr, handle) =
        serve_with(ok_gateway, |b| b.max_request_header_size(1024));

    let mut wire = b"GET / HTTP/1.1\r\nHost: h\r\n".to_vec();
    wire.extend_from_slice(format!("X-Padding: {}\r\n", "p".repeat(4096)).as_bytes());
    wire.extend_from_slice(b"\r\n");
    let text = roundtrip(addr, &wire);

    let too_large = text.starts_with("HTTP/1.1 413") || text.starts_with("HTTP/1.1 414");
    assert!(too_large, "{}", text);
    assert!(text.contains("Connection: close"), "{}", text);
    // roundtrip() read to EOF, so the server closed the connection

    server.stop();
    handle.join().unwrap();
}

#[test]
fn quoted_slash_is_preserved_in_the_path() {
    let paths = Arc::new(Mutex::new(Vec::new()));
    let sink = paths.clone();
    let gateway = move |req: &mut Request<'_>| {
        sink.lock().unwrap().push(req.path().to_vec());
        req.set_status(200)?;
        req.write(b"ok")
    };
    let (server, addr, handle) = serve(gateway);

    roundtrip(addr, b"GET /a%2Fb/c HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    roundtrip(addr, b"GET /a%20b HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");

    let paths = paths.lock().unwrap();
    assert_eq!(paths[0], b"/a%2Fb/c");
    assert_eq!(paths[1], b"/a b");

    server.stop();
    handle.join().unwrap();
}

#[test]
fn expect_100_continue_is_answered_before_the_body_is_sent() {
    let (server, addr, handle) = serve(echo_gateway);

    let mut sock = TcpStream::connect(addr).expect("connect");
    sock.write_all(
        b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\
          Expect: 100-continue\r\nConnection: close\r\n\r\n",
    )
    .unwrap();

    // the interim response arrives before any body byte is written
    let expected = b"HTTP/1.1 100 Continue\r\n\r\n";
    let mut interim = vec![0u8; expected.len()];
    sock.read_exact(&mut interim).unwrap();
    assert_eq!(&interim, expected);

    sock.write_all(b"hi").unwrap();
    let mut rest = Vec::new();
    sock.read_to_end(&mut rest).unwrap();
    let text = String::from_utf8_lossy(&rest);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "{}", text);
    assert!(text.contains("2\r\nhi\r\n"), "{}", text);

    server.stop();
    handle.join().unwrap();
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let (server, addr, handle) = serve(ok_gateway);

    let mut sock = TcpStream::connect(addr).expect("connect");
    sock.write_all(b"GET /1 HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let first = read_until(&mut sock, b"0\r\n\r\n");
    assert!(first.starts_with("HTTP/1.1 200 OK"), "{}", first);

    sock.write_all(b"GET /2 HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut rest = Vec::new();
    sock.read_to_end(&mut rest).unwrap();
    let second = String::from_utf8_lossy(&rest);
    assert!(second.starts_with("HTTP/1.1 200 OK"), "{}", second);

    server.stop();
    handle.join().unwrap();
}

#[test]
fn http10_response_is_close_delimited() {
    let (server, addr, handle) = serve(ok_gateway);

    let text = roundtrip(addr, b"GET / HTTP/1.0\r\n\r\n");
    assert!(text.starts_with("HTTP/1.1 200 OK"), "{}", text);
    assert!(!text.contains("Transfer-Encoding"));
    assert!(!text.contains("Connection: Keep-Alive"));
    assert!(text.ends_with("\r\n\r\nok"), "{}", text);

    server.stop();
    handle.join().unwrap();
}

#[test]
fn version_major_mismatch_gets_505() {
    let (server, addr, handle) = serve(ok_gateway);
    let text = roundtrip(addr, b"GET / HTTP/2.0\r\nHost: h\r\n\r\n");
    assert!(text.starts_with("HTTP/1.1 505"), "{}", text);
    server.stop();
    handle.join().unwrap();
}

#[test]
fn unknown_transfer_encoding_gets_501() {
    let (server, addr, handle) = serve(ok_gateway);
    let text = roundtrip(
        addr,
        b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: gzip\r\n\r\n",
    );
    assert!(text.starts_with("HTTP/1.1 501"), "{}", text);
    server.stop();
    handle.join().unwrap();
}

#[test]
fn malformed_request_line_gets_400() {
    let (server, addr, handle) = serve(ok_gateway);
    let text = roundtrip(addr, b"NONSENSE\r\n\r\n");
    assert!(text.starts_with("HTTP/1.1 400 Bad Request"), "{}", text);
    server.stop();
    handle.join().unwrap();
}

#[test]
fn head_responses_are_never_chunked() {
    let gateway = |req: &mut Request<'_>| -> hearth::Result<()> {
        req.set_status(200)?;
        // a HEAD response carries no body
        Ok(())
    };
    let (server, addr, handle) = serve(gateway);
    let text = roundtrip(addr, b"HEAD / HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(text.starts_with("HTTP/1.1 200 OK"), "{}", text);
    assert!(!text.contains("Transfer-Encoding"), "{}", text);
    // length is unknowable, so the server closes instead
    assert!(text.contains("Connection: close"), "{}", text);
    server.stop();
    handle.join().unwrap();
}

#[test]
fn stop_returns_within_the_grace_window() {
    let (server, addr, handle) = serve(ok_gateway);

    // park an idle keep-alive connection on a worker
    let sock = TcpStream::connect(addr).expect("connect");

    let started = Instant::now();
    server.stop();
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_secs(4),
        "stop took {:?}",
        elapsed
    );

    drop(sock);
    handle.join().unwrap();
}

#[test]
fn stats_account_for_served_requests() {
    let stats = Arc::new(ServerStats::new(true));
    let (server, addr, handle) = serve_with(ok_gateway, {
        let stats = stats.clone();
        move |b| b.stats(stats)
    });

    roundtrip(addr, b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    server.stop();
    handle.join().unwrap();

    let snap = stats.snapshot();
    assert!(snap.accepts >= 1, "{:?}", snap);
    assert!(snap.requests >= 1, "{:?}", snap);
    assert!(snap.bytes_read > 0 && snap.bytes_written > 0, "{:?}", snap);
}

/// A TLS adapter that treats every connection as plaintext, for driving
/// the HTTPS-only rejection path without a TLS stack.
struct PlaintextOnlyTls;

impl hearth::TlsAdapter for PlaintextOnlyTls {
    fn wrap(
        &self,
        sock: TcpStream,
    ) -> Result<(Box<dyn hearth::Transport>, hearth::TlsEnv), hearth::TlsError> {
        Err(hearth::TlsError::Plaintext(sock))
    }
}

#[test]
fn plaintext_on_a_tls_port_gets_a_raw_400() {
    let (server, addr, handle) =
        serve_with(ok_gateway, |b| b.tls(Arc::new(PlaintextOnlyTls)));

    // the stub rejects at accept time, so the 400 arrives without the
    // client sending a byte
    let mut sock = TcpStream::connect(addr).expect("connect");
    let mut response = Vec::new();
    sock.read_to_end(&mut response).expect("read response");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request"), "{}", text);
    assert!(text.contains("Content-Type: text/plain"), "{}", text);
    assert!(text.contains("only speaks HTTPS"), "{}", text);

    server.stop();
    handle.join().unwrap();
}

#[cfg(unix)]
#[test]
fn serves_over_a_unix_domain_socket() {
    use std::os::unix::net::UnixStream;

    let path = std::env::temp_dir().join(format!("hearth-test-{}.sock", std::process::id()));
    let _ = pretty_env_logger::try_init();
    let server = Arc::new(
        Server::builder(path.clone())
            .min_threads(1)
            .timeout(Duration::from_secs(2))
            .shutdown_timeout(Duration::from_secs(2))
            .build(ok_gateway)
            .expect("build server"),
    );
    let runner = server.clone();
    let handle = thread::spawn(move || {
        let _ = runner.start();
    });
    assert!(server.wait_ready(Duration::from_secs(5)));

    let mut sock = UnixStream::connect(&path).expect("connect unix socket");
    sock.write_all(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();
    let _ = sock.shutdown(Shutdown::Write);
    let mut response = Vec::new();
    sock.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "{}", text);

    server.stop();
    handle.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

/// Reads until `marker` has been seen, returning everything so far.
fn read_until(sock: &mut TcpStream, marker: &[u8]) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = sock.read(&mut buf).expect("read");
        assert!(n > 0, "connection closed before marker");
        data.extend_from_slice(&buf[..n]);
        if data.windows(marker.len()).any(|w| w == marker) {
            return String::from_utf8_lossy(&data).into_owned();
        }
    }
}
