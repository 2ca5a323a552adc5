use std::cmp;
use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};
use tracing::trace;

/// How much to ask the transport for on each refill.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

/// Buffered reader/writer over one blocking transport.
///
/// The read side keeps a growable byte buffer so that pipelined requests
/// read ahead of the current one stay available to the next parse. The
/// write side is deliberately unbuffered: response headers are assembled
/// into flat buffers by the caller and pushed out in single writes.
///
/// `Interrupted` (EINTR) is retried transparently. `WouldBlock` and
/// `TimedOut` are *not*: on a blocking socket carrying an `SO_RCVTIMEO`
/// they mean the peer stalled, and the connection driver decides between
/// a silent close and a `408`.
pub(crate) struct Buffered<T> {
    io: T,
    read_buf: BytesMut,
    bytes_read: u64,
    bytes_written: u64,
}

impl<T: Read + Write> Buffered<T> {
    pub(crate) fn new(io: T) -> Buffered<T> {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Cumulative bytes pulled off the transport, read-ahead included.
    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Cumulative bytes pushed to the transport.
    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub(crate) fn io_mut(&mut self) -> &mut T {
        &mut self.io
    }

    fn fill_read_buf(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; INIT_BUFFER_SIZE];
        let n = loop {
            match self.io.read(&mut chunk) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        trace!("read {} bytes", n);
        self.read_buf.extend_from_slice(&chunk[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }

    /// Reads exactly `n` bytes; a short return means the peer closed.
    pub(crate) fn read(&mut self, n: usize) -> io::Result<Bytes> {
        while self.read_buf.len() < n {
            if self.fill_read_buf()? == 0 {
                break;
            }
        }
        let take = cmp::min(n, self.read_buf.len());
        Ok(self.read_buf.split_to(take).freeze())
    }

    /// Reads up to and including the first LF, or `limit` bytes, whichever
    /// comes first. An empty return means EOF.
    pub(crate) fn read_line(&mut self, limit: Option<usize>) -> io::Result<Bytes> {
        let mut searched = 0;
        loop {
            if let Some(pos) = self.read_buf[searched..].iter().position(|&b| b == b'\n') {
                let mut end = searched + pos + 1;
                if let Some(limit) = limit {
                    end = cmp::min(end, limit);
                }
                return Ok(self.read_buf.split_to(end).freeze());
            }
            searched = self.read_buf.len();
            if let Some(limit) = limit {
                if searched >= limit {
                    return Ok(self.read_buf.split_to(limit).freeze());
                }
            }
            if self.fill_read_buf()? == 0 {
                let rest = self.read_buf.len();
                return Ok(self.read_buf.split_to(rest).freeze());
            }
        }
    }

    /// Writes the whole buffer, looping on partial sends.
    pub(crate) fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.io.write_all(buf)?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.io.flush()
    }
}
