use std::cmp;
use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::io::Buffered;
use crate::error::{Error, MaxSize, Parse};

/// Limit reads of an unbounded line to small slices so a missing LF
/// cannot make one header line buffer without bound.
const LINE_SLICE: usize = 256;

/// Read cap applied to the start-line + header phase.
///
/// Counts every byte consumed off the wire and fails as soon as the total
/// exceeds `maxlen` (0 disables the check).
#[derive(Debug)]
pub(crate) struct SizeCheck {
    bytes_read: u64,
    maxlen: u64,
}

impl SizeCheck {
    pub(crate) fn new(maxlen: u64) -> SizeCheck {
        SizeCheck {
            bytes_read: 0,
            maxlen,
        }
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn check(&self) -> crate::Result<()> {
        if self.maxlen != 0 && self.bytes_read > self.maxlen {
            return Err(Error::new_max_size(MaxSize::Headers));
        }
        Ok(())
    }

    /// Reads one line through the cap. Without an explicit `limit` the
    /// line is pulled in `LINE_SLICE`-sized pieces, checking the cap
    /// between pieces.
    pub(crate) fn read_line<T: Read + Write>(
        &mut self,
        io: &mut Buffered<T>,
        limit: Option<usize>,
    ) -> crate::Result<Bytes> {
        if limit.is_some() {
            let data = io.read_line(limit).map_err(Error::new_io)?;
            self.bytes_read += data.len() as u64;
            self.check()?;
            return Ok(data);
        }

        let mut res = BytesMut::new();
        loop {
            let data = io.read_line(Some(LINE_SLICE)).map_err(Error::new_io)?;
            self.bytes_read += data.len() as u64;
            self.check()?;
            res.extend_from_slice(&data);
            if data.len() < LINE_SLICE || data.last() == Some(&b'\n') {
                return Ok(res.freeze());
            }
        }
    }
}

/// Body reader for a request with a `Content-Length`.
///
/// Clamps every read to the declared length so the stream is positioned
/// exactly at the end of the body once drained; after exhaustion, reads
/// return empty without touching the socket.
#[derive(Debug)]
pub(crate) struct KnownLengthReader {
    remaining: u64,
}

impl KnownLengthReader {
    pub(crate) fn new(content_length: u64) -> KnownLengthReader {
        KnownLengthReader {
            remaining: content_length,
        }
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.remaining
    }

    pub(crate) fn read<T: Read + Write>(
        &mut self,
        io: &mut Buffered<T>,
        size: Option<usize>,
    ) -> crate::Result<Bytes> {
        if self.remaining == 0 {
            return Ok(Bytes::new());
        }
        let want = match size {
            Some(size) => cmp::min(size as u64, self.remaining),
            None => self.remaining,
        };
        let data = io.read(want as usize).map_err(Error::new_io)?;
        self.remaining -= data.len() as u64;
        Ok(data)
    }

    pub(crate) fn read_line<T: Read + Write>(
        &mut self,
        io: &mut Buffered<T>,
        size: Option<usize>,
    ) -> crate::Result<Bytes> {
        if self.remaining == 0 {
            return Ok(Bytes::new());
        }
        let want = match size {
            Some(size) => cmp::min(size as u64, self.remaining),
            None => self.remaining,
        };
        let data = io.read_line(Some(want as usize)).map_err(Error::new_io)?;
        self.remaining -= data.len() as u64;
        Ok(data)
    }

    /// Discards whatever the gateway left unread, so the next pipelined
    /// request starts at a clean boundary.
    pub(crate) fn drain<T: Read + Write>(&mut self, io: &mut Buffered<T>) -> crate::Result<()> {
        while self.remaining > 0 {
            let data = self.read(io, Some(64 * 1024))?;
            if data.is_empty() {
                break;
            }
        }
        Ok(())
    }
}

/// Body reader for `Transfer-Encoding: chunked` requests (RFC 7230 §4.1).
///
/// `bytes_read` counts framing and payload together and is checked against
/// `maxlen` (0 = unbounded). Chunk extensions are ignored. After the
/// zero-size chunk closes the body, [`read_trailer_lines`] may be called.
///
/// [`read_trailer_lines`]: ChunkedReader::read_trailer_lines
#[derive(Debug)]
pub(crate) struct ChunkedReader {
    buffer: BytesMut,
    bytes_read: u64,
    maxlen: u64,
    closed: bool,
}

impl ChunkedReader {
    pub(crate) fn new(maxlen: u64) -> ChunkedReader {
        ChunkedReader {
            buffer: BytesMut::new(),
            bytes_read: 0,
            maxlen,
            closed: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_max(&self) -> crate::Result<()> {
        if self.maxlen != 0 && self.bytes_read > self.maxlen {
            return Err(Error::new_max_size(MaxSize::Body));
        }
        Ok(())
    }

    /// Pulls the next chunk into the spillover buffer, or marks the body
    /// closed on the zero-size chunk.
    fn fetch<T: Read + Write>(&mut self, io: &mut Buffered<T>) -> crate::Result<()> {
        if self.closed {
            return Ok(());
        }

        let line = io.read_line(None).map_err(Error::new_io)?;
        self.bytes_read += line.len() as u64;
        self.check_max()?;
        if line.is_empty() {
            return Err(Error::new_parse(Parse::Chunk));
        }

        let chunk_size = match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => size,
            Ok(httparse::Status::Partial) | Err(_) => {
                return Err(Error::new_parse(Parse::Chunk));
            }
        };
        trace!("chunk size {}", chunk_size);

        if chunk_size == 0 {
            self.closed = true;
            return Ok(());
        }

        if self.maxlen != 0 && self.bytes_read + chunk_size > self.maxlen {
            return Err(Error::new_max_size(MaxSize::Body));
        }

        let chunk = io.read(chunk_size as usize).map_err(Error::new_io)?;
        self.bytes_read += chunk.len() as u64;
        self.buffer.extend_from_slice(&chunk);

        let crlf = io.read(2).map_err(Error::new_io)?;
        self.bytes_read += crlf.len() as u64;
        if crlf.as_ref() != b"\r\n" {
            return Err(Error::new_parse(Parse::Chunk));
        }
        Ok(())
    }

    pub(crate) fn read<T: Read + Write>(
        &mut self,
        io: &mut Buffered<T>,
        size: Option<usize>,
    ) -> crate::Result<Bytes> {
        let mut data = BytesMut::new();
        loop {
            if let Some(size) = size {
                if data.len() >= size {
                    return Ok(data.freeze());
                }
            }

            if self.buffer.is_empty() {
                self.fetch(io)?;
                if self.buffer.is_empty() {
                    return Ok(data.freeze());
                }
            }

            match size {
                Some(size) => {
                    let take = cmp::min(size - data.len(), self.buffer.len());
                    data.extend_from_slice(&self.buffer.split_to(take));
                }
                None => {
                    data.extend_from_slice(&self.buffer.split_off(0));
                }
            }
        }
    }

    pub(crate) fn read_line<T: Read + Write>(
        &mut self,
        io: &mut Buffered<T>,
        size: Option<usize>,
    ) -> crate::Result<Bytes> {
        let mut data = BytesMut::new();
        loop {
            if let Some(size) = size {
                if data.len() >= size {
                    return Ok(data.freeze());
                }
            }

            if self.buffer.is_empty() {
                self.fetch(io)?;
                if self.buffer.is_empty() {
                    return Ok(data.freeze());
                }
            }

            let newline_pos = self.buffer.iter().position(|&b| b == b'\n');
            let available = match newline_pos {
                Some(pos) => pos + 1,
                None => self.buffer.len(),
            };
            let take = match size {
                Some(size) => cmp::min(size - data.len(), available),
                None => available,
            };
            data.extend_from_slice(&self.buffer.split_to(take));
            if newline_pos.map(|pos| take == pos + 1).unwrap_or(false) {
                return Ok(data.freeze());
            }
        }
    }

    /// Reads the trailer block after the body has closed: yields each
    /// header-shaped line, stopping at the bare CRLF.
    pub(crate) fn read_trailer_lines<T: Read + Write>(
        &mut self,
        io: &mut Buffered<T>,
    ) -> crate::Result<Vec<Bytes>> {
        if !self.closed {
            return Err(Error::new_parse(Parse::Trailer));
        }

        let mut lines = Vec::new();
        loop {
            let line = io.read_line(None).map_err(Error::new_io)?;
            if line.is_empty() {
                return Err(Error::new_parse(Parse::HeaderEnd));
            }

            self.bytes_read += line.len() as u64;
            self.check_max()?;

            if line.as_ref() == b"\r\n" {
                return Ok(lines);
            }
            if !line.ends_with(b"\r\n") {
                return Err(Error::new_parse(Parse::Line));
            }
            let body = &line[..line.len() - 2];
            let is_fold = matches!(body.first(), Some(&b' ') | Some(&b'\t'));
            if !is_fold && !body.contains(&b':') {
                return Err(Error::new_parse(Parse::Trailer));
            }
            lines.push(line);
        }
    }
}

/// The reader installed on a request before the gateway runs: exactly one
/// of the length-delimited variants.
#[derive(Debug)]
pub(crate) enum BodyReader {
    Known(KnownLengthReader),
    Chunked(ChunkedReader),
}

impl BodyReader {
    pub(crate) fn read<T: Read + Write>(
        &mut self,
        io: &mut Buffered<T>,
        size: Option<usize>,
    ) -> crate::Result<Bytes> {
        match self {
            BodyReader::Known(r) => r.read(io, size),
            BodyReader::Chunked(r) => r.read(io, size),
        }
    }

    pub(crate) fn read_line<T: Read + Write>(
        &mut self,
        io: &mut Buffered<T>,
        size: Option<usize>,
    ) -> crate::Result<Bytes> {
        match self {
            BodyReader::Known(r) => r.read_line(io, size),
            BodyReader::Chunked(r) => r.read_line(io, size),
        }
    }
}
