//! An in-memory transport for unit tests.

use std::cmp;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

/// A fake connection: reads drain a pre-seeded script, writes accumulate
/// into a buffer that stays observable after the transport is boxed away.
#[derive(Debug, Default)]
pub(crate) struct Duplex {
    input: Vec<u8>,
    pos: usize,
    error: Option<io::Error>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl Duplex {
    pub(crate) fn new(input: impl Into<Vec<u8>>) -> Duplex {
        Duplex {
            input: input.into(),
            pos: 0,
            error: None,
            output: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Like [`new`], but once the script is drained the next read fails
    /// with `error` (subsequent reads report EOF).
    ///
    /// [`new`]: Duplex::new
    pub(crate) fn with_error(input: impl Into<Vec<u8>>, error: io::Error) -> Duplex {
        Duplex {
            error: Some(error),
            ..Duplex::new(input)
        }
    }

    /// A handle to everything written so far.
    pub(crate) fn output(&self) -> Arc<Mutex<Vec<u8>>> {
        self.output.clone()
    }
}

impl Read for Duplex {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.input.len() {
            if let Some(err) = self.error.take() {
                return Err(err);
            }
        }
        let n = cmp::min(buf.len(), self.input.len() - self.pos);
        buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for Duplex {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
