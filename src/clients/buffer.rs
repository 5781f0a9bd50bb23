use bytes::{Bytes, BytesMut};
use std::io::{self, Read};

use crate::error::{SodaError, SodaResult};

const READ_CHUNK: usize = 16 * 1024;

/// Reassembles fixed-size frames and CRLF lines out of partial socket reads.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buf: BytesMut,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns exactly `n` bytes, reading more as needed. End of stream
    /// before `n` bytes is `ConnectionLost`.
    pub fn read_exact<R: Read>(&mut self, reader: &mut R, n: usize) -> SodaResult<Bytes> {
        while self.buf.len() < n {
            if self.fill(reader)? == 0 {
                return Err(SodaError::ConnectionLost {
                    needed: n,
                    got: self.buf.len(),
                });
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Returns the next line with its `\r\n` removed.
    pub fn read_line<R: Read>(&mut self, reader: &mut R) -> SodaResult<Bytes> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = find_crlf(&self.buf[scanned..]) {
                let end = scanned + pos;
                let line = self.buf.split_to(end + 2).freeze();
                return Ok(line.slice(..end));
            }
            // a trailing '\r' may pair with the next chunk's '\n'
            scanned = self.buf.len().saturating_sub(1);
            if self.fill(reader)? == 0 {
                return Err(SodaError::ConnectionLost {
                    needed: self.buf.len() + 2,
                    got: self.buf.len(),
                });
            }
        }
    }

    fn fill<R: Read>(&mut self, reader: &mut R) -> SodaResult<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk) {
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}
