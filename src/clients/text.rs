use bytes::{BufMut, Bytes, BytesMut};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::trace;

use super::buffer::ReadBuffer;
use super::pipeline::{batch_stats, Pipeliner};
use super::Store;
use crate::config::WorkloadConfig;
use crate::error::{SodaError, SodaResult};
use crate::stats::{StatsSink, Timings};
use crate::workload::{OpKind, Operation};

/// Timing bucket for a whole text-protocol flush.
pub const BATCH_TIMING: &str = "batch";

/// memcached text protocol client. Each flush writes the whole queue and
/// reads every reply before returning.
pub struct TextClient<S = TcpStream> {
    stream: S,
    read_buf: ReadBuffer,
    out: BytesMut,
    pipeline: Pipeliner,
    expiration: u32,
    ops: u64,
    error_responses: u64,
    timings: Timings,
    sink: Option<Arc<dyn StatsSink>>,
}

impl<S: Read + Write> TextClient<S> {
    pub fn new(stream: S, config: &WorkloadConfig, sink: Option<Arc<dyn StatsSink>>) -> Self {
        Self {
            stream,
            read_buf: ReadBuffer::new(),
            out: BytesMut::new(),
            pipeline: Pipeliner::new(config.effective_batch()),
            expiration: config.expiration,
            ops: 0,
            error_responses: 0,
            timings: Timings::new(),
            sink,
        }
    }

    pub fn queued(&self) -> usize {
        self.pipeline.len()
    }

    fn encode(&mut self, op: &Operation) {
        match op.kind {
            OpKind::Get => {
                self.out.put_slice(format!("get {}\r\n", op.key).as_bytes());
            }
            OpKind::Delete => {
                self.out.put_slice(format!("delete {}\r\n", op.key).as_bytes());
            }
            kind => {
                let payload = op.payload_bytes();
                let line = format!("{} {} 0 {} {}\r\n", kind, op.key, self.expiration, payload.len());
                self.out.put_slice(line.as_bytes());
                self.out.put_slice(payload);
                self.out.put_slice(b"\r\n");
            }
        }
    }

    fn read_line(&mut self) -> SodaResult<Bytes> {
        self.read_buf.read_line(&mut self.stream)
    }

    /// Reads one reply for an operation of `kind`.
    fn recv(&mut self, kind: OpKind) -> SodaResult<()> {
        if kind == OpKind::Get {
            return self.recv_get();
        }
        let line = self.read_line()?;
        match &line[..] {
            b"STORED" | b"DELETED" => {}
            other => {
                self.error_responses += 1;
                trace!("{} reply: {}", kind, String::from_utf8_lossy(other));
            }
        }
        Ok(())
    }

    /// Consumes `VALUE` blocks up to the closing `END`.
    fn recv_get(&mut self) -> SodaResult<()> {
        let mut hit = false;
        loop {
            let line = self.read_line()?;
            if &line[..] == b"END" {
                break;
            }
            if line.starts_with(b"VALUE ") {
                let len = value_length(&line)?;
                let data = self.read_buf.read_exact(&mut self.stream, len + 2)?;
                if !data.ends_with(b"\r\n") {
                    return Err(SodaError::protocol("value block not terminated by CRLF"));
                }
                hit = true;
                continue;
            }
            if is_error_reply(&line) {
                self.error_responses += 1;
                trace!("get reply: {}", String::from_utf8_lossy(&line));
                return Ok(());
            }
            return Err(SodaError::protocol(format!(
                "unexpected get reply: {}",
                String::from_utf8_lossy(&line)
            )));
        }
        if !hit {
            self.error_responses += 1;
        }
        Ok(())
    }
}

/// Byte count from `VALUE <key> <flags> <bytes> [<cas>]`.
fn value_length(line: &[u8]) -> SodaResult<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| SodaError::protocol("VALUE line is not UTF-8"))?;
    text.split_whitespace()
        .nth(3)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| SodaError::protocol(format!("malformed VALUE line: {}", text)))
}

fn is_error_reply(line: &[u8]) -> bool {
    line == b"ERROR" || line.starts_with(b"CLIENT_ERROR") || line.starts_with(b"SERVER_ERROR")
}

impl<S: Read + Write + Send> Store for TextClient<S> {
    fn enqueue(&mut self, op: Operation) -> SodaResult<()> {
        if self.pipeline.push(op) {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> SodaResult<()> {
        let ops = self.pipeline.take();
        if ops.is_empty() {
            return Ok(());
        }

        let mut stats = batch_stats(&ops, SystemTime::now());
        let clock = Instant::now();
        for op in &ops {
            self.encode(op);
        }
        self.stream.write_all(&self.out)?;
        self.out.clear();
        for op in &ops {
            self.recv(op.kind)?;
            self.ops += 1;
        }

        self.timings.add_timing_sample(BATCH_TIMING, clock.elapsed());
        if let Some(sink) = &self.sink {
            stats.end = SystemTime::now();
            sink.ops_stats(&stats);
        }
        Ok(())
    }

    fn finish(&mut self) -> SodaResult<()> {
        self.flush()?;
        self.stream.flush()?;
        Ok(())
    }

    fn num_ops(&self) -> u64 {
        self.ops
    }

    fn error_responses(&self) -> u64 {
        self.error_responses
    }

    fn timings(&self) -> &Timings {
        &self.timings
    }
}
