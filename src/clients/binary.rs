//! memcached binary protocol client.
//!
//! Every request carries a 24-byte big-endian header. A flush times the
//! first queued operation on its own, then writes the rest as one pipelined
//! batch whose responses are read at the start of the next flush.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::{debug, trace};

use super::buffer::ReadBuffer;
use super::pipeline::{batch_stats, InFlight, Pipeliner};
use super::Store;
use crate::config::WorkloadConfig;
use crate::error::{SodaError, SodaResult};
use crate::stats::{BatchStats, StatsSink, Timings};
use crate::workload::{ArpaVerb, OpKind, Operation};

pub const REQ_MAGIC: u8 = 0x80;
pub const RES_MAGIC: u8 = 0x81;
pub const HEADER_LEN: usize = 24;
pub const STATUS_SUCCESS: u16 = 0x0000;

pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const APPEND: u8 = 0x0e;
    pub const PREPEND: u8 = 0x0f;
    pub const SASL_AUTH: u8 = 0x21;
}

pub fn arpa_opcode(verb: ArpaVerb) -> u8 {
    match verb {
        ArpaVerb::Add => opcode::ADD,
        ArpaVerb::Replace => opcode::REPLACE,
        ArpaVerb::Append => opcode::APPEND,
        ArpaVerb::Prepend => opcode::PREPEND,
    }
}

/// Routing id: bits 16..31 of the key's CRC32, masked to the partition count.
pub fn vbucket_id(key: &[u8], vbuckets: u32) -> u16 {
    let mask = vbuckets.max(1) - 1;
    (((crc32fast::hash(key) >> 16) & 0x7fff) & mask) as u16
}

/// Appends one request frame to `buf`.
pub fn encode_request(
    buf: &mut BytesMut,
    opcode: u8,
    key: &[u8],
    extras: &[u8],
    value: &[u8],
    vbucket: u16,
    opaque: u32,
) {
    let body_len = extras.len() + key.len() + value.len();
    buf.reserve(HEADER_LEN + body_len);
    buf.put_u8(REQ_MAGIC);
    buf.put_u8(opcode);
    buf.put_u16(key.len() as u16);
    buf.put_u8(extras.len() as u8);
    buf.put_u8(0);
    buf.put_u16(vbucket);
    buf.put_u32(body_len as u32);
    buf.put_u32(opaque);
    buf.put_u64(0);
    buf.put_slice(extras);
    buf.put_slice(key);
    buf.put_slice(value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn decode(mut buf: &[u8]) -> SodaResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(SodaError::protocol(format!(
                "short response header: {} bytes",
                buf.len()
            )));
        }
        let magic = buf.get_u8();
        if magic != RES_MAGIC {
            return Err(SodaError::protocol(format!("bad response magic 0x{:02x}", magic)));
        }
        Ok(Self {
            opcode: buf.get_u8(),
            key_len: buf.get_u16(),
            extras_len: buf.get_u8(),
            data_type: buf.get_u8(),
            status: buf.get_u16(),
            body_len: buf.get_u32(),
            opaque: buf.get_u32(),
            cas: buf.get_u64(),
        })
    }
}

/// What the next response must echo back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    opcode: u8,
    opaque: u32,
}

pub struct BinaryClient<S = TcpStream> {
    stream: S,
    read_buf: ReadBuffer,
    out: BytesMut,
    pipeline: Pipeliner,
    in_flight: InFlight<Pending>,
    next_opaque: u32,
    expiration: u32,
    vbuckets: u32,
    ops: u64,
    error_responses: u64,
    timings: Timings,
    sink: Option<Arc<dyn StatsSink>>,
}

impl<S: Read + Write> BinaryClient<S> {
    pub fn new(stream: S, config: &WorkloadConfig, sink: Option<Arc<dyn StatsSink>>) -> Self {
        Self {
            stream,
            read_buf: ReadBuffer::new(),
            out: BytesMut::new(),
            pipeline: Pipeliner::new(config.effective_batch()),
            in_flight: InFlight::new(),
            next_opaque: 0,
            expiration: config.expiration,
            vbuckets: config.vbuckets,
            ops: 0,
            error_responses: 0,
            timings: Timings::new(),
            sink,
        }
    }

    /// SASL PLAIN handshake. Must run before any operation is queued.
    pub fn authenticate(&mut self, user: &str, password: &str) -> SodaResult<()> {
        let value = format!("\0{}\0{}", user, password);
        let pending = self.encode(opcode::SASL_AUTH, b"PLAIN", &[], value.as_bytes(), 0);
        self.write_out()?;
        let status = self.recv(pending)?;
        if status != STATUS_SUCCESS {
            return Err(SodaError::Auth {
                user: user.to_string(),
                status,
            });
        }
        debug!("authenticated as {}", user);
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued(&self) -> usize {
        self.pipeline.len()
    }

    fn encode(&mut self, opcode: u8, key: &[u8], extras: &[u8], value: &[u8], vbucket: u16) -> Pending {
        let opaque = self.next_opaque;
        self.next_opaque = self.next_opaque.wrapping_add(1);
        encode_request(&mut self.out, opcode, key, extras, value, vbucket, opaque);
        Pending { opcode, opaque }
    }

    fn encode_op(&mut self, op: &Operation) -> Pending {
        let key = op.key.as_bytes();
        let vbucket = vbucket_id(key, self.vbuckets);
        let mut extras = [0u8; 8];
        extras[4..].copy_from_slice(&self.expiration.to_be_bytes());

        match op.kind {
            OpKind::Get => self.encode(opcode::GET, key, &[], &[], vbucket),
            OpKind::Delete => self.encode(opcode::DELETE, key, &[], &[], vbucket),
            OpKind::Set => self.encode(opcode::SET, key, &extras, op.payload_bytes(), vbucket),
            OpKind::Arpa(verb) => {
                let extras: &[u8] = if verb.has_extras() { &extras } else { &[] };
                self.encode(arpa_opcode(verb), key, extras, op.payload_bytes(), vbucket)
            }
        }
    }

    fn write_out(&mut self) -> SodaResult<()> {
        self.stream.write_all(&self.out)?;
        self.out.clear();
        Ok(())
    }

    /// Reads one response and returns its status.
    fn recv(&mut self, expected: Pending) -> SodaResult<u16> {
        let raw = self.read_buf.read_exact(&mut self.stream, HEADER_LEN)?;
        let header = ResponseHeader::decode(&raw)?;
        if header.opcode != expected.opcode || header.opaque != expected.opaque {
            return Err(SodaError::protocol(format!(
                "response opcode 0x{:02x} opaque {} does not match request opcode 0x{:02x} opaque {}",
                header.opcode, header.opaque, expected.opcode, expected.opaque
            )));
        }
        if header.body_len > 0 {
            self.read_buf
                .read_exact(&mut self.stream, header.body_len as usize)?;
        }
        Ok(header.status)
    }

    fn recv_op(&mut self, expected: Pending) -> SodaResult<()> {
        let status = self.recv(expected)?;
        if status != STATUS_SUCCESS {
            self.error_responses += 1;
            trace!("opcode 0x{:02x} status 0x{:04x}", expected.opcode, status);
        }
        Ok(())
    }

    fn drain_in_flight(&mut self) -> SodaResult<()> {
        if self.in_flight.is_empty() {
            return Ok(());
        }
        let (pending, stats) = self.in_flight.take();
        for expected in pending {
            self.recv_op(expected)?;
            self.ops += 1;
        }
        if let (Some(sink), Some(mut stats)) = (&self.sink, stats) {
            stats.end = SystemTime::now();
            sink.ops_stats(&stats);
        }
        Ok(())
    }
}

impl<S: Read + Write + Send> Store for BinaryClient<S> {
    fn enqueue(&mut self, op: Operation) -> SodaResult<()> {
        if self.pipeline.push(op) {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> SodaResult<()> {
        self.drain_in_flight()?;

        let mut ops = self.pipeline.take().into_iter();
        let first = match ops.next() {
            Some(op) => op,
            None => return Ok(()),
        };

        let start = SystemTime::now();
        let clock = Instant::now();
        let probe = self.encode_op(&first);
        self.write_out()?;
        self.recv_op(probe)?;
        let elapsed = clock.elapsed();

        self.ops += 1;
        self.timings.add_timing_sample(first.kind.name(), elapsed);
        if let Some(sink) = &self.sink {
            let mut stats = BatchStats::new(start);
            stats.add(first.kind);
            stats.end = SystemTime::now();
            sink.latency_stats(&stats);
        }

        let rest: Vec<Operation> = ops.collect();
        if rest.is_empty() {
            return Ok(());
        }
        let stats = batch_stats(&rest, SystemTime::now());
        let pending: VecDeque<Pending> = rest.iter().map(|op| self.encode_op(op)).collect();
        self.write_out()?;
        self.in_flight.begin(pending, stats);
        Ok(())
    }

    fn finish(&mut self) -> SodaResult<()> {
        self.flush()?;
        self.drain_in_flight()?;
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
