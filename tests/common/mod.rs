// Shared helpers for integration tests: an in-process memcached stand-in
// that speaks enough of the binary and text protocols for kvsoda.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

pub const STATUS_OK: u16 = 0x0000;
pub const STATUS_NOT_FOUND: u16 = 0x0001;
pub const STATUS_EXISTS: u16 = 0x0002;
pub const STATUS_NOT_STORED: u16 = 0x0005;
pub const STATUS_AUTH_ERROR: u16 = 0x0020;

/// One request as the stub saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRequest {
    pub command: String,
    pub extras_len: usize,
    pub key: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct StubState {
    pub items: HashMap<Vec<u8>, Vec<u8>>,
    pub requests: Vec<SeenRequest>,
    pub connections: usize,
}

impl StubState {
    pub fn count(&self, command: &str) -> usize {
        self.requests.iter().filter(|r| r.command == command).count()
    }

    /// Applies a storage command and reports whether it stored anything.
    fn store(&mut self, command: &str, key: &[u8], value: &[u8]) -> bool {
        let exists = self.items.contains_key(key);
        match command {
            "set" => {}
            "add" if exists => return false,
            "replace" | "append" | "prepend" if !exists => return false,
            _ => {}
        }
        let entry = self.items.entry(key.to_vec()).or_default();
        match command {
            "append" => entry.extend_from_slice(value),
            "prepend" => {
                let mut joined = value.to_vec();
                joined.extend_from_slice(entry);
                *entry = joined;
            }
            _ => *entry = value.to_vec(),
        }
        true
    }
}

pub struct StubServer {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<StubState>>,
}

impl StubServer {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn target(&self, scheme: &str) -> String {
        format!("{}://{}", scheme, self.addr)
    }
}

fn listen() -> TcpListener {
    TcpListener::bind(("127.0.0.1", 0)).expect("bind stub listener")
}

fn spawn_server<F>(handler: F) -> StubServer
where
    F: Fn(TcpStream, Arc<Mutex<StubState>>) + Send + Sync + 'static,
{
    let listener = listen();
    let addr = listener.local_addr().expect("stub address");
    let state = Arc::new(Mutex::new(StubState::default()));
    let handler = Arc::new(handler);
    let shared = state.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(_) => return,
            };
            shared.lock().connections += 1;
            let handler = handler.clone();
            let state = shared.clone();
            thread::spawn(move || handler(stream, state));
        }
    });
    StubServer { addr, state }
}

/// Binary-protocol stub. With `credentials`, SASL PLAIN must match them.
pub fn start_binary(credentials: Option<(&str, &str)>) -> StubServer {
    let expected = credentials.map(|(user, pass)| format!("\0{}\0{}", user, pass).into_bytes());
    spawn_server(move |stream, state| serve_binary(stream, state, expected.clone()))
}

pub fn start_ascii() -> StubServer {
    spawn_server(serve_ascii)
}

/// Accepts one binary request, answers with only the first `reply_len`
/// bytes of a response header, then closes the connection.
pub fn start_truncating(reply_len: usize) -> StubServer {
    spawn_server(move |mut stream, _| {
        if read_frame(&mut stream).is_none() {
            return;
        }
        let response = binary_response(0x00, STATUS_OK, [0; 4], 0, &[]);
        let _ = stream.write_all(&response[..reply_len.min(response.len())]);
        let _ = stream.flush();
    })
}

/// Address nobody listens on.
pub fn closed_addr() -> SocketAddr {
    let listener = listen();
    listener.local_addr().expect("closed address")
}

struct Frame {
    opcode: u8,
    extras_len: usize,
    opaque: [u8; 4],
    key: Vec<u8>,
    value: Vec<u8>,
}

fn read_frame(stream: &mut TcpStream) -> Option<Frame> {
    let mut header = [0u8; 24];
    stream.read_exact(&mut header).ok()?;
    if header[0] != 0x80 {
        return None;
    }
    let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let extras_len = header[4] as usize;
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).ok()?;
    Some(Frame {
        opcode: header[1],
        extras_len,
        opaque: [header[12], header[13], header[14], header[15]],
        key: body[extras_len..extras_len + key_len].to_vec(),
        value: body[extras_len + key_len..].to_vec(),
    })
}

fn binary_response(opcode: u8, status: u16, opaque: [u8; 4], extras_len: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + body.len());
    out.push(0x81);
    out.push(opcode);
    out.extend_from_slice(&[0, 0]);
    out.push(extras_len);
    out.push(0);
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&opaque);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(body);
    out
}

fn binary_command(opcode: u8) -> &'static str {
    match opcode {
        0x00 => "get",
        0x01 => "set",
        0x02 => "add",
        0x03 => "replace",
        0x04 => "delete",
        0x0e => "append",
        0x0f => "prepend",
        0x21 => "sasl-auth",
        _ => "unknown",
    }
}

fn serve_binary(mut stream: TcpStream, state: Arc<Mutex<StubState>>, credentials: Option<Vec<u8>>) {
    while let Some(frame) = read_frame(&mut stream) {
        let command = binary_command(frame.opcode);
        let (status, extras_len, body) = {
            let mut st = state.lock();
            st.requests.push(SeenRequest {
                command: command.to_string(),
                extras_len: frame.extras_len,
                key: frame.key.clone(),
            });
            match command {
                "get" => match st.items.get(&frame.key) {
                    Some(value) => {
                        let mut body = vec![0u8; 4];
                        body.extend_from_slice(value);
                        (STATUS_OK, 4, body)
                    }
                    None => (STATUS_NOT_FOUND, 0, b"Not found".to_vec()),
                },
                "delete" => match st.items.remove(&frame.key) {
                    Some(_) => (STATUS_OK, 0, Vec::new()),
                    None => (STATUS_NOT_FOUND, 0, b"Not found".to_vec()),
                },
                "sasl-auth" => match &credentials {
                    Some(expected) if *expected != frame.value => {
                        (STATUS_AUTH_ERROR, 0, b"Auth failure".to_vec())
                    }
                    _ => (STATUS_OK, 0, b"Authenticated".to_vec()),
                },
                "unknown" => (0x0081, 0, Vec::new()),
                storage => {
                    if st.store(storage, &frame.key, &frame.value) {
                        (STATUS_OK, 0, Vec::new())
                    } else if storage == "add" {
                        (STATUS_EXISTS, 0, Vec::new())
                    } else {
                        (STATUS_NOT_STORED, 0, Vec::new())
                    }
                }
            }
        };
        let response = binary_response(frame.opcode, status, frame.opaque, extras_len, &body);
        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

fn serve_ascii(stream: TcpStream, state: Arc<Mutex<StubState>>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let parts: Vec<&str> = line.trim_end().split(' ').collect();
        let command = parts[0].to_string();
        let key = parts.get(1).map(|k| k.as_bytes().to_vec()).unwrap_or_default();

        let reply = match command.as_str() {
            "get" => {
                let mut st = state.lock();
                st.requests.push(SeenRequest {
                    command: command.clone(),
                    extras_len: 0,
                    key: key.clone(),
                });
                match st.items.get(&key) {
                    Some(value) => {
                        let mut out = format!("VALUE {} 0 {}\r\n", parts[1], value.len()).into_bytes();
                        out.extend_from_slice(value);
                        out.extend_from_slice(b"\r\nEND\r\n");
                        out
                    }
                    None => b"END\r\n".to_vec(),
                }
            }
            "delete" => {
                let mut st = state.lock();
                st.requests.push(SeenRequest {
                    command: command.clone(),
                    extras_len: 0,
                    key: key.clone(),
                });
                match st.items.remove(&key) {
                    Some(_) => b"DELETED\r\n".to_vec(),
                    None => b"NOT_FOUND\r\n".to_vec(),
                }
            }
            "set" | "add" | "replace" | "append" | "prepend" => {
                let len: usize = match parts.get(4).and_then(|n| n.parse().ok()) {
                    Some(len) => len,
                    None => return,
                };
                let mut data = vec![0u8; len + 2];
                if reader.read_exact(&mut data).is_err() {
                    return;
                }
                data.truncate(len);
                let mut st = state.lock();
                st.requests.push(SeenRequest {
                    command: command.clone(),
                    extras_len: 0,
                    key: key.clone(),
                });
                if st.store(&command, &key, &data) {
                    b"STORED\r\n".to_vec()
                } else {
                    b"NOT_STORED\r\n".to_vec()
                }
            }
            _ => b"ERROR\r\n".to_vec(),
        };
        if writer.write_all(&reply).is_err() {
            return;
        }
    }
}
