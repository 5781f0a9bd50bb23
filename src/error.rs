use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SodaError {
    /// One entry per distinct bad `key=value` token (or file entry).
    #[error("Configuration error: {}", .0.join("; "))]
    Config(Vec<String>),

    #[error("Connect error: {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Peer closed the socket while a frame or line was still incomplete.
    #[error("Connection lost: expected {needed} bytes, got {got}")]
    ConnectionLost { needed: usize, got: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed for {user}: status 0x{status:04x}")]
    Auth { user: String, status: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SodaError {
    pub fn config(message: impl Into<String>) -> Self {
        SodaError::Config(vec![message.into()])
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        SodaError::Protocol(message.into())
    }
}

pub type SodaResult<T> = Result<T, SodaError>;
