//! Physical connection plumbing
//!
//! Provides:
//! - [`Codec`]: the seam where a cipher wraps the raw byte stream before it
//!   reaches the multiplexer ([`Plain`] passes bytes through untouched)
//! - [`Connection`]: a split, timeout-bounded, error-tagging wrapper around
//!   any async byte stream
//! - [`dial`]: TCP connect with timeout

mod connection;
mod tcp;

pub use connection::{ConnReader, ConnWriter, Connection, Link};
pub use tcp::dial;

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Boxed read side of a byte stream
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write side of a byte stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream transformation applied beneath the multiplexer.
///
/// Implementations wrap the raw halves of a connection, e.g. with an
/// encrypting writer and a decrypting reader.
pub trait Codec: Send + Sync {
    /// Wrap the inbound half
    fn decode(&self, reader: BoxedReader) -> BoxedReader;

    /// Wrap the outbound half
    fn encode(&self, writer: BoxedWriter) -> BoxedWriter;
}

/// Identity codec
#[derive(Debug, Clone, Copy, Default)]
pub struct Plain;

impl Codec for Plain {
    fn decode(&self, reader: BoxedReader) -> BoxedReader {
        reader
    }

    fn encode(&self, writer: BoxedWriter) -> BoxedWriter {
        writer
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            nodelay: true,
        }
    }
}
