//! Physical connection wrapper
//!
//! Splits a byte stream into a read half and a write half that can be owned
//! by different tasks, and ties them together through a [`Link`]:
//! - every operation is bounded by the link's I/O timeout (if set)
//! - every failure, EOF or timeout is tagged as a [`TransportError`] and
//!   marks the link closed, permanently
//! - closing the link aborts any operation still parked on either half

use super::{BoxedReader, BoxedWriter, Codec, Plain, TransportError};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct LinkState {
    /// I/O timeout in nanoseconds, 0 when disabled
    timeout: AtomicU64,
    closed: CancellationToken,
}

/// Shared state of one physical connection
#[derive(Debug, Clone)]
pub struct Link {
    inner: Arc<LinkState>,
}

impl Link {
    fn new() -> Self {
        Self {
            inner: Arc::new(LinkState {
                timeout: AtomicU64::new(0),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Bound every subsequent read and write by `timeout` (`None` disables).
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        let nanos = timeout
            .map(|t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        self.inner.timeout.store(nanos, Ordering::Relaxed);
    }

    /// Current I/O timeout
    pub fn timeout(&self) -> Option<Duration> {
        match self.inner.timeout.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    /// Mark the connection lost
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection is lost
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    async fn bound<F, T>(&self, io: F) -> Result<T, TransportError>
    where
        F: Future<Output = io::Result<T>>,
    {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let timeout = self.timeout();
        let operation = async move {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, io)
                    .await
                    .map_err(|_| TransportError::Timeout)?
                    .map_err(tag),
                None => io.await.map_err(tag),
            }
        };

        let result = tokio::select! {
            biased;
            result = operation => result,
            _ = self.closed() => Err(TransportError::Closed),
        };

        if result.is_err() {
            self.close();
        }
        result
    }
}

fn tag(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => TransportError::Closed,
        _ => TransportError::Io(err),
    }
}

/// Inbound half of a connection
pub struct ConnReader {
    inner: BoxedReader,
    link: Link,
}

impl ConnReader {
    /// Read at least one byte into `buf`. EOF is reported as [`TransportError::Closed`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let n = self.link.bound(self.inner.read(buf)).await?;
        if n == 0 {
            self.link.close();
            return Err(TransportError::Closed);
        }
        Ok(n)
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.link.bound(self.inner.read_exact(buf)).await.map(|_| ())
    }

    pub fn link(&self) -> &Link {
        &self.link
    }
}

/// Outbound half of a connection
pub struct ConnWriter {
    inner: BoxedWriter,
    link: Link,
}

impl ConnWriter {
    /// Write and flush all of `buf`.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let inner = &mut self.inner;
        self.link
            .bound(async move {
                inner.write_all(buf).await?;
                inner.flush().await
            })
            .await
    }

    /// Close the write direction.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await.map_err(tag)
    }

    pub fn link(&self) -> &Link {
        &self.link
    }
}

/// A physical connection after its codec has been applied.
pub struct Connection {
    reader: ConnReader,
    writer: ConnWriter,
    link: Link,
}

impl Connection {
    /// Wrap a raw byte stream without transformation
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_codec(io, &Plain)
    }

    /// Wrap a byte stream, passing both halves through `codec`
    pub fn with_codec<T, C>(io: T, codec: &C) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        C: Codec + ?Sized,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let link = Link::new();

        Self {
            reader: ConnReader {
                inner: codec.decode(Box::new(read_half)),
                link: link.clone(),
            },
            writer: ConnWriter {
                inner: codec.encode(Box::new(write_half)),
                link: link.clone(),
            },
            link,
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn into_parts(self) -> (ConnReader, ConnWriter, Link) {
        (self.reader, self.writer, self.link)
    }
}
