//! TCP dialing

use super::{TransportConfig, TransportError};
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect to `addr`, bounded by the configured connect timeout.
pub async fn dial(addr: &str, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let timeout = Duration::from_secs(config.connect_timeout);

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    if config.nodelay {
        stream.set_nodelay(true).ok();
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut stream = dial(&addr.to_string(), &TransportConfig::default())
            .await
            .unwrap();

        let msg = b"Hello, TCP!";
        stream.write_all(msg).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], msg);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dial(&addr.to_string(), &TransportConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
