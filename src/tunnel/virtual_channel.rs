//! Per-channel view of a shared physical connection

use super::channelizer::{Outbound, Shared};
use super::frame::{SegmentHeader, MAX_SEGMENT_SIZE};
use super::TunnelError;
use crate::channel::ChannelId;
use crate::transport::ConnReader;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// Discard buffer size used when skipping unread payload
const DEPLETE_CHUNK: usize = 4096;

/// A segment lent to a channel: the connection reader plus what is left of
/// the payload.
pub(super) struct Segment {
    pub reader: ConnReader,
    pub remaining: usize,
}

impl Segment {
    async fn discard(&mut self) -> Result<(), TunnelError> {
        let mut sink = [0u8; DEPLETE_CHUNK];
        while self.remaining > 0 {
            let want = self.remaining.min(DEPLETE_CHUNK);
            let n = self.reader.read(&mut sink[..want]).await?;
            self.remaining -= n;
        }
        Ok(())
    }
}

struct Reading {
    inbound: mpsc::Receiver<Segment>,
    current: Option<Segment>,
}

impl Reading {
    /// The segment dispatched to this channel, including one still parked
    /// in the inbound slot because nothing has read from it yet.
    fn assigned(&mut self) -> Option<&mut Segment> {
        if self.current.is_none() {
            self.current = self.inbound.try_recv().ok();
        }
        self.current.as_mut()
    }
}

/// Channel slot inside a [`super::Channelizer`]
pub(super) struct Port {
    id: ChannelId,
    pub inbound: mpsc::Sender<Segment>,
    reading: Mutex<Reading>,
    /// Idle read timeout in nanoseconds, 0 when disabled
    timeout: AtomicU64,
}

impl Port {
    pub fn new(id: ChannelId, timeout: Option<Duration>) -> Self {
        let (inbound, receiver) = mpsc::channel(1);
        let port = Self {
            id,
            inbound,
            reading: Mutex::new(Reading {
                inbound: receiver,
                current: None,
            }),
            timeout: AtomicU64::new(0),
        };
        port.set_timeout(timeout.unwrap_or(Duration::ZERO));
        port
    }

    fn set_timeout(&self, timeout: Duration) {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self.timeout.store(nanos, Ordering::Relaxed);
    }

    fn timeout(&self) -> Option<Duration> {
        match self.timeout.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }
}

/// Read/write handle for one logical channel.
///
/// Reads only see segments addressed to this channel. After finishing with
/// a segment the owner must call [`Virtual::done`]; until then no other
/// segment on the connection can be dispatched.
#[derive(Clone)]
pub struct Virtual {
    port: Arc<Port>,
    shared: Arc<Shared>,
}

impl Virtual {
    pub(super) fn new(port: Arc<Port>, shared: Arc<Shared>) -> Self {
        Self { port, shared }
    }

    pub fn id(&self) -> ChannelId {
        self.port.id
    }

    /// Whether both handles address the same channel of the same connection
    pub fn same_channel(&self, other: &Virtual) -> bool {
        Arc::ptr_eq(&self.port, &other.port)
    }

    /// Set the idle read timeout (zero disables it).
    pub fn timeout(&self, timeout: Duration) {
        self.port.set_timeout(timeout);
    }

    /// Read payload bytes of the current segment, waiting for one if needed.
    ///
    /// Fails with [`TunnelError::SegmentDepleted`] once the current segment
    /// is exhausted; call [`Virtual::done`] before reading the next one.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let mut guard = self.port.reading.lock().await;
        let reading = &mut *guard;

        if reading.current.is_none() {
            let segment = self.receive(&mut reading.inbound).await?;
            reading.current = Some(segment);
        }

        let Some(segment) = reading.current.as_mut() else {
            return Err(TunnelError::SegmentDepleted);
        };
        if segment.remaining == 0 {
            return Err(TunnelError::SegmentDepleted);
        }

        let want = buf.len().min(segment.remaining);
        if want == 0 {
            return Ok(0);
        }
        let n = segment.reader.read(&mut buf[..want]).await?;
        segment.remaining -= n;
        Ok(n)
    }

    async fn receive(&self, inbound: &mut mpsc::Receiver<Segment>) -> Result<Segment, TunnelError> {
        let shared = &self.shared;

        let Some(timeout) = self.port.timeout() else {
            return tokio::select! {
                biased;
                segment = inbound.recv() => segment.ok_or(TunnelError::ShutDown),
                _ = shared.link.closed() => Err(TunnelError::ConnectionDropped),
                _ = shared.down.cancelled() => Err(TunnelError::ShutDown),
            };
        };

        let deadline = Instant::now() + timeout;
        loop {
            let mut waiter = shared.requester.request(deadline).await?;
            tokio::select! {
                biased;
                segment = inbound.recv() => return segment.ok_or(TunnelError::ShutDown),
                _ = shared.link.closed() => return Err(TunnelError::ConnectionDropped),
                _ = shared.down.cancelled() => return Err(TunnelError::ShutDown),
                fired = waiter.wait() => {
                    fired?;
                    // A tick is only a wake-up; the deadline decides.
                    if Instant::now() >= deadline {
                        return Err(TunnelError::TimedOut);
                    }
                }
            }
        }
    }

    /// Frame `buf` into segments and write them to the connection.
    ///
    /// Writes from all channels of a connection are serialised; a single
    /// call's segments are never interleaved with another channel's.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, TunnelError> {
        self.shared.ensure_up()?;

        let mut guard = self.shared.outbound.lock().await;
        let Outbound { conn, scratch } = &mut *guard;

        for chunk in buf.chunks(MAX_SEGMENT_SIZE) {
            let header = SegmentHeader::new(self.port.id, chunk.len())?;
            scratch.clear();
            header.put(scratch);
            scratch.extend_from_slice(chunk);
            conn.write_all(&scratch[..]).await?;
        }

        Ok(buf.len())
    }

    /// Whether the assigned segment has been read to the end
    pub async fn depleted(&self) -> bool {
        let mut reading = self.port.reading.lock().await;
        matches!(reading.assigned(), Some(segment) if segment.remaining == 0)
    }

    /// Skip whatever is left of the assigned segment.
    pub async fn deplete(&self) -> Result<(), TunnelError> {
        let mut reading = self.port.reading.lock().await;
        match reading.assigned() {
            Some(segment) => segment.discard().await,
            None => Ok(()),
        }
    }

    /// Finish with the assigned segment, read or not, and release the read
    /// cursor.
    ///
    /// A no-op when no segment is assigned.
    pub async fn done(&self) -> Result<(), TunnelError> {
        let mut reading = self.port.reading.lock().await;
        reading.assigned();
        let Some(mut segment) = reading.current.take() else {
            return Ok(());
        };

        segment.discard().await?;
        self.release(segment).await
    }

    /// Read the rest of the assigned segment (or the whole next one) and
    /// release it.
    pub async fn read_segment(&self) -> Result<Vec<u8>, TunnelError> {
        let mut guard = self.port.reading.lock().await;
        let reading = &mut *guard;

        let mut segment = match reading.current.take() {
            Some(segment) => segment,
            None => self.receive(&mut reading.inbound).await?,
        };

        let mut payload = vec![0u8; segment.remaining];
        segment.reader.read_exact(&mut payload).await?;
        segment.remaining = 0;

        self.release(segment).await?;
        Ok(payload)
    }

    async fn release(&self, segment: Segment) -> Result<(), TunnelError> {
        self.shared
            .completed_tx
            .send(segment.reader)
            .await
            .map_err(|_| TunnelError::ShutDown)
    }

    /// Tear down the whole physical connection, not just this channel.
    pub async fn close_all(&self) -> Result<(), TunnelError> {
        self.shared.close_all().await
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::{Channels, Machine, Transition};
    use crate::config::{MuxConfig, TickerConfig};
    use crate::ticker::Ticker;
    use crate::transport::Connection;
    use crate::tunnel::{Channelizer, TunnelError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    struct Noop;

    #[async_trait]
    impl Machine for Noop {
        async fn bootup(&mut self) -> crate::Result<Transition> {
            Ok(Transition::Next)
        }

        async fn tick(&mut self) -> crate::Result<Transition> {
            Ok(Transition::Finished)
        }

        async fn shutdown(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    fn setup(resolution_ms: u64) -> (Channelizer, tokio::io::DuplexStream, Ticker) {
        let ticker = Ticker::new(TickerConfig {
            resolution_ms,
            ..Default::default()
        });
        let requester = ticker.serve().unwrap();
        let (near, far) = tokio::io::duplex(1 << 18);
        let mux = Channelizer::new(Connection::new(near), requester, &MuxConfig::default());
        (mux, far, ticker)
    }

    #[tokio::test]
    async fn test_write_frames_segments() {
        let (mux, mut far, _ticker) = setup(300);
        let virt = mux.for_channel(8).unwrap();

        assert_eq!(virt.write(b"Hello World").await.unwrap(), 11);
        assert_eq!(virt.write(&[]).await.unwrap(), 0);

        let mut wire = [0u8; 14];
        far.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[..3], &[8, 0, 11]);
        assert_eq!(&wire[3..], b"Hello World");
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mux, _far, _ticker) = setup(20);
        let virt = mux.for_channel(0).unwrap();
        virt.timeout(Duration::from_millis(100));

        let start = Instant::now();
        let mut buf = [0u8; 4];
        let err = virt.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, TunnelError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_read_observes_shutdown() {
        let (mux, _far, _ticker) = setup(300);
        let virt = mux.for_channel(5).unwrap();
        let other = mux.for_channel(6).unwrap();

        let first = tokio::spawn({
            let virt = virt.clone();
            async move {
                let mut buf = [0u8; 4];
                virt.read(&mut buf).await
            }
        });
        let second = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            other.read(&mut buf).await
        });
        tokio::task::yield_now().await;

        mux.shutdown().unwrap();
        // Every parked reader sees the same signal.
        assert!(matches!(first.await.unwrap(), Err(TunnelError::ShutDown)));
        assert!(matches!(second.await.unwrap(), Err(TunnelError::ShutDown)));
        assert!(matches!(virt.write(b"x").await, Err(TunnelError::ShutDown)));
    }

    #[tokio::test]
    async fn test_read_observes_connection_loss() {
        let (mux, far, _ticker) = setup(300);
        let virt = mux.for_channel(1).unwrap();
        let channels = Channels::new(2, |_| Noop).unwrap();
        drop(far);

        assert!(matches!(
            mux.dispatch(&channels).await,
            Err(TunnelError::ConnectionDropped)
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            virt.read(&mut buf).await,
            Err(TunnelError::ConnectionDropped)
        ));
    }

    #[tokio::test]
    async fn test_depleted_segment_rejects_reads() {
        let (mux, mut far, _ticker) = setup(300);
        let virt = mux.for_channel(2).unwrap();
        let channels = Channels::new(4, |_| Noop).unwrap();

        far.write_all(&[2, 0, 3, b'a', b'b', b'c']).await.unwrap();
        mux.dispatch(&channels).await.unwrap();

        assert!(!virt.depleted().await);
        let mut buf = [0u8; 2];
        assert_eq!(virt.read(&mut buf).await.unwrap(), 2);
        assert_eq!(virt.read(&mut buf).await.unwrap(), 1);
        assert!(virt.depleted().await);
        assert!(matches!(
            virt.read(&mut buf).await,
            Err(TunnelError::SegmentDepleted)
        ));
        virt.done().await.unwrap();
        assert!(!virt.depleted().await);
    }

    #[tokio::test]
    async fn test_done_skips_unread_payload() {
        let (mux, mut far, _ticker) = setup(300);
        let virt = mux.for_channel(4).unwrap();
        let channels = Channels::new(8, |_| Noop).unwrap();

        let mut wire = vec![4, 0x27, 0x10];
        wire.extend(std::iter::repeat(0xAB).take(10_000));
        wire.extend_from_slice(&[4, 0, 2, b'o', b'k']);
        far.write_all(&wire).await.unwrap();

        mux.dispatch(&channels).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(virt.read(&mut buf).await.unwrap(), 16);
        virt.done().await.unwrap();

        mux.dispatch(&channels).await.unwrap();
        let n = virt.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");

        virt.deplete().await.unwrap();
        assert!(virt.depleted().await);
        virt.done().await.unwrap();
    }

    #[tokio::test]
    async fn test_done_releases_unread_segment() {
        let (mux, mut far, _ticker) = setup(300);
        let virt = mux.for_channel(2).unwrap();
        let channels = Channels::new(4, |_| Noop).unwrap();

        far.write_all(&[2, 0, 3, b'a', b'b', b'c', 2, 0, 1, b'z'])
            .await
            .unwrap();

        mux.dispatch(&channels).await.unwrap();
        virt.done().await.unwrap();

        let (id, _) = tokio::time::timeout(Duration::from_secs(2), mux.dispatch(&channels))
            .await
            .expect("dispatch blocked after done")
            .unwrap();
        assert_eq!(id, 2);

        let mut buf = [0u8; 4];
        assert_eq!(virt.read(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], b'z');
    }

    #[tokio::test]
    async fn test_zero_length_segment_is_depleted() {
        let (mux, mut far, _ticker) = setup(300);
        let virt = mux.for_channel(1).unwrap();
        let channels = Channels::new(4, |_| Noop).unwrap();

        assert!(!virt.depleted().await);
        far.write_all(&[1, 0, 0, 1, 0, 2, b'h', b'i']).await.unwrap();

        mux.dispatch(&channels).await.unwrap();
        assert!(virt.depleted().await);
        virt.done().await.unwrap();

        mux.dispatch(&channels).await.unwrap();
        assert!(!virt.depleted().await);
    }

    #[tokio::test]
    async fn test_deplete_before_first_read() {
        let (mux, mut far, _ticker) = setup(300);
        let virt = mux.for_channel(6).unwrap();
        let channels = Channels::new(8, |_| Noop).unwrap();

        far.write_all(&[6, 0, 5, b'h', b'e', b'l', b'l', b'o', 6, 0, 2, b'o', b'k'])
            .await
            .unwrap();

        mux.dispatch(&channels).await.unwrap();
        virt.deplete().await.unwrap();
        assert!(virt.depleted().await);
        let mut buf = [0u8; 8];
        assert!(matches!(
            virt.read(&mut buf).await,
            Err(TunnelError::SegmentDepleted)
        ));
        virt.done().await.unwrap();

        mux.dispatch(&channels).await.unwrap();
        assert_eq!(virt.read_segment().await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_read_segment_releases_cursor() {
        let (mux, mut far, _ticker) = setup(300);
        let virt = mux.for_channel(3).unwrap();
        let channels = Channels::new(4, |_| Noop).unwrap();

        far.write_all(&[3, 0, 4, b'p', b'i', b'n', b'g', 3, 0, 0, 3, 0, 1, b'!'])
            .await
            .unwrap();

        mux.dispatch(&channels).await.unwrap();
        assert_eq!(virt.read_segment().await.unwrap(), b"ping");

        // Empty segments are delivered too.
        mux.dispatch(&channels).await.unwrap();
        assert!(virt.read_segment().await.unwrap().is_empty());

        mux.dispatch(&channels).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(virt.read(&mut buf).await.unwrap(), 1);
        assert!(virt.read_segment().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_all_closes_physical_connection() {
        let (mux, mut far, _ticker) = setup(300);
        let virt = mux.for_channel(7).unwrap();

        virt.close_all().await.unwrap();
        assert!(mux.is_down());
        assert!(mux.is_closed());
        // A second teardown from another channel is harmless.
        mux.for_channel(9).unwrap().close_all().await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }
}
