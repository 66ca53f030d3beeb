//! Segment dispatcher for one physical connection
//!
//! The connection reader is a token: whoever holds it may read. It starts in
//! the single-slot `completed` channel, [`Channelizer::dispatch`] takes it
//! out to parse a header, then moves it into the addressed channel's inbound
//! slot together with the payload length. The channel hands it back through
//! `completed` when it calls [`Virtual::done`], which is what allows the next
//! dispatch to proceed.
//!
//! ```text
//!            completed (cap 1)
//!   +-------------------------------+
//!   v                               |
//! dispatch --header--> port[id].inbound (cap 1) --> Virtual::read .. done
//! ```

use super::frame::{SegmentHeader, HEADER_SIZE};
use super::virtual_channel::{Port, Segment, Virtual};
use super::TunnelError;
use crate::channel::{ChannelId, Channels, Fsm, Machine, MAX_CHANNELS};
use crate::config::MuxConfig;
use crate::ticker::Requester;
use crate::transport::{ConnReader, ConnWriter, Connection, Link};
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Write side shared by every channel of a connection
pub(super) struct Outbound {
    pub conn: ConnWriter,
    /// Frame scratch buffer, grown to the largest segment written so far
    pub scratch: BytesMut,
}

pub(super) struct Shared {
    pub link: Link,
    pub requester: Requester,
    pub read_timeout: Option<Duration>,
    pub completed_tx: mpsc::Sender<ConnReader>,
    completed_rx: Mutex<mpsc::Receiver<ConnReader>>,
    ports: Vec<OnceLock<Arc<Port>>>,
    pub outbound: Mutex<Outbound>,
    igniter: AtomicBool,
    pub down: CancellationToken,
}

impl Shared {
    fn port(&self, id: ChannelId) -> Option<&Arc<Port>> {
        self.ports.get(id as usize).and_then(OnceLock::get)
    }

    /// Fail fast when the connection can no longer carry segments.
    pub fn ensure_up(&self) -> Result<(), TunnelError> {
        if self.down.is_cancelled() {
            return Err(TunnelError::ShutDown);
        }
        if self.link.is_closed() {
            return Err(TunnelError::ConnectionDropped);
        }
        Ok(())
    }

    pub fn shutdown(&self) -> Result<(), TunnelError> {
        if self.igniter.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::AlreadyClosing);
        }
        self.down.cancel();
        debug!("channelizer shut down");
        Ok(())
    }

    pub async fn close_all(&self) -> Result<(), TunnelError> {
        let result = self.shutdown();
        self.link.close();

        // Writers parked on the socket abort once the link is closed.
        let mut outbound = self.outbound.lock().await;
        if let Err(err) = outbound.conn.shutdown().await {
            trace!(error = %err, "write side already gone");
        }

        match result {
            Err(TunnelError::AlreadyClosing) => Ok(()),
            other => other,
        }
    }
}

/// Closes the link when a dispatch is dropped while it holds the read
/// cursor, so later dispatches fail instead of waiting for a reader that
/// will never come back.
struct CursorGuard<'a> {
    link: &'a Link,
    armed: bool,
}

impl<'a> CursorGuard<'a> {
    fn arm(link: &'a Link) -> Self {
        Self { link, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CursorGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("read cursor lost mid-dispatch, closing link");
            self.link.close();
        }
    }
}

/// Multiplexer bound to one physical connection.
///
/// Cloning is cheap; every clone drives the same connection.
#[derive(Clone)]
pub struct Channelizer {
    shared: Arc<Shared>,
}

impl Channelizer {
    /// Bind a multiplexer to `conn`, using `requester` for read timeouts.
    pub fn new(conn: Connection, requester: Requester, config: &MuxConfig) -> Self {
        let (reader, writer, link) = conn.into_parts();
        link.set_timeout(config.io_timeout());

        let (completed_tx, completed_rx) = mpsc::channel(1);
        // First permit; the slot is empty.
        let _ = completed_tx.try_send(reader);

        let shared = Shared {
            link,
            requester,
            read_timeout: config.read_timeout(),
            completed_tx,
            completed_rx: Mutex::new(completed_rx),
            ports: (0..MAX_CHANNELS).map(|_| OnceLock::new()).collect(),
            outbound: Mutex::new(Outbound {
                conn: writer,
                scratch: BytesMut::new(),
            }),
            igniter: AtomicBool::new(false),
            down: CancellationToken::new(),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Read the next segment header and hand the segment to its channel.
    ///
    /// Must be driven by a single task. Returns the addressed channel and
    /// its machine; the caller is responsible for booting or ticking it.
    /// Every error is terminal for the connection, and so is dropping the
    /// future once it has taken the read cursor.
    pub async fn dispatch<'c, M: Machine>(
        &self,
        channels: &'c Channels<M>,
    ) -> Result<(ChannelId, &'c Arc<Fsm<M>>), TunnelError> {
        let shared = &self.shared;

        let mut reader = {
            let mut completed = shared.completed_rx.lock().await;
            tokio::select! {
                biased;
                _ = shared.down.cancelled() => return Err(TunnelError::ShutDown),
                _ = shared.link.closed() => return Err(TunnelError::ConnectionDropped),
                reader = completed.recv() => reader.ok_or(TunnelError::ShutDown)?,
            }
        };
        let guard = CursorGuard::arm(&shared.link);

        let mut raw = [0u8; HEADER_SIZE];
        let read = tokio::select! {
            biased;
            _ = shared.down.cancelled() => return Err(TunnelError::ShutDown),
            read = reader.read_exact(&mut raw) => read,
        };
        if let Err(err) = read {
            debug!(error = %err, "segment header read failed");
            return Err(err.into());
        }

        let header = SegmentHeader::decode(raw);
        let (fsm, port) = match (channels.get(header.channel), shared.port(header.channel)) {
            (Ok(fsm), Some(port)) => (fsm, port),
            _ => {
                warn!(channel = header.channel, "segment for unavailable channel");
                shared.link.close();
                return Err(TunnelError::ChannelUnavailable(header.channel));
            }
        };

        trace!(channel = header.channel, length = header.length, "dispatching segment");

        let segment = Segment {
            reader,
            remaining: header.length as usize,
        };
        tokio::select! {
            biased;
            _ = shared.down.cancelled() => return Err(TunnelError::ShutDown),
            _ = shared.link.closed() => return Err(TunnelError::ConnectionDropped),
            sent = port.inbound.send(segment) => sent.map_err(|_| TunnelError::ShutDown)?,
        }
        guard.disarm();

        Ok((header.channel, fsm))
    }

    /// Set the physical connection's I/O timeout (zero disables it).
    pub fn timeout(&self, timeout: Duration) {
        self.shared
            .link
            .set_timeout((!timeout.is_zero()).then_some(timeout));
    }

    /// Handle for channel `id`, created on first use.
    pub fn for_channel(&self, id: usize) -> Result<Virtual, TunnelError> {
        let slot = self
            .shared
            .ports
            .get(id)
            .ok_or(TunnelError::InvalidChannel(id))?;

        let port = slot.get_or_init(|| Arc::new(Port::new(id as ChannelId, self.shared.read_timeout)));
        Ok(Virtual::new(Arc::clone(port), Arc::clone(&self.shared)))
    }

    /// Broadcast shutdown to every task using this connection.
    ///
    /// Only the first call performs the teardown; later calls fail with
    /// [`TunnelError::AlreadyClosing`]. Reads already copying a delivered
    /// segment run to completion.
    pub fn shutdown(&self) -> Result<(), TunnelError> {
        self.shared.shutdown()
    }

    /// Shut down and close the physical connection.
    pub async fn close_all(&self) -> Result<(), TunnelError> {
        self.shared.close_all().await
    }

    /// Resolves once the physical connection is lost
    pub async fn closed(&self) {
        self.shared.link.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.link.is_closed()
    }

    /// Whether [`Channelizer::shutdown`] has run
    pub fn is_down(&self) -> bool {
        self.shared.down.is_cancelled()
    }

    pub fn link(&self) -> &Link {
        &self.shared.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Transition;
    use crate::config::TickerConfig;
    use crate::ticker::Ticker;
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;

    struct Idle;

    #[async_trait]
    impl Machine for Idle {
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

    fn setup() -> (Channelizer, tokio::io::DuplexStream, Ticker) {
        let ticker = Ticker::new(TickerConfig::default());
        let requester = ticker.serve().unwrap();
        let (near, far) = tokio::io::duplex(1 << 16);
        let mux = Channelizer::new(Connection::new(near), requester, &MuxConfig::default());
        (mux, far, ticker)
    }

    #[tokio::test]
    async fn test_for_channel_bounds_and_identity() {
        let (mux, _far, _ticker) = setup();
        assert!(matches!(
            mux.for_channel(255),
            Err(TunnelError::InvalidChannel(255))
        ));

        let first = mux.for_channel(12).unwrap();
        let again = mux.for_channel(12).unwrap();
        assert_eq!(first.id(), 12);
        assert!(first.same_channel(&again));
    }

    #[tokio::test]
    async fn test_timeout_updates_link() {
        let (mux, _far, _ticker) = setup();
        assert_eq!(mux.link().timeout(), None);

        mux.timeout(Duration::from_millis(250));
        assert_eq!(mux.link().timeout(), Some(Duration::from_millis(250)));

        mux.timeout(Duration::ZERO);
        assert_eq!(mux.link().timeout(), None);
    }

    #[tokio::test]
    async fn test_shutdown_is_ignited_once() {
        let (mux, _far, _ticker) = setup();
        mux.shutdown().unwrap();
        assert!(mux.is_down());
        assert!(matches!(mux.shutdown(), Err(TunnelError::AlreadyClosing)));

        let channels = Channels::new(4, |_| Idle).unwrap();
        assert!(matches!(
            mux.dispatch(&channels).await,
            Err(TunnelError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_channel_is_terminal() {
        let (mux, mut far, _ticker) = setup();
        let channels = Channels::new(4, |_| Idle).unwrap();
        let _known = mux.for_channel(1).unwrap();

        // Registered but never instantiated on this connection.
        far.write_all(&[2, 0, 1, b'x']).await.unwrap();
        assert!(matches!(
            mux.dispatch(&channels).await,
            Err(TunnelError::ChannelUnavailable(2))
        ));
        assert!(mux.is_closed());
        assert!(matches!(
            mux.dispatch(&channels).await,
            Err(TunnelError::ConnectionDropped)
        ));
    }

    #[tokio::test]
    async fn test_unregistered_channel_is_unavailable() {
        let (mux, mut far, _ticker) = setup();
        let channels = Channels::new(4, |_| Idle).unwrap();
        let _instantiated = mux.for_channel(9).unwrap();

        far.write_all(&[9, 0, 0]).await.unwrap();
        assert!(matches!(
            mux.dispatch(&channels).await,
            Err(TunnelError::ChannelUnavailable(9))
        ));
    }

    #[tokio::test]
    async fn test_truncated_header_drops_connection() {
        let (mux, mut far, _ticker) = setup();
        let channels = Channels::new(4, |_| Idle).unwrap();

        far.write_all(&[0, 0]).await.unwrap();
        drop(far);
        assert!(matches!(
            mux.dispatch(&channels).await,
            Err(TunnelError::ConnectionDropped)
        ));
        assert!(mux.is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_dispatch_closes_link() {
        let (mux, mut far, _ticker) = setup();
        let channels = Channels::new(4, |_| Idle).unwrap();
        let _virt = mux.for_channel(1).unwrap();

        // Half a header: the dispatch parks on the read holding the cursor.
        far.write_all(&[1, 0]).await.unwrap();
        let parked =
            tokio::time::timeout(Duration::from_millis(100), mux.dispatch(&channels)).await;
        assert!(parked.is_err());
        assert!(mux.is_closed());

        let next = tokio::time::timeout(Duration::from_secs(2), mux.dispatch(&channels))
            .await
            .expect("dispatch parked after an abandoned one");
        assert!(matches!(next, Err(TunnelError::ConnectionDropped)));
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_done() {
        let (mux, mut far, _ticker) = setup();
        let channels = Channels::new(4, |_| Idle).unwrap();
        let virt = mux.for_channel(3).unwrap();

        far.write_all(&[3, 0, 2, b'h', b'i', 3, 0, 1, b'!']).await.unwrap();

        let (id, fsm) = mux.dispatch(&channels).await.unwrap();
        assert_eq!(id, 3);
        assert_eq!(fsm.id(), 3);

        // The read cursor is still lent out to channel 3.
        let blocked = tokio::time::timeout(Duration::from_millis(50), mux.dispatch(&channels)).await;
        assert!(blocked.is_err());

        let mut buf = [0u8; 8];
        let n = virt.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert!(virt.depleted().await);
        virt.done().await.unwrap();

        let (id, _) = mux.dispatch(&channels).await.unwrap();
        assert_eq!(id, 3);
        let n = virt.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"!");
        virt.done().await.unwrap();
    }
}
