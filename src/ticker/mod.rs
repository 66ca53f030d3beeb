//! Coalescing deadline ticker
//!
//! A [`Ticker`] runs one task that owns a sorted [`Chain`] of deadlines and a
//! single timer armed at the earliest one. Callers ask for a deadline through
//! a [`Requester`] and get back a [`Waiter`]; requests that round to the same
//! deadline share one node, so thousands of idle timeouts cost one timer.
//!
//! ```text
//!  Requester --insert--> +-------------+ --signal--> Waiter::wait()
//!  Waiter(drop) -cancel> | actor task  |
//!  Ticker::close ------> |  Chain      | <--timer--  sleep_until(head)
//!                        +-------------+
//! ```

mod actor;
mod chain;

pub use chain::{Chain, WaiterKey};

use crate::config::TickerConfig;
use actor::{Actor, Insert};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Ticker lifecycle and request errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TickerError {
    #[error("ticker already serving")]
    AlreadyServing,

    #[error("ticker not serving")]
    NotServing,

    #[error("ticker not operable")]
    NotOperable,
}

struct Serving {
    session: u64,
    shutdown: oneshot::Sender<()>,
    // Held so the actor's inboxes stay open while the session lives.
    _inserts: mpsc::Sender<Insert>,
    _cancels: mpsc::UnboundedSender<WaiterKey>,
}

#[derive(Default)]
struct Boot {
    sessions: u64,
    serving: Option<Serving>,
}

struct Shared {
    config: TickerConfig,
    boot: Mutex<Boot>,
}

impl Shared {
    fn boot(&self) -> MutexGuard<'_, Boot> {
        self.boot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stop the serving session; `session` restricts which one may be stopped.
    fn close(&self, session: Option<u64>) -> Result<(), TickerError> {
        let mut boot = self.boot();
        let matches = match (&boot.serving, session) {
            (Some(serving), Some(session)) => serving.session == session,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return Err(TickerError::NotServing);
        }

        if let Some(serving) = boot.serving.take() {
            let _ = serving.shutdown.send(());
        }
        Ok(())
    }
}

/// Owner of the deadline actor's lifecycle.
pub struct Ticker {
    shared: Arc<Shared>,
}

impl Ticker {
    /// Create a stopped ticker
    pub fn new(config: TickerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                boot: Mutex::new(Boot::default()),
            }),
        }
    }

    /// Start the actor task. Must be called within a tokio runtime.
    pub fn serve(&self) -> Result<Requester, TickerError> {
        let mut boot = self.shared.boot();
        if boot.serving.is_some() {
            return Err(TickerError::AlreadyServing);
        }

        boot.sessions += 1;
        let session = boot.sessions;

        let (inserts_tx, inserts_rx) = mpsc::channel(self.shared.config.inbox.max(1));
        let (cancels_tx, cancels_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let actor = Actor {
            session,
            chain: Chain::new(self.shared.config.resolution()),
            epoch: Instant::now(),
            inserts: inserts_rx,
            cancels: cancels_rx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(actor.run());

        boot.serving = Some(Serving {
            session,
            shutdown: shutdown_tx,
            _inserts: inserts_tx.clone(),
            _cancels: cancels_tx.clone(),
        });

        Ok(Requester {
            session,
            inserts: inserts_tx,
            cancels: cancels_tx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stop the actor task. Outstanding waiters fail with [`TickerError::NotOperable`].
    pub fn close(&self) -> Result<(), TickerError> {
        self.shared.close(None)
    }

    /// Whether a session is currently running
    pub fn is_serving(&self) -> bool {
        self.shared.boot().serving.is_some()
    }
}

/// Cloneable request handle bound to one serving session.
#[derive(Clone)]
pub struct Requester {
    session: u64,
    inserts: mpsc::Sender<Insert>,
    cancels: mpsc::UnboundedSender<WaiterKey>,
    shared: Arc<Shared>,
}

impl Requester {
    /// Obtain a waiter that fires at or after `when`.
    pub async fn request(&self, when: Instant) -> Result<Waiter, TickerError> {
        let (reply, response) = oneshot::channel();
        self.inserts
            .send(Insert { when, reply })
            .await
            .map_err(|_| TickerError::NotOperable)?;

        let (key, signal) = response.await.map_err(|_| TickerError::NotOperable)?;

        Ok(Waiter {
            key,
            signal,
            cancels: self.cancels.clone(),
            released: false,
        })
    }

    /// Stop the session this requester belongs to.
    pub fn close(&self) -> Result<(), TickerError> {
        self.shared.close(Some(self.session))
    }
}

/// One holder of a (possibly shared) deadline.
///
/// Dropping the waiter releases its hold; the node is unlinked once the last
/// holder lets go.
pub struct Waiter {
    key: WaiterKey,
    signal: watch::Receiver<bool>,
    cancels: mpsc::UnboundedSender<WaiterKey>,
    released: bool,
}

impl Waiter {
    /// Resolves once the deadline has passed.
    pub async fn wait(&mut self) -> Result<(), TickerError> {
        self.signal
            .wait_for(|fired| *fired)
            .await
            .map(|_| ())
            .map_err(|_| TickerError::NotOperable)
    }

    /// Whether the deadline already fired
    pub fn fired(&self) -> bool {
        *self.signal.borrow()
    }

    pub fn key(&self) -> WaiterKey {
        self.key
    }

    /// Release this hold on the deadline.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.cancels.send(self.key);
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.release();
    }
}
