//! The task that owns the waiter chain
//!
//! One loop, four wake sources: shutdown, cancellations, inserts and the
//! timer armed at the head deadline. Nothing else ever touches the chain.

use super::chain::{Chain, WaiterKey};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Insert request from a [`super::Requester`].
pub(super) struct Insert {
    pub when: Instant,
    pub reply: oneshot::Sender<(WaiterKey, watch::Receiver<bool>)>,
}

pub(super) struct Actor {
    pub session: u64,
    pub chain: Chain,
    pub epoch: Instant,
    pub inserts: mpsc::Receiver<Insert>,
    pub cancels: mpsc::UnboundedReceiver<WaiterKey>,
    pub shutdown: oneshot::Receiver<()>,
}

impl Actor {
    fn offset(&self, when: Instant) -> u64 {
        u64::try_from(when.saturating_duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }

    fn instant(&self, offset: u64) -> Instant {
        self.epoch + Duration::from_nanos(offset)
    }

    pub async fn run(mut self) {
        debug!(session = self.session, "ticker serving");

        let timer = sleep_until(self.epoch);
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown => break,

                Some(key) = self.cancels.recv() => {
                    self.chain.cancel(key);
                }

                insert = self.inserts.recv() => {
                    let Some(Insert { when, reply }) = insert else {
                        break;
                    };
                    let handle = self.chain.insert(self.offset(when));
                    // Requester stopped waiting for the reply.
                    if let Err((key, _)) = reply.send(handle) {
                        self.chain.cancel(key);
                    }
                }

                _ = &mut timer, if armed => {
                    let now = self.offset(Instant::now());
                    let fired = self.chain.expire(now);
                    trace!(session = self.session, fired, pending = self.chain.len(), "ticker expired waiters");
                }
            }

            match self.chain.next_deadline() {
                Some(next) => {
                    let deadline = self.instant(next);
                    if !armed || timer.deadline() != deadline {
                        timer.as_mut().reset(deadline);
                    }
                    armed = true;
                }
                None => armed = false,
            }
        }

        debug!(session = self.session, pending = self.chain.len(), "ticker stopped");
    }
}
