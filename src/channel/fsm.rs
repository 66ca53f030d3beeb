//! Per-channel state machine wrapper

use super::{ChannelError, ChannelId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// What a machine wants after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// More ticks are needed
    Next,
    /// The request is complete; the channel becomes idle
    Finished,
}

/// Request handler run on one logical channel.
///
/// The machine decides what a request means; the multiplexer only routes
/// segments to it. Any error returned here marks the physical connection as
/// unusable for the caller.
#[async_trait]
pub trait Machine: Send + 'static {
    /// Prepare for a new request
    async fn bootup(&mut self) -> crate::Result<Transition>;

    /// Advance the request by one step
    async fn tick(&mut self) -> crate::Result<Transition>;

    /// Abandon the request in progress
    async fn shutdown(&mut self) -> crate::Result<()>;
}

/// A machine plus its running flag.
pub struct Fsm<M> {
    id: ChannelId,
    machine: Mutex<M>,
    running: AtomicBool,
}

impl<M: Machine> Fsm<M> {
    pub fn new(id: ChannelId, machine: M) -> Self {
        Self {
            id,
            machine: Mutex::new(machine),
            running: AtomicBool::new(false),
        }
    }

    /// Channel ID this machine serves
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Whether a request is in progress
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start a new request
    pub async fn bootup(&self) -> crate::Result<Transition> {
        let mut machine = self.machine.lock().await;
        let transition = machine.bootup().await?;
        self.running
            .store(transition == Transition::Next, Ordering::Release);
        Ok(transition)
    }

    /// Run one step of the current request
    pub async fn tick(&self) -> crate::Result<Transition> {
        if !self.running() {
            return Err(ChannelError::NotRunning(self.id).into());
        }

        let mut machine = self.machine.lock().await;
        let transition = machine.tick().await?;
        if transition == Transition::Finished {
            self.running.store(false, Ordering::Release);
        }
        Ok(transition)
    }

    /// Stop the current request, if any
    pub async fn shutdown(&self) -> crate::Result<()> {
        if !self.running() {
            return Ok(());
        }

        let mut machine = self.machine.lock().await;
        machine.shutdown().await?;
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Boot, then tick until the machine finishes.
    pub async fn run(&self) -> crate::Result<()> {
        let mut transition = self.bootup().await?;
        while transition == Transition::Next {
            transition = self.tick().await?;
        }
        Ok(())
    }
}
