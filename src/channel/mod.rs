//! Channel registry
//!
//! A fixed table of per-channel state machines, indexed by channel ID. The
//! table is built once per physical connection and never resized; only each
//! machine's running flag changes afterwards.

mod fsm;

pub use fsm::{Fsm, Machine, Transition};

use std::sync::Arc;
use thiserror::Error;

/// Logical channel identifier carried in the first byte of every segment
pub type ChannelId = u8;

/// Number of addressable channels (IDs 0..=254)
pub const MAX_CHANNELS: usize = 255;

/// Registry errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unregistered channel {0}")]
    Unregistered(usize),

    #[error("no idle channel")]
    NoIdle,

    #[error("channel {0} is not running")]
    NotRunning(ChannelId),

    #[error("invalid channel count {0}, expected 1..={MAX_CHANNELS}")]
    InvalidSize(usize),
}

/// Fixed-size table of channel machines
pub struct Channels<M> {
    channels: Vec<Arc<Fsm<M>>>,
}

impl<M: Machine> Channels<M> {
    /// Build `size` channels, creating each machine with `factory`.
    pub fn new<F>(size: usize, mut factory: F) -> Result<Self, ChannelError>
    where
        F: FnMut(ChannelId) -> M,
    {
        Self::try_new(size, |id| Ok::<_, ChannelError>(factory(id)))
    }

    /// Like [`Channels::new`], with a factory that may fail.
    pub fn try_new<F, E>(size: usize, mut factory: F) -> Result<Self, E>
    where
        F: FnMut(ChannelId) -> Result<M, E>,
        E: From<ChannelError>,
    {
        if size == 0 || size > MAX_CHANNELS {
            return Err(ChannelError::InvalidSize(size).into());
        }

        let channels = (0..size)
            .map(|index| {
                let id = index as ChannelId;
                factory(id).map(|machine| Arc::new(Fsm::new(id, machine)))
            })
            .collect::<Result<_, E>>()?;

        Ok(Self { channels })
    }

    /// Number of channels
    pub fn size(&self) -> usize {
        self.channels.len()
    }

    /// Look up a channel by ID
    pub fn get(&self, id: ChannelId) -> Result<&Arc<Fsm<M>>, ChannelError> {
        self.channels
            .get(id as usize)
            .ok_or(ChannelError::Unregistered(id as usize))
    }

    /// Visit channels in ID order until `visit` returns `false` or fails.
    pub fn all<F>(&self, mut visit: F) -> crate::Result<()>
    where
        F: FnMut(ChannelId, &Arc<Fsm<M>>) -> crate::Result<bool>,
    {
        for channel in &self.channels {
            if !visit(channel.id(), channel)? {
                break;
            }
        }
        Ok(())
    }

    /// First channel (lowest ID) whose machine is not running
    pub fn idle(&self) -> Result<&Arc<Fsm<M>>, ChannelError> {
        self.channels
            .iter()
            .find(|channel| !channel.running())
            .ok_or(ChannelError::NoIdle)
    }

    /// Shut down every running machine, stopping at the first failure.
    pub async fn shutdown(&self) -> crate::Result<()> {
        for channel in &self.channels {
            if channel.running() {
                channel.shutdown().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Steady;

    #[async_trait]
    impl Machine for Steady {
        async fn bootup(&mut self) -> crate::Result<Transition> {
            Ok(Transition::Next)
        }

        async fn tick(&mut self) -> crate::Result<Transition> {
            Ok(Transition::Next)
        }

        async fn shutdown(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    fn steady(_: ChannelId) -> Steady {
        Steady
    }

    #[test]
    fn test_size_bounds() {
        assert!(matches!(
            Channels::new(0, steady),
            Err(ChannelError::InvalidSize(0))
        ));
        assert!(matches!(
            Channels::new(256, steady),
            Err(ChannelError::InvalidSize(256))
        ));
        assert_eq!(Channels::new(255, steady).unwrap().size(), 255);
    }

    #[test]
    fn test_get_bounds() {
        let channels = Channels::new(8, steady).unwrap();
        assert_eq!(channels.get(7).unwrap().id(), 7);
        assert!(matches!(
            channels.get(8),
            Err(ChannelError::Unregistered(8))
        ));
        assert!(matches!(
            channels.get(254),
            Err(ChannelError::Unregistered(254))
        ));
    }

    #[test]
    fn test_all_short_circuits() {
        let channels = Channels::new(10, steady).unwrap();

        let mut visited = Vec::new();
        channels
            .all(|id, _| {
                visited.push(id);
                Ok(id < 3)
            })
            .unwrap();
        assert_eq!(visited, vec![0, 1, 2, 3]);

        let mut visited = 0;
        let err = channels
            .all(|id, _| {
                visited += 1;
                if id == 5 {
                    Err(ChannelError::NoIdle.into())
                } else {
                    Ok(true)
                }
            })
            .unwrap_err();
        assert_eq!(visited, 6);
        assert!(matches!(err, crate::Error::Channel(ChannelError::NoIdle)));
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        const SKIPPED: ChannelId = 77;
        let channels = Channels::new(MAX_CHANNELS, steady).unwrap();

        let mut picked = Vec::new();
        channels
            .all(|id, channel| {
                if id != SKIPPED {
                    picked.push(Arc::clone(channel));
                }
                Ok(true)
            })
            .unwrap();
        assert_eq!(picked.len(), MAX_CHANNELS - 1);

        for channel in &picked {
            channel.bootup().await.unwrap();
            channel.tick().await.unwrap();
        }

        let idle = channels.idle().unwrap();
        assert_eq!(idle.id(), SKIPPED);
        assert!(!idle.running());

        channels.shutdown().await.unwrap();
        channels
            .all(|_, channel| {
                assert!(!channel.running());
                Ok(true)
            })
            .unwrap();
        assert_eq!(channels.idle().unwrap().id(), 0);
    }

    #[tokio::test]
    async fn test_no_idle_channel() {
        let channels = Channels::new(3, steady).unwrap();
        for id in 0..3 {
            channels.get(id).unwrap().bootup().await.unwrap();
        }
        assert!(matches!(channels.idle(), Err(ChannelError::NoIdle)));
    }
}
