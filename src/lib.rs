//! # Tunnelmux
//!
//! Multiplexed channel transport for forwarding proxies: up to 255 logical,
//! independently consumed channels over one long-lived physical connection,
//! plus a coalescing deadline ticker that drives idle timeouts without one
//! timer per channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Channel machines (Machine)            │
//! │        one request state machine per channel        │
//! ├─────────────────────────────────────────────────────┤
//! │            Virtual channels + Channelizer           │
//! │    [id | len_hi | len_lo] segments, dispatch loop   │
//! ├─────────────────────────────────────────────────────┤
//! │                  Codec (external)                   │
//! │            encryption / authentication              │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                    │
//! │                 TCP, any byte stream                │
//! └─────────────────────────────────────────────────────┘
//!          Ticker: one task, one timer, all deadlines
//! ```

pub mod channel;
pub mod config;
pub mod ticker;
pub mod transport;
pub mod tunnel;

pub use channel::{ChannelId, Channels, Fsm, Machine, Transition, MAX_CHANNELS};
pub use config::Config;
pub use ticker::{Requester, Ticker, Waiter};
pub use transport::Connection;
pub use tunnel::{Channelizer, Virtual};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum frame payload size (64 KB - 1)
pub const MAX_FRAME_SIZE: usize = tunnel::MAX_SEGMENT_SIZE;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ticker error: {0}")]
    Ticker(#[from] ticker::TickerError),

    #[error("Channel error: {0}")]
    Channel(#[from] channel::ChannelError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
