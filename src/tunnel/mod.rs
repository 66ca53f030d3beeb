//! Tunnel layer - channel multiplexing over one physical connection
//!
//! Provides:
//! - Segment framing (`[channel, length_hi, length_lo] || payload`)
//! - The [`Channelizer`] dispatch loop that owns the read cursor
//! - [`Virtual`] per-channel read/write handles
//!
//! Only one segment is in flight on the read side at any time: the
//! connection reader itself travels from the dispatcher to the addressed
//! channel and back again when the channel calls [`Virtual::done`].

mod channelizer;
mod frame;
mod virtual_channel;

pub use channelizer::Channelizer;
pub use frame::{decode_segment, encode_segments, SegmentHeader, HEADER_SIZE, MAX_SEGMENT_SIZE};
pub use virtual_channel::Virtual;

use crate::channel::ChannelId;
use crate::ticker::TickerError;
use crate::transport::TransportError;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("dispatch channel {0} unavailable")]
    ChannelUnavailable(ChannelId),

    #[error("invalid channel {0}")]
    InvalidChannel(usize),

    #[error("segment too large: {0} > {MAX_SEGMENT_SIZE}")]
    SegmentTooLarge(usize),

    #[error("connection dropped")]
    ConnectionDropped,

    #[error("shut down")]
    ShutDown,

    #[error("already closing")]
    AlreadyClosing,

    #[error("virtual connection timed out")]
    TimedOut,

    #[error("segment depleted")]
    SegmentDepleted,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Ticker error: {0}")]
    Ticker(#[from] TickerError),
}

impl From<TransportError> for TunnelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => TunnelError::ConnectionDropped,
            other => TunnelError::Transport(other),
        }
    }
}
