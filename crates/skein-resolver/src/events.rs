//! Events delivered to shard tasks.
//!
//! Everything that touches a resolution's task-serialized state arrives
//! here: fetch startup, shutdown controls, timer ticks, address-lookout
//! completions, connects, and responses. One shard task drains one
//! channel, so events for resolutions in the same shard are strictly
//! serialized.

use crate::resolution::Resolution;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use std::time::Instant;

/// Sender half of a shard's event channel.
pub(crate) type ShardSender = mpsc::UnboundedSender<ShardEvent>;

/// Receiver half of a shard's event channel.
pub(crate) type ShardReceiver = mpsc::UnboundedReceiver<ShardEvent>;

/// One event for a shard task.
pub(crate) enum ShardEvent {
    /// Launch a freshly created resolution.
    Start {
        /// Resolution id.
        rid: u64,
        /// The task-serialized state, handed over to the shard task.
        resolution: Box<Resolution>,
    },
    /// Shutdown control for a resolution.
    Control {
        /// Resolution id.
        rid: u64,
    },
    /// A timer fired.
    Timeout {
        /// Resolution id.
        rid: u64,
        /// Arm generation; stale generations are ignored.
        epoch: u64,
        /// True when the absolute lifetime (not the idle interval) expired.
        lifetime: bool,
    },
    /// An address lookout finished.
    FindDone {
        /// Resolution id.
        rid: u64,
        /// Whether addresses are now available.
        more: bool,
    },
    /// A TCP connect finished.
    Connected {
        /// Resolution id.
        rid: u64,
        /// Query id within the resolution.
        qid: u64,
        /// The connected stream, or the connect error.
        result: std::io::Result<TcpStream>,
    },
    /// A UDP send failed.
    SendError {
        /// Resolution id.
        rid: u64,
        /// Query id within the resolution.
        qid: u64,
    },
    /// A response (or transport failure) for an outstanding query.
    Response {
        /// Resolution id.
        rid: u64,
        /// Query id within the resolution.
        qid: u64,
        /// Raw response bytes and receive time, or the transport error.
        payload: std::io::Result<(Bytes, Instant)>,
    },
}
