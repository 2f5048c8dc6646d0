//! Takt: a transaction-correlated control channel featuring concurrent
//! request reservation, strict in-order transmission, and barrier-based
//! synchronization.
//!
//! Takt implements the controller side of a persistent, message-oriented
//! connection to a remote device: many producer threads issue asynchronous
//! requests, one event loop per connection serializes them onto the socket
//! respecting flow control, and device replies are matched back to their
//! originating requests by transaction id — even when they arrive out of
//! order, in fragments, or not at all (a barrier's reply vouches for
//! everything ordered before it).
//!
//! # Overview
//!
//! ```text
//!  PRODUCERS                                               User code  :
//! ┌──────────┐ ┌──────────┐ ┌──────────┐                              :
//! │ thread A │ │ thread B │ │ thread C │  reserve xid, commit request :
//! └────┬─────┘ └────┬─────┘ └────┬─────┘                              :
//!      ▼            ▼            ▼                                    :
//! ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~:
//!  STACKED QUEUE                                          Takt code   :
//! ┌────────────────────────────────────────────────────────────┐      :
//! │  Segment 0            Segment 1                            │      :
//! │  [0][1][2][3]...4095  [4096][4097]...      (xid-indexed)   │      :
//! │   ▲ flush cursor: committed entries leave in xid order     │      :
//! └───┼────────────────────────────────────────────────────────┘      :
//!     │ write_entries          ▲ pair_reply (by xid)                  :
//!     ▼                        │                                      :
//! ┌──────────────────────────────────────────────────────┐            :
//! │  I/O task: flush ─► transport ─► device ─► replies   │            :
//! └──────────────────────────────────────────────────────┘            :
//!                                                                     :
//!  Barrier: reply to [B] implies completion of [..B) ────► cascade    :
//! ```
//!
//! Producers never block: reservation is one atomic increment on the fast
//! path, commits publish with a release store, and structural changes take a
//! lock held only briefly and never across a transport write. The connection
//! dying fails every outstanding request through the same promise channel
//! successes use — nothing is left in limbo.
//!
//! # Features
//!
//! - **Transaction-indexed segmented queue**: xids map straight to queue
//!   slots; segments are pooled and recycled (see [`QueueConfig`])
//! - **Barrier synchronization**: a configurable count/time policy inserts
//!   synchronization points so batched requests have a bounded completion
//!   horizon (see [`BarrierMode`])
//! - **Pluggable wire codec**: the channel never inspects message bytes;
//!   implement [`ChannelCodec`] for your protocol dialect
//! - **Pre-registration simple path**: early request/reply RPCs run through
//!   a small bounded queue with a TTL response cache before the
//!   high-throughput queue manager is registered
//! - **Exhaustive failure delivery**: rejection, capacity, transport,
//!   device-reported, disconnect and timeout failures all arrive through the
//!   request's [`PendingReply`] (see [`ChannelError`])
//!
//! # Quick start
//!
//! ```text
//! let stream = TcpStream::connect("10.0.0.2:6653").await?;
//! let (reader, writer) = stream.into_split();
//!
//! // MyCodec implements ChannelCodec for the device's wire dialect
//! let (channel, mut events, task) = takt::channel(reader, writer, MyCodec).build();
//!
//! // Early, low-rate RPC over the simple path
//! let hello = channel.request(MyReplyKind::Features, |xid| MyCodec::features(xid))?.await?;
//!
//! // Switch to the high-throughput queue for the programming phase
//! channel.register_queue(QueueConfig::default())?;
//! let done = channel.request(MyReplyKind::FlowMod, |xid| MyCodec::flow_mod(xid, flow))?;
//!
//! // Fire-and-forget sends resolve on local enqueue
//! channel.send(|xid| MyCodec::packet_out(xid, pkt))?;
//!
//! // Notifications arrive on their own listener
//! while let Some(msg) = events.notifications.recv().await { /* ... */ }
//! ```

mod channel;
mod collections;
mod proto;
mod queue;
mod sync;
mod transport;

pub use channel::adapter::{Channel, ChannelBuilder, ChannelEvents, ChannelTask, channel};
pub use collections::promise::PendingReply;
pub use proto::{
    ChannelCodec, ChannelError, Classify, DecodeError, EncodeError, RequestKind, SystemEvent,
    TerminalCheck, Xid,
};
pub use queue::{BarrierMode, QueueConfig};
pub use transport::{StreamTransport, Transport};
