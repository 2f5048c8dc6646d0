//! The message seam between the channel core and its pluggable codec.
//!
//! The core never inspects message bytes. Outbound requests are opaque values
//! it can hand to [`ChannelCodec::encode`]; inbound responses are opaque
//! values it can hand to [`ChannelCodec::classify`], which collapses the
//! protocol's many message types into the small [`Classify`] union the core
//! consumes with exhaustive matching.

use bytes::BytesMut;
use thiserror::Error;

/// Transaction identifier correlating a request to its eventual reply.
///
/// XIDs are assigned from a per-channel monotonic counter at reservation time
/// and are never reused for the lifetime of the channel.
pub type Xid = u64;

/// Signature of the pluggable "is this reply terminal" predicate.
///
/// Called with the decoded reply and its more-fragments flag. Returning
/// `false` keeps the originating request outstanding so further reply parts
/// can be collected.
pub type TerminalCheck<R> = fn(&R, bool) -> bool;

/// How a request interacts with the reply stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Ordinary request: the device is expected to send a correlated reply.
    Single,
    /// Synchronization point: its reply implies completion of every request
    /// ordered before it on the same channel.
    Barrier,
    /// Fire-and-forget send: the device never acknowledges it.
    Unacknowledged,
}

/// Connection-lifecycle notifications surfaced to the system listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    /// The device signalled (or the transport detected) a disconnect.
    Disconnected,
    /// The connection went idle.
    Idle,
}

/// Classification of a decoded inbound message.
///
/// Produced by [`ChannelCodec::classify`] and consumed by the channel's
/// dispatch loop with an exhaustive `match`.
#[derive(Debug)]
pub enum Classify {
    /// Connection-lifecycle notification, routed to the system listener.
    System(SystemEvent),
    /// Asynchronous notification with no reply semantics, routed to the
    /// notification listener.
    Notification,
    /// Echo request to be answered immediately, out of band from the queue.
    EchoRequest,
    /// Reply correlated to an outstanding request.
    Reply {
        /// Transaction id of the originating request.
        xid: Xid,
        /// True while further parts of a multi-part reply are pending.
        more_fragments: bool,
    },
    /// Device-reported error correlated to an outstanding request.
    Error {
        /// Transaction id of the originating request.
        xid: Xid,
        /// Device-reported error detail.
        detail: String,
    },
}

/// Errors surfaced while encoding an outbound message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// The message does not fit the outbound frame limits.
    #[error("message does not fit the outbound frame")]
    Overflow,
    /// The message is structurally invalid for the wire format.
    #[error("malformed outbound message: {0}")]
    Malformed(String),
}

/// Errors surfaced while decoding the inbound byte stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte stream does not parse as a protocol frame.
    #[error("malformed inbound frame: {0}")]
    Malformed(String),
    /// A frame announced a length beyond the protocol limit.
    #[error("inbound frame exceeds the maximum frame size")]
    Oversized,
}

/// Errors delivered through a request's completion.
///
/// Failure always travels through the same promise channel as success; the
/// channel's I/O task never propagates these as panics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Reservation or commit was attempted after shutdown began.
    #[error("channel is shutting down")]
    Shutdown,
    /// The connection died with this request outstanding.
    #[error("device disconnected")]
    Disconnected,
    /// The bounded pre-registration queue is full.
    #[error("transaction queue is full")]
    QueueFull,
    /// A queue manager is already registered for this channel.
    #[error("a queue manager is already registered for this channel")]
    AlreadyRegistered,
    /// The transaction was committed twice, or committed after completion.
    #[error("transaction {xid} was already committed or completed")]
    AlreadyCompleted {
        /// Transaction id of the offending commit.
        xid: Xid,
    },
    /// The transaction id is not backed by the queue.
    #[error("transaction {xid} is not backed by the queue")]
    UnknownXid {
        /// Transaction id of the offending commit.
        xid: Xid,
    },
    /// The outbound message could not be encoded.
    #[error("outbound message could not be encoded: {0}")]
    Encode(String),
    /// Writing to the transport failed.
    #[error("transport write failed: {0}")]
    Transport(String),
    /// The device reported an error for this request.
    #[error("device reported an error: {0}")]
    Device(String),
    /// No reply arrived within the response cache time-to-live.
    #[error("timed out waiting for a reply")]
    Timeout,
}

/// Wire codec collaborator.
///
/// Implementations own the byte-level protocol; the channel core only relies
/// on the classification and synthesis operations below. A codec is shared by
/// producer threads and the connection's I/O task, hence `Send + Sync`.
pub trait ChannelCodec: Send + Sync + 'static {
    /// Opaque outbound message unit.
    type Request: Send + 'static;
    /// Opaque decoded inbound message unit.
    type Response: Send + 'static;
    /// Discriminator for reply kinds, used to key the pre-registration
    /// response cache.
    type ReplyKind: Copy + Eq + std::hash::Hash + Send + std::fmt::Debug + 'static;

    /// Serializes `request` into `dst` as one wire frame.
    fn encode(&self, request: &Self::Request, dst: &mut BytesMut) -> Result<(), EncodeError>;

    /// Extracts the next complete inbound message from `src`, leaving any
    /// partial frame in place. Returns `Ok(None)` when more bytes are needed.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Self::Response>, DecodeError>;

    /// Reports how `request` interacts with the reply stream.
    fn kind(&self, request: &Self::Request) -> RequestKind;

    /// Classifies a decoded inbound message for dispatch.
    fn classify(&self, response: &Self::Response) -> Classify;

    /// Reports the reply-kind discriminator of a decoded inbound message.
    fn reply_kind(&self, response: &Self::Response) -> Self::ReplyKind;

    /// Synthesizes a barrier request carrying `xid`.
    ///
    /// Used by the queue manager's barrier policy; the synthesized request
    /// must classify as [`RequestKind::Barrier`].
    fn barrier_request(&self, xid: Xid) -> Self::Request;

    /// Synthesizes the reply to an inbound echo request, or `None` if the
    /// protocol dialect has none.
    fn echo_reply(&self, request: &Self::Response) -> Option<Self::Request>;
}
