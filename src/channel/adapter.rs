//! High-level channel API: the connection adapter and its I/O task.
//!
//! This module provides the main [`Channel`] interface for issuing requests
//! over a switch-control connection. A channel is created around a connected
//! transport with [`channel()`], which spawns a background [`ChannelTask`]
//! owning all socket I/O for the connection.
//!
//! # Architecture
//!
//! - **[`Channel`]**: the producer-facing handle. Cheaply cloneable; any
//!   number of tasks can issue requests concurrently.
//! - **[`ChannelTask`]**: the background task. It is the connection's event
//!   loop: it reads and dispatches inbound messages, drains the outbound
//!   queues, answers echo requests, and unwinds everything on disconnect.
//! - **[`ChannelEvents`]**: receivers for notifications and
//!   connection-lifecycle events.
//!
//! Requests issued before [`Channel::register_queue`] travel the simple
//! path: a small bounded queue plus a TTL response cache. Registering a
//! queue manager switches the channel to the transaction-indexed stacked
//! queue for the high-throughput phase of the connection.

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    cache::ResponseCache,
    simple::{SimpleItem, SimpleQueue, simple_queue},
};
use crate::{
    collections::{Completion, promise::PendingReply},
    proto::{ChannelCodec, ChannelError, Classify, SystemEvent, TerminalCheck, Xid},
    queue::{
        QueueConfig,
        entry::reply_is_terminal,
        manager::QueueManager,
        stacked::{StackedQueue, stacked_queue},
    },
    sync::{AtomicDuration, EPOCH, Waiter},
    transport::{StreamTransport, Transport},
};

/// Simple-path xid assignment, closed when a queue manager takes over.
struct SimpleGate {
    next_xid: Xid,
    closed: bool,
}

enum Control<C: ChannelCodec> {
    Register {
        manager: QueueManager<C>,
        gate: Waiter,
    },
}

struct Shared<C: ChannelCodec> {
    codec: C,
    /// Fast-path pointer to the registered queue; `None` pre-registration.
    queue: ArcSwapOption<StackedQueue<C>>,
    simple: SimpleQueue<C>,
    simple_gate: Mutex<SimpleGate>,
    cache: ResponseCache<C>,
    control: mpsc::UnboundedSender<Control<C>>,
}

enum Route<C: ChannelCodec> {
    Stacked(Arc<StackedQueue<C>>),
    Simple(Xid),
}

/// Producer façade of a control-channel connection.
///
/// All send-style operations assign the transaction id for the caller: the
/// `build` closure receives the reserved xid and returns the finished
/// request carrying it. Requests either resolve through the returned
/// [`PendingReply`] or fail through it; nothing is ever silently dropped
/// while the connection lives.
pub struct Channel<C: ChannelCodec> {
    shared: Arc<Shared<C>>,
    token: CancellationToken,
}

impl<C: ChannelCodec> Clone for Channel<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            token: self.token.clone(),
        }
    }
}

impl<C: ChannelCodec> Channel<C> {
    /// Issues a request expecting a reply and returns its pending outcome.
    ///
    /// Before a queue manager is registered the request travels the simple
    /// path and `expect` keys the response cache; afterwards replies are
    /// paired by transaction id alone and `expect` is not consulted.
    pub fn request(
        &self,
        expect: C::ReplyKind,
        build: impl FnOnce(Xid) -> C::Request,
    ) -> Result<PendingReply<C::Response>, ChannelError> {
        self.request_with(expect, reply_is_terminal::<C::Response>, build)
    }

    /// [`request`](Self::request) with a caller-supplied terminal predicate,
    /// for multi-part replies with unusual termination rules.
    pub fn request_with(
        &self,
        expect: C::ReplyKind,
        terminal: TerminalCheck<C::Response>,
        build: impl FnOnce(Xid) -> C::Request,
    ) -> Result<PendingReply<C::Response>, ChannelError> {
        match self.route()? {
            Route::Stacked(queue) => {
                let xid = queue.reserve().ok_or(ChannelError::Shutdown)?;
                let request = build(xid);
                let kind = self.shared.codec.kind(&request);
                let (completion, pending) = Completion::new();
                queue.commit(xid, request, kind, Some(completion), terminal)?;
                Ok(pending)
            }
            Route::Simple(xid) => {
                let request = build(xid);
                let (completion, pending) = Completion::new();
                // Register before enqueueing so the reply cannot race the
                // cache entry.
                self.shared.cache.insert(xid, expect, completion);
                if let Err(e) = self.shared.simple.push(request) {
                    self.shared.cache.remove(xid, expect);
                    return Err(e);
                }
                Ok(pending)
            }
        }
    }

    /// Issues a fire-and-forget send.
    ///
    /// Resolves on successful local enqueue; the device never acknowledges
    /// these.
    pub fn send(&self, build: impl FnOnce(Xid) -> C::Request) -> Result<(), ChannelError> {
        match self.route()? {
            Route::Stacked(queue) => {
                let xid = queue.reserve().ok_or(ChannelError::Shutdown)?;
                let request = build(xid);
                let kind = self.shared.codec.kind(&request);
                queue.commit(xid, request, kind, None, reply_is_terminal::<C::Response>)
            }
            Route::Simple(xid) => self.shared.simple.push(build(xid)),
        }
    }

    /// Registers the high-throughput queue manager for this connection.
    ///
    /// At most one manager may exist per connection; a second registration
    /// fails with [`ChannelError::AlreadyRegistered`]. The stacked queue is
    /// seeded with the next unissued xid, so simple-path and stacked ids
    /// never collide.
    pub fn register_queue(&self, config: QueueConfig) -> Result<(), ChannelError> {
        let mut gate = self.shared.simple_gate.lock();
        if gate.closed {
            return Err(ChannelError::AlreadyRegistered);
        }

        let (queue, drain, waiter) = stacked_queue::<C>(gate.next_xid, config.barrier_mode);
        let manager = QueueManager::new(queue.clone(), drain, config);
        self.shared
            .control
            .send(Control::Register {
                manager,
                gate: waiter,
            })
            .map_err(|_| ChannelError::Disconnected)?;

        self.shared.queue.store(Some(queue));
        gate.closed = true;
        Ok(())
    }

    /// Requests connection teardown; outstanding requests fail with a
    /// disconnect cause.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether teardown has been requested or the connection has died.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    fn route(&self) -> Result<Route<C>, ChannelError> {
        if let Some(queue) = self.shared.queue.load_full() {
            return Ok(Route::Stacked(queue));
        }
        let mut gate = self.shared.simple_gate.lock();
        if gate.closed {
            // Registration won the race; the queue pointer was published
            // before the gate closed.
            drop(gate);
            return self
                .shared
                .queue
                .load_full()
                .map(Route::Stacked)
                .ok_or(ChannelError::Disconnected);
        }
        let xid = gate.next_xid;
        gate.next_xid += 1;
        Ok(Route::Simple(xid))
    }
}

/// Receivers for inbound traffic that is not a reply.
pub struct ChannelEvents<C: ChannelCodec> {
    /// Protocol notifications with no reply semantics.
    pub notifications: mpsc::UnboundedReceiver<C::Response>,
    /// Connection-lifecycle events (disconnect, idle).
    pub system: mpsc::UnboundedReceiver<SystemEvent>,
}

struct TaskKnobs {
    write_timeout: AtomicDuration,
    cache_sweep: AtomicDuration,
}

/// Handle to the connection's background I/O task.
pub struct ChannelTask {
    handle: JoinHandle<()>,
    token: CancellationToken,
    knobs: Arc<TaskKnobs>,
}

impl ChannelTask {
    /// Sets the timeout for pushing staged bytes to the socket. A drain that
    /// exceeds it tears the connection down.
    ///
    /// Default: 10 seconds.
    pub fn set_write_timeout(&self, timeout: Duration) {
        self.knobs.write_timeout.store(timeout);
    }

    /// Sets how often the response cache is swept for expired entries.
    ///
    /// Default: 1 second.
    pub fn set_cache_sweep_interval(&self, interval: Duration) {
        self.knobs.cache_sweep.store(interval);
    }

    /// Stops the task and returns a handle to await its teardown.
    pub fn stop(self) -> JoinHandle<()> {
        let Self { handle, token, knobs: _ } = self;
        token.cancel();
        handle
    }
}

/// Builder for a [`Channel`] and its background task.
pub struct ChannelBuilder<R, W, C> {
    reader: R,
    writer: W,
    codec: C,
    cache_ttl: Duration,
    simple_depth: usize,
    high_watermark: usize,
    write_timeout: Duration,
    cache_sweep: Duration,
}

impl<R, W, C> ChannelBuilder<R, W, C>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    C: ChannelCodec,
{
    /// Time-to-live of simple-path cache entries; expiry fails the request
    /// with [`ChannelError::Timeout`].
    ///
    /// Default: 60 seconds.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Depth of the bounded pre-registration queue; enqueueing into a full
    /// queue fails immediately with [`ChannelError::QueueFull`].
    ///
    /// Default: 64.
    #[must_use]
    pub fn simple_depth(mut self, depth: usize) -> Self {
        self.simple_depth = depth;
        self
    }

    /// Staged outbound bytes beyond which the transport reports itself
    /// unwritable and flushing pauses.
    ///
    /// Default: 64 KiB.
    #[must_use]
    pub fn high_watermark(mut self, bytes: usize) -> Self {
        self.high_watermark = bytes;
        self
    }

    /// Initial socket write timeout; adjustable at runtime via
    /// [`ChannelTask::set_write_timeout`].
    ///
    /// Default: 10 seconds.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Initial response-cache sweep interval; adjustable at runtime via
    /// [`ChannelTask::set_cache_sweep_interval`].
    ///
    /// Default: 1 second.
    #[must_use]
    pub fn cache_sweep_interval(mut self, interval: Duration) -> Self {
        self.cache_sweep = interval;
        self
    }

    /// Builds the channel and spawns its I/O task.
    #[must_use]
    pub fn build(self) -> (Channel<C>, ChannelEvents<C>, ChannelTask) {
        let Self {
            reader,
            writer,
            codec,
            cache_ttl,
            simple_depth,
            high_watermark,
            write_timeout,
            cache_sweep,
        } = self;

        let (simple, simple_rx) = simple_queue::<C>(simple_depth);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        let (system_tx, system_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            codec,
            queue: ArcSwapOption::from(None),
            simple,
            simple_gate: Mutex::new(SimpleGate {
                next_xid: 0,
                closed: false,
            }),
            cache: ResponseCache::new(cache_ttl),
            control: control_tx,
        });
        let token = CancellationToken::new();
        let knobs = Arc::new(TaskKnobs {
            write_timeout: AtomicDuration::new(write_timeout),
            cache_sweep: AtomicDuration::new(cache_sweep),
        });

        let transport = StreamTransport::new(writer, high_watermark);
        let handle = tokio::spawn(channel_task(
            reader,
            transport,
            shared.clone(),
            simple_rx,
            control_rx,
            notif_tx,
            system_tx,
            knobs.clone(),
            token.clone(),
        ));

        (
            Channel {
                shared,
                token: token.clone(),
            },
            ChannelEvents {
                notifications: notif_rx,
                system: system_rx,
            },
            ChannelTask {
                handle,
                token,
                knobs,
            },
        )
    }
}

/// Creates a channel over a connected transport.
///
/// The returned builder configures the connection-scoped knobs; `build()`
/// spawns the I/O task and hands back the producer façade plus the event
/// receivers.
pub fn channel<R, W, C>(reader: R, writer: W, codec: C) -> ChannelBuilder<R, W, C>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    C: ChannelCodec,
{
    ChannelBuilder {
        reader,
        writer,
        codec,
        cache_ttl: Duration::from_secs(60),
        simple_depth: 64,
        high_watermark: 64 * 1024,
        write_timeout: Duration::from_secs(10),
        cache_sweep: Duration::from_secs(1),
    }
}

// ================================================================================================
// ChannelTask - the connection's event loop
// ================================================================================================

#[allow(clippy::too_many_arguments)]
async fn channel_task<R, W, C>(
    mut reader: R,
    mut transport: StreamTransport<W>,
    shared: Arc<Shared<C>>,
    mut simple_rx: mpsc::Receiver<SimpleItem<C>>,
    mut control_rx: mpsc::UnboundedReceiver<Control<C>>,
    notifications: mpsc::UnboundedSender<C::Response>,
    system: mpsc::UnboundedSender<SystemEvent>,
    knobs: Arc<TaskKnobs>,
    token: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    C: ChannelCodec,
{
    let mut read_buf = BytesMut::with_capacity(16 * 1024);
    let mut scratch = BytesMut::new();
    let mut manager: Option<QueueManager<C>> = None;
    let mut flush_gate: Option<Waiter> = None;
    let mut sweep = tokio::time::interval(knobs.cache_sweep.load().max(Duration::from_millis(1)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Pushes staged bytes to the socket with timeout protection. Evaluates
    // to false when the connection must come down.
    macro_rules! drain_transport {
        () => {{
            let timeout = knobs.write_timeout.load();
            match tokio::time::timeout(timeout, transport.drain()).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    warn!(error = %e, "transport drain failed");
                    false
                }
                Err(_) => {
                    warn!("transport write timed out");
                    false
                }
            }
        }};
    }

    // Opportunistic flush: drains ready queue entries and pushes the staged
    // bytes out.
    macro_rules! flush_queue {
        () => {{
            let mut alive = true;
            if let Some(mgr) = manager.as_mut() {
                let written = mgr.flush(&mut transport, &shared.codec);
                if written > 0 || transport.pending() > 0 {
                    alive = drain_transport!();
                }
            }
            alive
        }};
    }

    // Routes a classified reply: queue pairing first, then the
    // pre-registration cache, else it is unsolicited.
    macro_rules! route_reply {
        ($xid:expr, $response:expr, $more:expr, $error:expr) => {{
            let xid = $xid;
            let error: Option<String> = $error;
            let mut unmatched = Some($response);
            if let Some(mgr) = manager.as_mut() {
                if let Some(response) = unmatched.take() {
                    unmatched = mgr.pair_reply(xid, response, $more, error.clone());
                }
            }
            if let Some(response) = unmatched {
                match &error {
                    Some(detail) => {
                        if !shared.cache.fail_xid(xid, ChannelError::Device(detail.clone())) {
                            warn!(xid, "unmatched error reply");
                        }
                    }
                    None => {
                        let kind = shared.codec.reply_kind(&response);
                        if !shared.cache.complete(xid, kind, response) {
                            warn!(xid, "unmatched reply");
                        }
                    }
                }
            }
        }};
    }

    'io: loop {
        // The barrier timer arm only participates once a barrier-capable
        // manager is registered.
        let barrier_armed = manager.as_ref().is_some_and(|m| m.barriers_enabled());
        let barrier_deadline = manager
            .as_ref()
            .map(|m| m.barrier_deadline())
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(60));

        tokio::select! {
            _ = token.cancelled() => {
                debug!("channel close requested");
                break 'io;
            }

            ctrl = control_rx.recv() => {
                if let Some(Control::Register { manager: mgr, gate }) = ctrl {
                    debug!("queue manager registered");
                    manager = Some(mgr);
                    flush_gate = Some(gate);
                    if !flush_queue!() {
                        break 'io;
                    }
                }
            }

            res = reader.read_buf(&mut read_buf) => {
                match res {
                    Ok(0) => {
                        debug!("connection closed by peer");
                        break 'io;
                    }
                    Ok(_) => {
                        loop {
                            match shared.codec.decode(&mut read_buf) {
                                Ok(Some(response)) => match shared.codec.classify(&response) {
                                    Classify::System(event) => {
                                        // Lifecycle notifications invalidate
                                        // the simple-path cache immediately.
                                        shared.cache.fail_all(ChannelError::Disconnected);
                                        let _ = system.send(event);
                                        if event == SystemEvent::Disconnected {
                                            break 'io;
                                        }
                                    }
                                    Classify::Notification => {
                                        let _ = notifications.send(response);
                                    }
                                    Classify::EchoRequest => {
                                        // Answered inline, out of band from
                                        // the queues; no producer xid spent.
                                        if let Some(reply) = shared.codec.echo_reply(&response) {
                                            scratch.clear();
                                            match shared.codec.encode(&reply, &mut scratch) {
                                                Ok(()) => {
                                                    if transport.write(&scratch).is_err() {
                                                        break 'io;
                                                    }
                                                    if !drain_transport!() {
                                                        break 'io;
                                                    }
                                                }
                                                Err(e) => {
                                                    warn!(error = %e, "failed to encode echo reply")
                                                }
                                            }
                                        }
                                    }
                                    Classify::Reply { xid, more_fragments } => {
                                        route_reply!(xid, response, more_fragments, None);
                                    }
                                    Classify::Error { xid, detail } => {
                                        route_reply!(xid, response, false, Some(detail));
                                    }
                                },
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(error = %e, "failed to decode inbound frame");
                                    break 'io;
                                }
                            }
                        }
                        // Opportunistic flush on read-complete
                        if !flush_queue!() {
                            break 'io;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "transport read failed");
                        break 'io;
                    }
                }
            }

            item = simple_rx.recv() => {
                if let Some(SimpleItem { request }) = item {
                    scratch.clear();
                    match shared.codec.encode(&request, &mut scratch) {
                        Ok(()) => {
                            if transport.write(&scratch).is_err() {
                                break 'io;
                            }
                            if !drain_transport!() {
                                break 'io;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode pre-registration request"),
                    }
                }
            }

            _ = async { if let Some(gate) = &flush_gate { let _ = gate.wait().await; } }, if flush_gate.is_some() => {
                if !flush_queue!() {
                    break 'io;
                }
            }

            _ = tokio::time::sleep_until(barrier_deadline), if barrier_armed => {
                if let Some(mgr) = manager.as_mut() {
                    mgr.on_barrier_timer(&shared.codec);
                }
                if !flush_queue!() {
                    break 'io;
                }
            }

            _ = sweep.tick() => {
                let expired = shared.cache.expire(EPOCH.elapsed());
                if expired > 0 {
                    debug!(expired, "expired cached requests");
                }
                let interval = knobs.cache_sweep.load().max(Duration::from_millis(1));
                if sweep.period() != interval {
                    sweep = tokio::time::interval(interval);
                    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                }
            }
        }
    }

    // Disconnect processing: every outstanding request fails, exhaustively.
    debug!("unwinding connection");
    token.cancel();
    shared.cache.fail_all(ChannelError::Disconnected);
    let _ = system.send(SystemEvent::Disconnected);

    if let Some(mgr) = manager.as_mut() {
        let failed = mgr.start_shutdown();
        debug!(failed, "failed outstanding transactions");
        while !mgr.finish_shutdown(&transport) {
            tokio::task::yield_now().await;
        }
    }

    // Registrations that raced teardown can never be serviced; unwind them
    // the same way.
    control_rx.close();
    while let Ok(Control::Register { manager: mut mgr, .. }) = control_rx.try_recv() {
        mgr.start_shutdown();
        while !mgr.finish_shutdown(&transport) {
            tokio::task::yield_now().await;
        }
    }

    simple_rx.close();
    while simple_rx.try_recv().is_ok() {}
}
