//! End-to-end exercises over an in-memory duplex link, with a toy
//! length-prefixed codec and an emulated device on the far side.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};
use takt::{
    ChannelCodec, ChannelError, Classify, DecodeError, EncodeError, QueueConfig, RequestKind,
    SystemEvent, Xid,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    time::timeout,
};

const TIMEOUT: Duration = Duration::from_secs(5);

const OP_REQUEST: u8 = 1;
const OP_BARRIER: u8 = 2;
const OP_PACKET: u8 = 3;
const OP_REPLY: u8 = 4;
const OP_ERROR: u8 = 5;
const OP_NOTIFY: u8 = 6;
const OP_ECHO_REQ: u8 = 7;
const OP_ECHO_REP: u8 = 8;

const FLAG_MORE: u8 = 1 << 0;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    op: u8,
    xid: Xid,
    flags: u8,
    payload: Vec<u8>,
}

impl Frame {
    fn new(op: u8, xid: Xid) -> Self {
        Self {
            op,
            xid,
            flags: 0,
            payload: Vec::new(),
        }
    }

    fn with_payload(op: u8, xid: Xid, payload: Vec<u8>) -> Self {
        Self {
            op,
            xid,
            flags: 0,
            payload,
        }
    }
}

struct ToyCodec;

impl ChannelCodec for ToyCodec {
    type Request = Frame;
    type Response = Frame;
    type ReplyKind = u8;

    fn encode(&self, request: &Frame, dst: &mut BytesMut) -> Result<(), EncodeError> {
        if request.payload.len() > u16::MAX as usize {
            return Err(EncodeError::Overflow);
        }
        dst.put_u8(request.op);
        dst.put_u64_le(request.xid);
        dst.put_u8(request.flags);
        dst.put_u16_le(request.payload.len() as u16);
        dst.put_slice(&request.payload);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        if src.len() < 12 {
            return Ok(None);
        }
        let len = u16::from_le_bytes([src[10], src[11]]) as usize;
        if src.len() < 12 + len {
            return Ok(None);
        }
        let mut header = src.split_to(12);
        let payload = src.split_to(len).to_vec();
        let op = header.get_u8();
        let xid = header.get_u64_le();
        let flags = header.get_u8();
        Ok(Some(Frame {
            op,
            xid,
            flags,
            payload,
        }))
    }

    fn kind(&self, request: &Frame) -> RequestKind {
        match request.op {
            OP_BARRIER => RequestKind::Barrier,
            OP_PACKET => RequestKind::Unacknowledged,
            _ => RequestKind::Single,
        }
    }

    fn classify(&self, response: &Frame) -> Classify {
        match response.op {
            OP_REPLY => Classify::Reply {
                xid: response.xid,
                more_fragments: response.flags & FLAG_MORE != 0,
            },
            OP_ERROR => Classify::Error {
                xid: response.xid,
                detail: String::from_utf8_lossy(&response.payload).into_owned(),
            },
            OP_ECHO_REQ => Classify::EchoRequest,
            _ => Classify::Notification,
        }
    }

    fn reply_kind(&self, response: &Frame) -> u8 {
        response.op
    }

    fn barrier_request(&self, xid: Xid) -> Frame {
        Frame::new(OP_BARRIER, xid)
    }

    fn echo_reply(&self, request: &Frame) -> Option<Frame> {
        Some(Frame::with_payload(
            OP_ECHO_REP,
            request.xid,
            request.payload.clone(),
        ))
    }
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Option<Frame> {
    let mut header = [0u8; 12];
    stream.read_exact(&mut header).await.ok()?;
    let op = header[0];
    let xid = u64::from_le_bytes(header[1..9].try_into().unwrap());
    let flags = header[9];
    let len = u16::from_le_bytes([header[10], header[11]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.ok()?;
    Some(Frame {
        op,
        xid,
        flags,
        payload,
    })
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &Frame) {
    let mut buf = BytesMut::new();
    ToyCodec.encode(frame, &mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
    stream.flush().await.unwrap();
}

#[derive(Default, Clone)]
struct DeviceBehavior {
    /// Requests left unanswered (to be vouched for by a barrier).
    skip: HashSet<Xid>,
    /// Requests answered in three parts.
    multipart: HashSet<Xid>,
    /// Requests answered with a device error.
    error: HashMap<Xid, String>,
}

/// Emulated device: answers requests and barriers, ignores packets.
async fn run_device(stream: DuplexStream, behavior: DeviceBehavior) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    while let Some(frame) = read_frame(&mut reader).await {
        match frame.op {
            OP_REQUEST | OP_BARRIER => {
                if behavior.skip.contains(&frame.xid) {
                    continue;
                }
                if let Some(detail) = behavior.error.get(&frame.xid) {
                    write_frame(
                        &mut writer,
                        &Frame::with_payload(OP_ERROR, frame.xid, detail.clone().into_bytes()),
                    )
                    .await;
                    continue;
                }
                if behavior.multipart.contains(&frame.xid) {
                    for _ in 0..2 {
                        let mut part = Frame::new(OP_REPLY, frame.xid);
                        part.flags = FLAG_MORE;
                        write_frame(&mut writer, &part).await;
                    }
                }
                write_frame(&mut writer, &Frame::new(OP_REPLY, frame.xid)).await;
            }
            _ => {}
        }
    }
}

fn connect(
    behavior: DeviceBehavior,
) -> (
    takt::Channel<ToyCodec>,
    takt::ChannelEvents<ToyCodec>,
    takt::ChannelTask,
) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    tokio::spawn(run_device(remote, behavior));
    let (reader, writer) = tokio::io::split(local);
    takt::channel(reader, writer, ToyCodec).build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn base() {
    let (channel, _events, _task) = connect(DeviceBehavior::default());

    // Early RPC over the simple path
    let features = timeout(
        TIMEOUT,
        channel
            .request(OP_REPLY, |xid| Frame::new(OP_REQUEST, xid))
            .unwrap(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(features.len(), 1);

    // High-throughput phase
    channel.register_queue(QueueConfig::default()).unwrap();
    let mut pendings = Vec::new();
    for _ in 0..100 {
        pendings.push(
            channel
                .request(OP_REPLY, |xid| Frame::new(OP_REQUEST, xid))
                .unwrap(),
        );
    }
    for pending in pendings {
        let replies = timeout(TIMEOUT, pending).await.unwrap().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].op, OP_REPLY);
    }

    // Fire-and-forget resolves on enqueue
    channel.send(|xid| Frame::new(OP_PACKET, xid)).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barrier_vouches_for_unanswered_requests() {
    // The device never answers xid 3; the count-based barrier policy must
    // synthesize a barrier whose reply completes it anyway
    let behavior = DeviceBehavior {
        skip: HashSet::from([3]),
        ..DeviceBehavior::default()
    };
    let (channel, _events, _task) = connect(behavior);

    let config = QueueConfig {
        barrier_max_messages: 8,
        barrier_interval: Duration::from_millis(100),
        ..QueueConfig::default()
    };
    channel.register_queue(config).unwrap();

    let mut pendings = Vec::new();
    for _ in 0..8 {
        pendings.push(
            channel
                .request(OP_REPLY, |xid| Frame::new(OP_REQUEST, xid))
                .unwrap(),
        );
    }

    for (i, pending) in pendings.into_iter().enumerate() {
        let replies = timeout(TIMEOUT, pending).await.unwrap().unwrap();
        if i == 3 {
            // Completed by the barrier cascade, no explicit reply
            assert!(replies.is_empty());
        } else {
            assert_eq!(replies.len(), 1);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interval_barrier_bounds_staleness() {
    // Below the count threshold, the timer alone must produce the barrier
    let behavior = DeviceBehavior {
        skip: HashSet::from([0]),
        ..DeviceBehavior::default()
    };
    let (channel, _events, _task) = connect(behavior);

    let config = QueueConfig {
        barrier_max_messages: 1_000_000,
        barrier_interval: Duration::from_millis(50),
        ..QueueConfig::default()
    };
    channel.register_queue(config).unwrap();

    let pending = channel
        .request(OP_REPLY, |xid| Frame::new(OP_REQUEST, xid))
        .unwrap();
    let replies = timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert!(replies.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multipart_replies_accumulate() {
    let behavior = DeviceBehavior {
        multipart: HashSet::from([0]),
        ..DeviceBehavior::default()
    };
    let (channel, _events, _task) = connect(behavior);
    channel.register_queue(QueueConfig::default()).unwrap();

    let pending = channel
        .request(OP_REPLY, |xid| Frame::new(OP_REQUEST, xid))
        .unwrap();
    let replies = timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert_eq!(replies.len(), 3);
    assert!(replies[0].flags & FLAG_MORE != 0);
    assert!(replies[2].flags & FLAG_MORE == 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn device_error_fails_the_request() {
    let behavior = DeviceBehavior {
        error: HashMap::from([(0, "table full".to_string())]),
        ..DeviceBehavior::default()
    };
    let (channel, _events, _task) = connect(behavior);
    channel.register_queue(QueueConfig::default()).unwrap();

    let pending = channel
        .request(OP_REPLY, |xid| Frame::new(OP_REQUEST, xid))
        .unwrap();
    let err = timeout(TIMEOUT, pending).await.unwrap().unwrap_err();
    assert_eq!(err, ChannelError::Device("table full".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_answered_out_of_band() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(local);
    let (_channel, _events, _task) = takt::channel(reader, writer, ToyCodec).build();

    // The device pings; the channel must answer without consuming a
    // producer xid
    write_frame(
        &mut remote,
        &Frame::with_payload(OP_ECHO_REQ, 77, b"ping".to_vec()),
    )
    .await;

    let reply = timeout(TIMEOUT, read_frame(&mut remote)).await.unwrap().unwrap();
    assert_eq!(reply.op, OP_ECHO_REP);
    assert_eq!(reply.xid, 77);
    assert_eq!(reply.payload, b"ping".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notifications_reach_the_listener() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(local);
    let (_channel, mut events, _task) = takt::channel(reader, writer, ToyCodec).build();

    write_frame(&mut remote, &Frame::new(OP_NOTIFY, 0)).await;

    let notification = timeout(TIMEOUT, events.notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.op, OP_NOTIFY);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_fails_everything_outstanding() {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(local);
    let (channel, mut events, _task) = takt::channel(reader, writer, ToyCodec).build();
    channel.register_queue(QueueConfig::default()).unwrap();

    let mut pendings = Vec::new();
    for _ in 0..10 {
        pendings.push(
            channel
                .request(OP_REPLY, |xid| Frame::new(OP_REQUEST, xid))
                .unwrap(),
        );
    }

    // The device goes away mid-flight
    drop(remote);

    for pending in pendings {
        let err = timeout(TIMEOUT, pending).await.unwrap().unwrap_err();
        assert_eq!(err, ChannelError::Disconnected);
    }
    let event = timeout(TIMEOUT, events.system.recv()).await.unwrap().unwrap();
    assert_eq!(event, SystemEvent::Disconnected);

    // The channel rejects further work
    let err = channel
        .request(OP_REPLY, |xid| Frame::new(OP_REQUEST, xid))
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, ChannelError::Shutdown | ChannelError::Disconnected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_share_one_channel() {
    let (channel, _events, _task) = connect(DeviceBehavior::default());
    channel.register_queue(QueueConfig::default()).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let channel = channel.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                let pending = channel
                    .request(OP_REPLY, |xid| Frame::new(OP_REQUEST, xid))
                    .unwrap();
                let replies = timeout(TIMEOUT, pending).await.unwrap().unwrap();
                assert_eq!(replies.len(), 1);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}
