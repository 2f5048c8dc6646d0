//! The bounded pre-registration request queue.
//!
//! Until a queue manager is registered, outbound requests go through this
//! small queue and are written by the I/O task as they arrive. It is not
//! segmented and has no xid reuse logic; when it fills, enqueueing fails
//! immediately rather than blocking the producer.

use tokio::sync::mpsc;

use crate::proto::{ChannelCodec, ChannelError};

pub(crate) struct SimpleItem<C: ChannelCodec> {
    pub(crate) request: C::Request,
}

/// Producer handle of the simple path.
pub(crate) struct SimpleQueue<C: ChannelCodec> {
    tx: mpsc::Sender<SimpleItem<C>>,
}

/// Creates the queue and the receiver drained by the I/O task.
pub(crate) fn simple_queue<C: ChannelCodec>(
    depth: usize,
) -> (SimpleQueue<C>, mpsc::Receiver<SimpleItem<C>>) {
    let (tx, rx) = mpsc::channel(depth);
    (SimpleQueue { tx }, rx)
}

impl<C: ChannelCodec> SimpleQueue<C> {
    /// Enqueues a request; fails immediately when full or disconnected.
    pub(crate) fn push(&self, request: C::Request) -> Result<(), ChannelError> {
        self.tx
            .try_send(SimpleItem { request })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ChannelError::Disconnected,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::testing::{TestCodec, TestRequest};

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        // Scenario D: fill to capacity, one more enqueue fails rather than
        // blocking
        let (queue, _rx) = simple_queue::<TestCodec>(2);
        queue.push(TestRequest::single(0)).unwrap();
        queue.push(TestRequest::single(1)).unwrap();

        let err = queue.push(TestRequest::single(2)).unwrap_err();
        assert_eq!(err, ChannelError::QueueFull);
    }

    #[tokio::test]
    async fn test_drained_queue_accepts_again() {
        let (queue, mut rx) = simple_queue::<TestCodec>(1);
        queue.push(TestRequest::single(0)).unwrap();
        assert_eq!(queue.push(TestRequest::single(1)).unwrap_err(), ChannelError::QueueFull);

        let item = rx.recv().await.unwrap();
        assert_eq!(item.request.xid, 0);
        queue.push(TestRequest::single(1)).unwrap();
    }

    #[tokio::test]
    async fn test_closed_receiver_reads_as_disconnect() {
        let (queue, rx) = simple_queue::<TestCodec>(1);
        drop(rx);
        assert_eq!(
            queue.push(TestRequest::single(0)).unwrap_err(),
            ChannelError::Disconnected
        );
    }
}
