//! Pre-registration response correlation.
//!
//! Simple-path requests that expect a reply park their completion here,
//! keyed by `(xid, expected reply kind)`. A matching reply resolves and
//! evicts the entry; entries that outlive the time-to-live fail with
//! [`ChannelError::Timeout`]. Timestamps come in as parameters so expiry is
//! driven (and testable) from the outside.

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    collections::Completion,
    proto::{ChannelCodec, ChannelError, Xid},
    sync::EPOCH,
};

struct CacheSlot<R> {
    completion: Completion<R>,
    stamp: Duration,
}

pub(crate) struct ResponseCache<C: ChannelCodec> {
    ttl: Duration,
    inner: Mutex<HashMap<(Xid, C::ReplyKind), CacheSlot<C::Response>>>,
}

impl<C: ChannelCodec> ResponseCache<C> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Parks a completion until a reply of `kind` with `xid` arrives.
    pub(crate) fn insert(&self, xid: Xid, kind: C::ReplyKind, completion: Completion<C::Response>) {
        let slot = CacheSlot {
            completion,
            stamp: EPOCH.elapsed(),
        };
        if let Some(stale) = self.inner.lock().insert((xid, kind), slot) {
            // Keys are unique per connection; a collision means the caller
            // reused an xid it should not have.
            warn!(xid, ?kind, "replaced a cached request with a duplicate key");
            stale.completion.fail(ChannelError::AlreadyCompleted { xid });
        }
    }

    /// Resolves and evicts the entry matching `(xid, kind)`.
    ///
    /// Returns `false` when nothing matched (the reply is unsolicited).
    pub(crate) fn complete(&self, xid: Xid, kind: C::ReplyKind, response: C::Response) -> bool {
        match self.inner.lock().remove(&(xid, kind)) {
            Some(slot) => {
                slot.completion.succeed(vec![response]);
                true
            }
            None => false,
        }
    }

    /// Fails and evicts any entry with `xid`, regardless of expected kind.
    /// Used for device-reported errors, which never carry the expected kind.
    pub(crate) fn fail_xid(&self, xid: Xid, cause: ChannelError) -> bool {
        let mut inner = self.inner.lock();
        let key = inner.keys().find(|(x, _)| *x == xid).copied();
        match key {
            Some(key) => {
                if let Some(slot) = inner.remove(&key) {
                    slot.completion.fail(cause);
                }
                true
            }
            None => false,
        }
    }

    /// Drops the entry for `(xid, kind)` without resolving it. Used to roll
    /// back a registration whose enqueue failed.
    pub(crate) fn remove(&self, xid: Xid, kind: C::ReplyKind) {
        self.inner.lock().remove(&(xid, kind));
    }

    /// Fails every entry whose stamp is older than the time-to-live with a
    /// timeout cause.
    pub(crate) fn expire(&self, now: Duration) -> usize {
        let expired: Vec<_> = {
            let mut inner = self.inner.lock();
            let keys: Vec<_> = inner
                .iter()
                .filter(|(_, slot)| now.saturating_sub(slot.stamp) >= self.ttl)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter().filter_map(|key| inner.remove(&key)).collect()
        };
        let n = expired.len();
        for slot in expired {
            slot.completion.fail(ChannelError::Timeout);
        }
        n
    }

    /// Fails every entry, immediately. Used on disconnect.
    pub(crate) fn fail_all(&self, cause: ChannelError) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.drain().collect()
        };
        let n = drained.len();
        for (_, slot) in drained {
            slot.completion.fail(cause.clone());
        }
        n
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
