//! The connection adapter: the façade producers talk to.
//!
//! Before a queue manager is registered, requests travel the simple path (a
//! small bounded queue plus a TTL cache pairing replies by xid and expected
//! kind). Registering a manager flips the channel over to the stacked queue
//! for the connection's high-throughput phase.

pub(crate) mod adapter;
pub(crate) mod cache;
pub(crate) mod simple;
