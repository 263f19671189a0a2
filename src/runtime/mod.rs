//! Per-worker forwarding runtime.
//!
//! Each worker thread owns one readiness poll, one listener set and one
//! connection pool, and drives them from a single event loop. Workers
//! share nothing but the immutable upstream address list.

pub mod buffer;
pub mod connection;
pub mod listener;
pub mod pool;
pub mod worker;

pub use buffer::ByteBuffer;
pub use connection::Connection;
pub use listener::ListenerSet;
pub use pool::ConnectionPool;
pub use worker::{IdleHook, Worker};

/// Most connection records simultaneously in use per worker.
pub const MAX_CONNECTIONS: usize = 4096;

/// Per-connection cap on bytes queued for a slow upstream; beyond this
/// the upstream connection is dropped.
pub const MAX_PENDING: usize = 1024 * 1024;

/// Bytes read from an accepted connection per read call.
pub const READ_CHUNK: usize = 32 * 1024;
