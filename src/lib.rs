//! tcp-fanout: a multi-threaded TCP traffic forwarder.
//!
//! Every connection accepted on a bound endpoint is replicated, byte for
//! byte, to a configured set of upstream servers over parallel outbound
//! connections. The reverse direction is never forwarded. Each worker
//! thread drives its own edge-triggered readiness loop over its own
//! listener set and connection pool; workers share nothing but the
//! immutable upstream address list.

pub mod addr;
pub mod config;
pub mod forwarder;
pub mod runtime;
