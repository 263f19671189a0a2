//! Bounded connection pool with deferred reclamation.
//!
//! Records live in a slab-backed arena and are addressed by index; the
//! indices double as event tokens. Closing a record does not vacate its
//! slot: `push` parks it on a deferred-reclaim list and only
//! `release_temporary`, called at the end of each event batch, makes the
//! slot reusable. Events later in the same batch whose tokens refer to a
//! record closed earlier therefore find a closed record, never a recycled
//! one bound to a different socket.
//!
//! The pool also owns the fan-out graph: a server record heads a
//! doubly-linked sibling chain of the client records that replicate its
//! bytes, so the link surgery that spans several records lives here.

use crate::runtime::connection::Connection;
use crate::runtime::MAX_CONNECTIONS;
use slab::Slab;

/// Arena capacity is grown this many records at a time.
const ALLOCATION_CHUNK: usize = 256;

/// Per-worker pool of connection records.
pub struct ConnectionPool {
    slots: Slab<Connection>,
    /// Closed records awaiting the end of the current event batch.
    reclaim: Vec<usize>,
    in_use: usize,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            reclaim: Vec::new(),
            in_use: 0,
        }
    }

    /// Take a fresh record, or `None` when `MAX_CONNECTIONS` records are
    /// already in use. Arena capacity grows lazily in chunks of 256,
    /// capped by the remaining headroom.
    pub fn pop(&mut self) -> Option<usize> {
        if self.in_use >= MAX_CONNECTIONS {
            return None;
        }

        if self.slots.len() == self.slots.capacity() {
            let headroom = MAX_CONNECTIONS - self.in_use;
            self.slots.reserve(ALLOCATION_CHUNK.min(headroom));
        }

        let idx = self.slots.insert(Connection::default());
        self.in_use += 1;
        Some(idx)
    }

    /// Park a record on the deferred-reclaim list. The caller has already
    /// closed it; the slot stays occupied until `release_temporary`.
    pub fn push(&mut self, idx: usize) {
        debug_assert!(self.slots.contains(idx));
        debug_assert!(!self.slots[idx].is_open());
        self.reclaim.push(idx);
        self.in_use -= 1;
    }

    /// Vacate every deferred slot. Called once per event batch, after the
    /// last event has been dispatched.
    pub fn release_temporary(&mut self) {
        for idx in self.reclaim.drain(..) {
            let _ = self.slots.try_remove(idx);
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Connection> {
        self.slots.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Connection> {
        self.slots.get_mut(idx)
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.slots.contains(idx)
    }

    /// Records currently in use (popped and not yet pushed).
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Records awaiting reclamation at the end of the batch.
    pub fn deferred(&self) -> usize {
        self.reclaim.len()
    }

    /// Link `client` as the newest child of `server`. Children form a
    /// LIFO chain: the most recently attached client is walked first.
    pub fn add_client(&mut self, server: usize, client: usize) {
        let first = self.slots[server].first_child;

        {
            let c = &mut self.slots[client];
            c.server = Some(server);
            c.prev_sibling = None;
            c.next_sibling = first;
        }

        match first {
            Some(first) => self.slots[first].prev_sibling = Some(client),
            None => self.slots[server].last_child = Some(client),
        }
        self.slots[server].first_child = Some(client);
    }

    /// Drop one client record: unlink it from its sibling chain, close
    /// it and park it. When it was the server's last child, the server
    /// is torn down as well.
    ///
    /// A record that is already closed is left alone, so a teardown that
    /// raced an error flag in the same event batch stays single.
    pub fn remove_client(&mut self, client: usize) {
        let (server, prev, next) = {
            let Some(c) = self.slots.get(client) else {
                return;
            };
            if !c.is_open() {
                return;
            }
            let Some(server) = c.server else {
                return;
            };
            (server, c.prev_sibling, c.next_sibling)
        };

        match prev {
            Some(prev) => self.slots[prev].next_sibling = next,
            None => self.slots[server].first_child = next,
        }
        match next {
            Some(next) => self.slots[next].prev_sibling = prev,
            None => self.slots[server].last_child = prev,
        }

        self.slots[client].close();
        self.push(client);

        if self.slots[server].first_child.is_none() {
            self.slots[server].close();
            self.push(server);
        }
    }

    /// Tear down a server record and every client under it.
    pub fn remove_server(&mut self, server: usize) {
        if !self.slots.get(server).map_or(false, |c| c.is_open()) {
            return;
        }

        let mut child = self.slots[server].first_child;
        while let Some(idx) = child {
            child = self.slots[idx].next_sibling;
            self.slots[idx].close();
            self.push(idx);
        }

        let s = &mut self.slots[server];
        s.first_child = None;
        s.last_child = None;
        s.close();
        self.push(server);
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
