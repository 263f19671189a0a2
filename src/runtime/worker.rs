//! Worker thread: the per-core event loop.
//!
//! A worker owns one `mio::Poll`, its listener set and its connection
//! pool. Accepted connections become server records; for each of them the
//! worker opens one outbound connection per upstream address and links
//! those client records under the server. Bytes read from a server record
//! are replicated to every child; the reverse direction is never read.
//!
//! Event tokens are a tagged space: values below `LISTENER_BASE` are pool
//! indices, values at or above it are listener ordinals. `LISTENER_BASE`
//! sits far above any index the bounded pool can produce, so the two
//! ranges cannot collide.

use crate::runtime::listener::ListenerSet;
use crate::runtime::pool::ConnectionPool;
use crate::runtime::{MAX_CONNECTIONS, READ_CHUNK};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Called when a poll round times out with no events.
pub type IdleHook = Arc<dyn Fn(usize) + Send + Sync>;

/// First token value reserved for listeners.
const LISTENER_BASE: usize = usize::MAX >> 1;

/// How long one poll round may block.
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// One forwarding worker.
///
/// `listen`/`listen_range` populate the listener set before `start`;
/// `start` moves the listeners into the spawned thread together with a
/// fresh poll instance and pool. `stop` flips the running flag and joins;
/// the loop notices at its next wakeup.
pub struct Worker {
    index: usize,
    listeners: Option<ListenerSet>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            listeners: Some(ListenerSet::new()),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Bound addresses of this worker's listeners (pre-start only).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .as_ref()
            .map(|l| l.local_addrs())
            .unwrap_or_default()
    }

    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.pre_start_listeners()?.listen(addr)
    }

    pub fn listen_range(
        &mut self,
        ip: std::net::IpAddr,
        minport: u16,
        maxport: u16,
    ) -> io::Result<()> {
        self.pre_start_listeners()?.listen_range(ip, minport, maxport)
    }

    fn pre_start_listeners(&mut self) -> io::Result<&mut ListenerSet> {
        self.listeners
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker already started"))
    }

    /// Register the listeners and spawn the event-loop thread.
    pub fn start(
        &mut self,
        upstreams: Arc<Vec<SocketAddr>>,
        idle: Option<IdleHook>,
    ) -> io::Result<()> {
        let mut listeners = self
            .listeners
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker already started"))?;

        let poll = Poll::new()?;
        for (i, listener) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(listener, Token(LISTENER_BASE + i), Interest::READABLE)?;
        }

        self.running.store(true, Ordering::Relaxed);

        let mut event_loop = EventLoop {
            index: self.index,
            poll,
            listeners,
            pool: ConnectionPool::new(),
            upstreams,
            idle,
            running: Arc::clone(&self.running),
        };

        let handle = thread::Builder::new()
            .name(format!("worker-{}", self.index))
            .spawn(move || event_loop.run())?;
        self.handle = Some(handle);

        Ok(())
    }

    /// Ask the event loop to exit and wait for the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// The state owned by one worker thread.
struct EventLoop {
    index: usize,
    poll: Poll,
    listeners: ListenerSet,
    pool: ConnectionPool,
    upstreams: Arc<Vec<SocketAddr>>,
    idle: Option<IdleHook>,
    running: Arc<AtomicBool>,
}

impl EventLoop {
    fn run(&mut self) {
        debug!(
            worker = self.index,
            listeners = self.listeners.len(),
            upstreams = self.upstreams.len(),
            "Worker started"
        );

        let mut events = Events::with_capacity(MAX_CONNECTIONS);

        while self.running.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) if events.is_empty() => {
                    if let Some(idle) = &self.idle {
                        idle(self.index);
                    }
                }
                Ok(()) => {
                    for event in events.iter() {
                        self.dispatch(event);
                    }
                    // Closed records become reusable only now, so tokens
                    // later in this batch could not have resolved to a
                    // recycled record.
                    self.pool.release_temporary();
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(worker = self.index, error = %e, "Poll failed, worker exiting");
                    break;
                }
            }
        }

        debug!(worker = self.index, "Worker stopped");
    }

    fn dispatch(&mut self, event: &Event) {
        let token = event.token().0;
        if token >= LISTENER_BASE {
            if event.is_readable() {
                self.accept(token - LISTENER_BASE);
            }
        } else if self.pool.get(token).map_or(false, |c| c.is_open()) {
            self.process_events(token, event);
        }
        // A token for a vacant or closed slot is a leftover from a record
        // torn down earlier in this batch; skip it.
    }

    /// Drain one listener. Runs until the accept queue is empty.
    fn accept(&mut self, listener_idx: usize) {
        loop {
            let Some(listener) = self.listeners.get(listener_idx) else {
                return;
            };
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let Some(server) = self.pool.pop() else {
                        // Keep draining with the pool exhausted: shedding
                        // the connection beats starving the listener.
                        warn!(worker = self.index, peer = %peer, "Connection pool exhausted, closing");
                        continue;
                    };

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(server),
                        Interest::READABLE,
                    ) {
                        debug!(worker = self.index, error = %e, "Failed to register accepted socket");
                        self.pool.push(server);
                        continue;
                    }

                    self.pool.get_mut(server).expect("fresh record").init(stream);
                    debug!(worker = self.index, conn = server, peer = %peer, "Accepted connection");

                    if !self.connect_upstream_servers(server) {
                        debug!(
                            worker = self.index,
                            conn = server,
                            "No upstream reachable, dropping accepted connection"
                        );
                        self.pool.remove_server(server);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(worker = self.index, error = %e, "Accept failed");
                    return;
                }
            }
        }
    }

    /// Open one outbound connection per upstream and link the client
    /// records under `server`. True iff at least one client attached.
    fn connect_upstream_servers(&mut self, server: usize) -> bool {
        let mut nclients = 0;

        for &addr in self.upstreams.iter() {
            // A non-blocking connect that is still in progress succeeds
            // here; completion is observed on the first writable wakeup.
            let mut stream = match TcpStream::connect(addr) {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(worker = self.index, upstream = %addr, error = %e, "Connect failed");
                    continue;
                }
            };

            let Some(client) = self.pool.pop() else {
                warn!(worker = self.index, upstream = %addr, "Connection pool exhausted");
                continue;
            };

            // Write interest to observe connect completion and drain the
            // pending queue; read interest only so the poll reports the
            // upstream's half-close. Inbound bytes are never read.
            if let Err(e) = self.poll.registry().register(
                &mut stream,
                Token(client),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(worker = self.index, upstream = %addr, error = %e, "Failed to register upstream socket");
                self.pool.push(client);
                continue;
            }

            self.pool.get_mut(client).expect("fresh record").init(stream);
            self.pool.add_client(server, client);
            nclients += 1;
        }

        debug!(
            worker = self.index,
            conn = server,
            clients = nclients,
            "Upstream fan-out established"
        );

        nclients > 0
    }

    /// The per-record state machine, driven by one readiness event.
    fn process_events(&mut self, idx: usize, event: &Event) {
        if event.is_error() {
            if self.pool.get(idx).map_or(false, |c| c.is_server()) {
                debug!(worker = self.index, conn = idx, "Error on accepted connection");
                self.pool.remove_server(idx);
            } else {
                debug!(worker = self.index, conn = idx, "Error on upstream connection");
                self.pool.remove_client(idx);
            }
            return;
        }

        if self.pool.get(idx).map_or(false, |c| c.is_server()) {
            // Server record: only read interest was registered.
            if event.is_readable() {
                if let Some(conn) = self.pool.get_mut(idx) {
                    conn.readable = true;
                }
                let keep = self.fan_out(idx);
                if !keep || event.is_read_closed() {
                    // remove_server is a no-op when fan_out already tore
                    // the record down through its last client.
                    self.pool.remove_server(idx);
                }
            } else if event.is_read_closed() {
                // Hang-up without readable data; under edge triggering
                // this event will not repeat, so tear down now.
                debug!(worker = self.index, conn = idx, "Accepted connection closed");
                self.pool.remove_server(idx);
            }
        } else {
            // Client record: writable completes the connect and drains
            // the pending queue; half-close from the upstream drops it.
            if event.is_writable() {
                if !self.pool.get(idx).map_or(false, |c| c.connected) {
                    match self.pool.get(idx).map(|c| c.take_socket_error()) {
                        Some(Ok(())) => {
                            if let Some(conn) = self.pool.get_mut(idx) {
                                conn.connected = true;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(worker = self.index, conn = idx, error = %e, "Upstream connect failed");
                            self.pool.remove_client(idx);
                            return;
                        }
                        None => return,
                    }
                }

                if let Some(conn) = self.pool.get_mut(idx) {
                    conn.writable = true;
                    let drained = conn.pending.is_empty() || conn.flush();
                    if !drained || event.is_read_closed() {
                        debug!(worker = self.index, conn = idx, "Dropping upstream connection");
                        self.pool.remove_client(idx);
                    }
                }
            } else if event.is_read_closed() {
                debug!(worker = self.index, conn = idx, "Upstream closed");
                self.pool.remove_client(idx);
            }
        }
    }

    /// Drain the accepted connection and replicate every chunk to each
    /// child. Returns false when the caller must remove the server
    /// record (orderly close or hard read error).
    fn fan_out(&mut self, server: usize) -> bool {
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let n = {
                let Some(conn) = self.pool.get_mut(server) else {
                    return true;
                };
                match conn.read_chunk(&mut buf) {
                    Ok(0) => return false,
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        conn.readable = false;
                        return true;
                    }
                    Err(_) => return false,
                }
            };

            // Walk the children, capturing `next` first: a failed write
            // removes the child from the chain we are walking.
            let mut child = self.pool.get(server).and_then(|c| c.first_child);
            while let Some(idx) = child {
                child = self.pool.get(idx).and_then(|c| c.next_sibling);

                let ok = self
                    .pool
                    .get_mut(idx)
                    .map_or(true, |c| c.send_or_queue(&buf[..n]));
                if !ok {
                    debug!(worker = self.index, conn = idx, "Upstream cannot keep up, dropping");
                    self.pool.remove_client(idx);

                    if self.pool.get(server).map_or(true, |c| c.first_child.is_none()) {
                        // The last client went, taking the server with
                        // it; the record must not be touched again.
                        return true;
                    }
                }
            }

            if n < READ_CHUNK {
                if let Some(conn) = self.pool.get_mut(server) {
                    conn.readable = false;
                }
                return true;
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_worker_start_stop() {
        let mut worker = Worker::new(0);
        worker.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let upstreams = Arc::new(vec!["127.0.0.1:1".parse().unwrap()]);
        worker.start(upstreams, None).unwrap();
        assert!(worker.is_running());

        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_listen_after_start_fails() {
        let mut worker = Worker::new(0);
        worker.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        worker
            .start(Arc::new(vec!["127.0.0.1:1".parse().unwrap()]), None)
            .unwrap();

        assert!(worker.listen("127.0.0.1:0".parse().unwrap()).is_err());
        worker.stop();
    }

    #[test]
    fn test_single_worker_forwards() {
        let upstream = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let mut worker = Worker::new(0);
        worker.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let bind_addr = worker.local_addrs()[0];
        worker.start(Arc::new(vec![upstream_addr]), None).unwrap();

        let mut client = std::net::TcpStream::connect(bind_addr).unwrap();
        std::io::Write::write_all(&mut client, b"ping").unwrap();

        let (mut accepted, _) = upstream.accept().unwrap();
        accepted
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut received = [0u8; 4];
        accepted.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"ping");

        worker.stop();
    }
}
