//! Forwarder façade: fans configuration out to the workers.
//!
//! Every bound endpoint is opened once per worker with `SO_REUSEPORT`;
//! the kernel distributes accepted connections across the workers. A
//! connection accepted by a worker lives and dies on that worker.

use crate::addr::BindSpec;
use crate::runtime::worker::{IdleHook, Worker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Most worker threads a forwarder will run.
pub const MAX_WORKERS: usize = 32;

/// Worker count used when none is configured.
pub const DEFAULT_WORKERS: usize = 2;

/// A multi-worker TCP fan-out proxy.
pub struct Forwarder {
    upstreams: Vec<SocketAddr>,
    workers: Vec<Worker>,
    started: bool,
}

impl Forwarder {
    /// Create a forwarder with `nworkers` workers, clamped to
    /// [1, `MAX_WORKERS`].
    pub fn new(nworkers: usize) -> Self {
        let nworkers = nworkers.clamp(1, MAX_WORKERS);
        Self {
            upstreams: Vec::new(),
            workers: (0..nworkers).map(Worker::new).collect(),
            started: false,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Add one upstream server; every accepted connection is replicated
    /// to all of them.
    pub fn add_upstream(&mut self, addr: SocketAddr) {
        self.upstreams.push(addr);
    }

    pub fn upstreams(&self) -> &[SocketAddr] {
        &self.upstreams
    }

    /// Bind one endpoint (or a whole port range) on every worker.
    pub fn listen(&mut self, spec: &BindSpec) -> io::Result<()> {
        for worker in &mut self.workers {
            worker.listen_range(spec.ip, spec.minport, spec.maxport)?;
        }
        Ok(())
    }

    /// Bound addresses of the first worker's listeners (pre-start only).
    ///
    /// With explicit ports every worker binds the same set; with port 0
    /// each worker gets its own ephemeral ports and only the first
    /// worker's are reported.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.workers
            .first()
            .map(|w| w.local_addrs())
            .unwrap_or_default()
    }

    /// Start every worker. Refuses to start without upstream servers.
    pub fn start(&mut self, idle: Option<IdleHook>) -> io::Result<()> {
        if self.upstreams.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no upstream servers configured",
            ));
        }

        let upstreams = Arc::new(self.upstreams.clone());
        for worker in &mut self.workers {
            worker.start(Arc::clone(&upstreams), idle.clone())?;
        }
        self.started = true;

        info!(
            workers = self.workers.len(),
            upstreams = upstreams.len(),
            "Forwarder started"
        );
        Ok(())
    }

    /// Stop every worker and join their threads.
    pub fn stop(&mut self) {
        if self.started {
            for worker in &mut self.workers {
                worker.stop();
            }
            self.started = false;
            info!("Forwarder stopped");
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop();
    }
}
