//! Bound, non-blocking listening sockets.

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};

/// The listening sockets owned by one worker.
///
/// Every worker binds the same endpoints with `SO_REUSEPORT`, letting the
/// kernel spread accepted connections across workers.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Vec<TcpListener>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `addr` and start listening.
    ///
    /// The socket is created in the address's family, non-blocking, with
    /// both address and port reuse, and listens with the system's maximum
    /// backlog. On any failure the socket is closed and the error
    /// returned; nothing is added to the set.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<()> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(libc::SOMAXCONN)?;

        self.listeners.push(TcpListener::from_std(socket.into()));
        Ok(())
    }

    /// Bind one listener per port in `[minport, maxport]`.
    ///
    /// Short-circuits on the first failure; listeners added for earlier
    /// ports remain in the set.
    pub fn listen_range(&mut self, ip: IpAddr, minport: u16, maxport: u16) -> io::Result<()> {
        for port in minport..=maxport {
            self.listen(SocketAddr::new(ip, port))?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&TcpListener> {
        self.listeners.get(idx)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TcpListener> {
        self.listeners.iter_mut()
    }

    /// Bound addresses, in bind order. Useful when binding port 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_ephemeral() {
        let mut set = ListenerSet::new();
        set.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(set.len(), 1);

        let addrs = set.local_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);

        // The socket really listens.
        std::net::TcpStream::connect(addrs[0]).unwrap();
    }

    #[test]
    fn test_reuse_port_allows_double_bind() {
        let mut a = ListenerSet::new();
        a.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = a.local_addrs()[0];

        // A second set may bind the same endpoint thanks to SO_REUSEPORT.
        let mut b = ListenerSet::new();
        b.listen(addr).unwrap();
    }

    #[test]
    fn test_failed_listen_adds_nothing() {
        let mut set = ListenerSet::new();
        // Binding a non-local address fails.
        let err = set.listen("192.0.2.1:1".parse().unwrap());
        assert!(err.is_err());
        assert!(set.is_empty());
    }
}
