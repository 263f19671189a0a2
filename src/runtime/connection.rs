//! Connection record: per-socket state for one side of a fan-out.
//!
//! A record is either server-side (an accepted client of the proxy) or
//! client-side (an outbound connection to one upstream). The role is
//! encoded by `server`: `None` means the record *is* a server; `Some(i)`
//! points at the server record this client belongs to. Sibling and child
//! links are arena indices owned by the pool.

use crate::runtime::buffer::ByteBuffer;
use crate::runtime::MAX_PENDING;
use mio::net::TcpStream;
use std::io::{self, Read, Write};

/// One connection record in the worker's arena.
///
/// Readiness flags cache edge-triggered wakeups: `readable`/`writable`
/// stay set until a short or would-block I/O result clears them.
#[derive(Debug, Default)]
pub struct Connection {
    /// The socket; `None` once the record is closed.
    stream: Option<TcpStream>,
    pub readable: bool,
    pub writable: bool,
    /// Whether an outbound connect has completed. Meaningful only for
    /// client records; accept implies connected on the server side.
    pub connected: bool,
    /// Bytes accepted for this record but not yet written to the socket.
    pub pending: ByteBuffer,
    /// `None` for a server record, the owning server's index otherwise.
    pub server: Option<usize>,
    pub first_child: Option<usize>,
    pub last_child: Option<usize>,
    pub prev_sibling: Option<usize>,
    pub next_sibling: Option<usize>,
}

impl Connection {
    /// Reset all state and adopt `stream`.
    pub fn init(&mut self, stream: TcpStream) {
        self.stream = Some(stream);
        self.readable = false;
        self.writable = false;
        self.connected = false;
        self.pending.clear();
        self.server = None;
        self.first_child = None;
        self.last_child = None;
        self.prev_sibling = None;
        self.next_sibling = None;
    }

    /// Close the socket. Dropping the stream closes the fd, which also
    /// drops its registration from the worker's poll instance.
    pub fn close(&mut self) {
        self.stream = None;
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_server(&self) -> bool {
        self.server.is_none()
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Read once into `buf`. `Interrupted` is retried here; everything
    /// else is the caller's to interpret.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        loop {
            match stream.read(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    /// Consume the pending socket-level error, if any. Used to complete
    /// a non-blocking connect on the first writable wakeup.
    pub fn take_socket_error(&self) -> io::Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        match stream.take_error()? {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Send `data`, queueing whatever could not be written.
    ///
    /// Returns false when the record must be dropped: a hard send error,
    /// or a remainder that would push the pending buffer past
    /// `MAX_PENDING`.
    pub fn send_or_queue(&mut self, data: &[u8]) -> bool {
        let mut data = data;

        if self.writable {
            let Some(stream) = self.stream.as_ref() else {
                return false;
            };
            match send(stream, data) {
                Ok(n) => {
                    if n < data.len() {
                        self.writable = false;
                    }
                    if n == data.len() {
                        return true;
                    }
                    data = &data[n..];
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                }
                Err(_) => return false,
            }
        }

        if self.pending.len() + data.len() <= MAX_PENDING {
            self.pending.append(data).is_ok()
        } else {
            false
        }
    }

    /// Drain the pending buffer from the front.
    ///
    /// Returns false only on a hard send error; would-block simply waits
    /// for the next writable wakeup.
    pub fn flush(&mut self) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        match send(stream, self.pending.as_slice()) {
            Ok(n) => {
                if n < self.pending.len() {
                    self.writable = false;
                }
                let _ = self.pending.erase(0, n);
                true
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.writable = false;
                true
            }
            Err(_) => false,
        }
    }
}

/// Non-blocking send with `Interrupted` retried in place.
///
/// std's socket write already passes `MSG_NOSIGNAL` on Linux, so a dead
/// peer surfaces as `EPIPE` instead of `SIGPIPE`.
fn send(stream: &TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut stream = stream;
    loop {
        match stream.write(data) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            result => return result,
        }
    }
}
