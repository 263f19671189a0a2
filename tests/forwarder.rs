//! End-to-end forwarding tests over loopback.
//!
//! Each test binds ephemeral ports, runs a real forwarder, and drives it
//! with plain blocking sockets.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tcp_fanout::addr::BindSpec;
use tcp_fanout::forwarder::Forwarder;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

fn ephemeral() -> BindSpec {
    BindSpec {
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        minport: 0,
        maxport: 0,
    }
}

/// A single-worker forwarder listening on an ephemeral port.
fn start_forwarder(upstreams: &[SocketAddr]) -> (Forwarder, SocketAddr) {
    let mut forwarder = Forwarder::new(1);
    forwarder.listen(&ephemeral()).unwrap();
    for &addr in upstreams {
        forwarder.add_upstream(addr);
    }
    let addr = forwarder.local_addrs()[0];
    forwarder.start(None).unwrap();
    (forwarder, addr)
}

fn accept_with_timeout(listener: &TcpListener) -> TcpStream {
    let (stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    stream
}

/// A port whose connections are refused: bound once to learn the number,
/// then released.
fn refused_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_forwards_to_single_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut forwarder, addr) = start_forwarder(&[upstream.local_addr().unwrap()]);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello").unwrap();

    let mut accepted = accept_with_timeout(&upstream);
    let mut received = [0u8; 5];
    accepted.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"hello");

    // Closing the client tears the fan-out down; the upstream sees an
    // orderly close.
    drop(client);
    let mut rest = Vec::new();
    accepted.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    forwarder.stop();
}

#[test]
fn test_fans_out_to_all_upstreams() {
    let upstream_a = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_b = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut forwarder, addr) = start_forwarder(&[
        upstream_a.local_addr().unwrap(),
        upstream_b.local_addr().unwrap(),
    ]);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"abc").unwrap();

    let mut accepted_a = accept_with_timeout(&upstream_a);
    let mut accepted_b = accept_with_timeout(&upstream_b);

    let mut received = [0u8; 3];
    accepted_a.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"abc");
    accepted_b.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"abc");

    // Kill upstream A mid-stream; the client keeps forwarding to B.
    drop(accepted_a);
    drop(upstream_a);
    thread::sleep(Duration::from_millis(500));

    client.write_all(b"def").unwrap();
    accepted_b.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"def");

    forwarder.stop();
}

#[test]
fn test_all_upstreams_refused_drops_client() {
    let (mut forwarder, addr) = start_forwarder(&[refused_port()]);

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(READ_TIMEOUT)).unwrap();

    // With every upstream refusing, the accepted connection is torn down
    // rather than kept as a one-sided proxy.
    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected data from forwarder: {n} bytes"),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("unexpected error: {e}"),
    }

    forwarder.stop();
}

#[test]
fn test_bind_port_range() {
    let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    // The range needs three contiguous free ports; hunt for them.
    let mut base = 42000 + (std::process::id() % 4096) as u16 * 3;
    let mut forwarder = loop {
        let mut forwarder = Forwarder::new(1);
        forwarder.add_upstream(upstream_addr);
        let spec = BindSpec {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            minport: base,
            maxport: base + 2,
        };
        match forwarder.listen(&spec) {
            Ok(()) => break forwarder,
            Err(_) => {
                base += 3;
                assert!(base < 60000, "no free port range found");
            }
        }
    };

    assert_eq!(forwarder.local_addrs().len(), 3);
    forwarder.start(None).unwrap();

    // A connection to any port of the range forwards correctly.
    for port in base..=base + 2 {
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"range").unwrap();

        let mut accepted = accept_with_timeout(&upstream);
        let mut received = [0u8; 5];
        accepted.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"range");
    }

    forwarder.stop();
}

#[test]
fn test_slow_upstream_is_dropped_sibling_survives() {
    const TOTAL: usize = 4 * 1024 * 1024;

    // Upstream A never reads, and its accepted sockets inherit a small
    // receive buffer so the kernel cannot absorb the stream either.
    let slow = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .unwrap();
    slow.set_recv_buffer_size(4096).unwrap();
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    slow.bind(&bind_addr.into()).unwrap();
    slow.listen(16).unwrap();
    let upstream_a: TcpListener = slow.into();

    let upstream_b = TcpListener::bind("127.0.0.1:0").unwrap();

    let (mut forwarder, addr) = start_forwarder(&[
        upstream_a.local_addr().unwrap(),
        upstream_b.local_addr().unwrap(),
    ]);

    // B drains the full stream and verifies the byte pattern. It stops
    // at TOTAL rather than at EOF: closing the accepted client discards
    // whatever is still queued for the surviving upstreams, so the
    // client stays open until B has confirmed receipt.
    let reader = thread::spawn(move || {
        let mut accepted = accept_with_timeout(&upstream_b);
        let mut received = vec![0u8; TOTAL];
        accepted.read_exact(&mut received).unwrap();
        assert_eq!(received, pattern(TOTAL));
    });

    let mut client = TcpStream::connect(addr).unwrap();
    let accepted_a = accept_with_timeout(&upstream_a);

    let data = pattern(TOTAL);
    for chunk in data.chunks(64 * 1024) {
        client.write_all(chunk).unwrap();
    }

    reader.join().unwrap();

    // B received the whole stream while the client stayed open, so the
    // server record survived losing A. A itself was dropped once its
    // pending queue overflowed: draining it hits end-of-stream (or a
    // reset) long before the 4 MiB could have arrived. A timeout here
    // would mean A's connection was never closed.
    let mut drained = 0usize;
    let mut accepted_a = accepted_a;
    let mut buf = [0u8; 64 * 1024];
    loop {
        match accepted_a.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => drained += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(e) => panic!("upstream A read failed: {e}"),
        }
    }
    assert!(drained < TOTAL, "slow upstream received the whole stream");

    drop(client);
    forwarder.stop();
}

#[test]
fn test_idle_hook_fires_on_timeout() {
    let mut forwarder = Forwarder::new(1);
    forwarder.listen(&ephemeral()).unwrap();
    forwarder.add_upstream(refused_port());

    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    forwarder
        .start(Some(Arc::new(move |_worker| {
            counter.fetch_add(1, Ordering::Relaxed);
        })))
        .unwrap();

    // The poll timeout is 250 ms; an idle forwarder must tick within a
    // few rounds.
    thread::sleep(Duration::from_millis(900));
    assert!(ticks.load(Ordering::Relaxed) >= 1);

    forwarder.stop();
}
