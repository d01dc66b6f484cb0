//! Integration tests for the reliable stream sockets.
//!
//! Most tests connect two `NetStack`s over loopback.  The reassembly tests
//! drive a listener from a bare tokio `UdpSocket` that hand-crafts segments,
//! so the exact sequence numbers on the wire are under test control.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use p2p_over_udp::packet::{flags, MuxHeader, Segment};
use p2p_over_udp::{
    CallerId, Failure, NetConfig, NetError, NetStack, PollEvents, PollFd, RecvFlags, SockOpt, SockOptName,
    SocketId, VirtualAddr, AF_INET, SOCK_DGRAM_P2P, SOCK_STREAM_P2P,
};

const GUARD: Duration = Duration::from_secs(5);

/// Vport the raw peer pretends to use.
const RAW_VPORT: u16 = 900;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn stream(stack: &NetStack) -> SocketId {
    stack.socket(AF_INET, SOCK_STREAM_P2P, 0).expect("open stream socket")
}

/// Bind a listener on `vport` of the stack's default real port.
fn listener(stack: &NetStack, vport: u16, backlog: usize) -> (SocketId, VirtualAddr) {
    let id = stream(stack);
    stack
        .bind(id, VirtualAddr::new("127.0.0.1:0".parse().unwrap(), vport))
        .expect("bind listener");
    stack.listen(id, backlog).expect("listen");
    (id, stack.getsockname(id).unwrap())
}

/// Connect a fresh client socket on `client` to `addr` while `server`
/// accepts on `listener`.  Returns `(accepted, client)`.
async fn connected_pair(
    server: &NetStack,
    listener: SocketId,
    client: &NetStack,
    addr: VirtualAddr,
) -> (SocketId, SocketId) {
    let id = stream(client);
    let connect = client.connect(CallerId::next(), id, addr);
    let accept = server.accept(CallerId::next(), listener);
    let (connected, accepted) = tokio::time::timeout(GUARD, async { tokio::join!(connect, accept) })
        .await
        .expect("handshake timed out");
    connected.expect("connect");
    let (child, _) = accepted.expect("accept");
    (child, id)
}

/// Read exactly `len` bytes from `id`.
async fn read_exact(stack: &NetStack, id: SocketId, len: usize) -> Vec<u8> {
    let me = CallerId::next();
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 4096];
    while out.len() < len {
        let n = tokio::time::timeout(GUARD, stack.recv(me, id, &mut buf, RecvFlags::empty()))
            .await
            .expect("recv timed out")
            .expect("recv failed");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

async fn send_raw(raw: &UdpSocket, to: SocketAddr, dst_vport: u16, seg: Segment) {
    raw.send_to(&seg.encapsulate(dst_vport, RAW_VPORT), to).await.unwrap();
}

/// Next stream segment arriving at `raw`.
async fn recv_raw(raw: &UdpSocket) -> Segment {
    let mut buf = vec![0u8; 2048];
    let (n, _) = tokio::time::timeout(GUARD, raw.recv_from(&mut buf))
        .await
        .expect("raw peer heard nothing")
        .unwrap();
    let (mux, body) = MuxHeader::decode(&buf[..n]).unwrap();
    assert!(mux.is_stream());
    assert_eq!(mux.dst_vport, RAW_VPORT);
    Segment::decode(body).unwrap()
}

/// Next pure acknowledgement, skipping handshake retransmissions.
async fn recv_ack(raw: &UdpSocket) -> u64 {
    loop {
        let seg = recv_raw(raw).await;
        if !seg.has(flags::SYN) {
            assert!(seg.has(flags::ACK));
            return seg.header.ack;
        }
    }
}

/// Complete a handshake with the listener at `addr` from `raw`.
/// Returns the listener side's initial sequence number.
async fn raw_handshake(raw: &UdpSocket, addr: VirtualAddr, isn: u64) -> u64 {
    send_raw(raw, addr.addr, addr.vport, Segment::new(isn, 0, RAW_VPORT, addr.vport, flags::SYN, vec![])).await;
    let syn_ack = recv_raw(raw).await;
    assert!(syn_ack.has(flags::SYN) && syn_ack.has(flags::ACK));
    assert_eq!(syn_ack.header.ack, isn + 1);
    assert_eq!(syn_ack.header.src_port, addr.vport);
    assert_eq!(syn_ack.header.dst_port, RAW_VPORT);
    let theirs = syn_ack.header.seq;
    send_raw(raw, addr.addr, addr.vport, Segment::new(isn + 1, theirs + 1, RAW_VPORT, addr.vport, flags::ACK, vec![]))
        .await;
    theirs
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_links_both_ends() {
    let server = NetStack::start(NetConfig::loopback());
    let client = NetStack::start(NetConfig::loopback());
    let (l, addr) = listener(&server, 7, 4);

    let (child, id) = connected_pair(&server, l, &client, addr).await;

    assert_eq!(server.getpeername(child).unwrap(), client.getsockname(id).unwrap());
    assert_eq!(client.getpeername(id).unwrap(), addr);
    assert_eq!(server.getsockname(child).unwrap().vport, 7);
    assert!(matches!(server.getpeername(l), Err(NetError::NotConnected)));
}

#[tokio::test]
async fn connect_without_listener_is_refused() {
    let server = NetStack::start(NetConfig::loopback());
    let client = NetStack::start(NetConfig::loopback());
    // Bind something on the server so the real port exists.
    let (_, addr) = listener(&server, 7, 4);

    let id = stream(&client);
    let target = VirtualAddr::new(addr.addr, 8);
    let result = tokio::time::timeout(GUARD, client.connect(CallerId::next(), id, target))
        .await
        .unwrap();
    assert!(matches!(result, Err(NetError::ConnectionRefused)));
    // A failed connect consumes its error.
    assert!(matches!(
        client.getsockopt(id, SockOptName::Error).unwrap(),
        SockOpt::Error(None)
    ));
}

#[tokio::test]
async fn full_backlog_refuses_until_accepted() {
    let server = NetStack::start(NetConfig::loopback());
    let client = NetStack::start(NetConfig::loopback());
    let (l, addr) = listener(&server, 7, 1);
    let me = CallerId::next();

    let first = stream(&client);
    tokio::time::timeout(GUARD, client.connect(me, first, addr))
        .await
        .unwrap()
        .expect("first connection fits the backlog");

    let second = stream(&client);
    let refused = tokio::time::timeout(GUARD, client.connect(me, second, addr)).await.unwrap();
    assert!(matches!(refused, Err(NetError::ConnectionRefused)));

    let (_, peer) = tokio::time::timeout(GUARD, server.accept(me, l)).await.unwrap().unwrap();
    assert_eq!(peer, client.getsockname(first).unwrap());

    let third = stream(&client);
    tokio::time::timeout(GUARD, client.connect(me, third, addr))
        .await
        .unwrap()
        .expect("room again after accept");
}

#[tokio::test]
async fn non_blocking_connect_completes_via_poll() {
    let server = NetStack::start(NetConfig::loopback());
    let client = NetStack::start(NetConfig::loopback());
    let (_, addr) = listener(&server, 7, 4);
    let me = CallerId::next();

    let id = stream(&client);
    client.setsockopt(id, SockOpt::NonBlocking(true)).unwrap();
    assert!(matches!(client.connect(me, id, addr).await, Err(NetError::InProgress)));

    let mut fds = [PollFd::new(id, PollEvents::WRITE)];
    let n = client.poll(me, &mut fds, Some(GUARD)).await.unwrap();
    assert_eq!(n, 1);
    assert!(fds[0].revents.contains(PollEvents::WRITE));
    assert!(matches!(client.connect(me, id, addr).await, Err(NetError::AlreadyConnected)));
}

#[tokio::test]
async fn listener_polls_readable_with_pending_connection() {
    let server = NetStack::start(NetConfig::loopback());
    let client = NetStack::start(NetConfig::loopback());
    let (l, addr) = listener(&server, 7, 4);
    let me = CallerId::next();

    let id = stream(&client);
    tokio::time::timeout(GUARD, client.connect(me, id, addr)).await.unwrap().unwrap();

    let mut fds = [PollFd::new(l, PollEvents::READ)];
    assert_eq!(server.poll(me, &mut fds, Some(GUARD)).await.unwrap(), 1);
    assert!(fds[0].revents.contains(PollEvents::READ));
}

// ---------------------------------------------------------------------------
// Data transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bytes_flow_both_ways_in_order() {
    let server = NetStack::start(NetConfig::loopback());
    let client = NetStack::start(NetConfig::loopback());
    let (l, addr) = listener(&server, 7, 4);
    let (child, id) = connected_pair(&server, l, &client, addr).await;

    let request: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(client.send(id, &request).unwrap(), request.len());
    assert_eq!(read_exact(&server, child, request.len()).await, request);

    server.send(child, b"pong").unwrap();
    assert_eq!(read_exact(&client, id, 4).await, b"pong");

    // Everything was acknowledged eventually.
    tokio::time::timeout(GUARD, async {
        while client.unacked(id) > 0 || server.unacked(child) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("segments left unacknowledged");
}

#[tokio::test]
async fn out_of_order_segments_are_reassembled() {
    let stack = NetStack::start(NetConfig::loopback());
    let (l, addr) = listener(&stack, 7, 4);
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let me = CallerId::next();

    let isn = 1000;
    let theirs = raw_handshake(&raw, addr, isn).await;
    let (child, peer) = tokio::time::timeout(GUARD, stack.accept(me, l)).await.unwrap().unwrap();
    assert_eq!(peer, VirtualAddr::new(raw.local_addr().unwrap(), RAW_VPORT));

    let data = |seq: u64, fill: u8| {
        Segment::new(seq, theirs + 1, RAW_VPORT, addr.vport, flags::ACK | flags::PSH, vec![fill; 10])
    };
    send_raw(&raw, addr.addr, addr.vport, data(isn + 1, b'a')).await;
    send_raw(&raw, addr.addr, addr.vport, data(isn + 21, b'c')).await;
    send_raw(&raw, addr.addr, addr.vport, data(isn + 11, b'b')).await;

    // Every data segment is acknowledged; the gap holds the cumulative ack.
    let acks = [recv_ack(&raw).await, recv_ack(&raw).await, recv_ack(&raw).await];
    assert_eq!(acks, [isn + 11, isn + 11, isn + 31]);

    let mut expected = vec![b'a'; 10];
    expected.extend([b'b'; 10]);
    expected.extend([b'c'; 10]);
    assert_eq!(read_exact(&stack, child, 30).await, expected);

    // A replayed segment is acknowledged but never delivered twice.
    send_raw(&raw, addr.addr, addr.vport, data(isn + 1, b'a')).await;
    assert_eq!(recv_ack(&raw).await, isn + 31);
    let mut buf = [0u8; 16];
    assert!(matches!(
        stack.recv(me, child, &mut buf, RecvFlags::DONT_WAIT).await,
        Err(NetError::WouldBlock)
    ));
}

#[tokio::test]
async fn outbound_segments_carry_virtual_ports() {
    let stack = NetStack::start(NetConfig::loopback());
    let (l, addr) = listener(&stack, 7, 4);
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let me = CallerId::next();

    let isn = 50;
    let theirs = raw_handshake(&raw, addr, isn).await;
    let (child, _) = tokio::time::timeout(GUARD, stack.accept(me, l)).await.unwrap().unwrap();

    stack.send(child, b"hello").unwrap();
    let seg = recv_raw(&raw).await;
    assert_eq!(seg.payload, b"hello");
    assert_eq!(seg.header.seq, theirs + 1);
    assert_eq!(seg.header.ack, isn + 1);
    assert_eq!((seg.header.src_port, seg.header.dst_port), (7, RAW_VPORT));
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn peer_close_resets_connection() {
    let server = NetStack::start(NetConfig::loopback());
    let client = NetStack::start(NetConfig::loopback());
    let (l, addr) = listener(&server, 7, 4);
    let (child, id) = connected_pair(&server, l, &client, addr).await;
    let me = CallerId::next();
    let mut buf = [0u8; 16];

    let blocked = client.recv(me, id, &mut buf, RecvFlags::empty());
    let close = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close(child).await
    };
    let (result, closed) = tokio::time::timeout(GUARD, async { tokio::join!(blocked, close) })
        .await
        .expect("reset never reached the client");
    closed.unwrap();
    assert!(matches!(result, Err(NetError::ConnectionReset)));

    // The error is sticky for I/O and consumed by SO_ERROR.
    assert!(matches!(client.send(id, b"x"), Err(NetError::ConnectionReset)));
    assert!(matches!(
        client.getsockopt(id, SockOptName::Error).unwrap(),
        SockOpt::Error(Some(Failure::Reset))
    ));
    assert!(matches!(
        client.getsockopt(id, SockOptName::Error).unwrap(),
        SockOpt::Error(None)
    ));
}

#[tokio::test]
async fn closing_listener_discards_unaccepted_children() {
    let server = NetStack::start(NetConfig::loopback());
    let client = NetStack::start(NetConfig::loopback());
    let (l, addr) = listener(&server, 7, 4);
    let me = CallerId::next();

    let id = stream(&client);
    tokio::time::timeout(GUARD, client.connect(me, id, addr)).await.unwrap().unwrap();
    // Listener plus one unaccepted child.
    assert_eq!(server.socket_count(), 2);

    server.close(l).await.unwrap();
    assert_eq!(server.socket_count(), 0);
    assert!(matches!(server.getsockname(l), Err(NetError::BadDescriptor)));

    // The child's reset reaches the client.
    let mut buf = [0u8; 4];
    let result = tokio::time::timeout(GUARD, client.recv(me, id, &mut buf, RecvFlags::empty()))
        .await
        .unwrap();
    assert!(matches!(result, Err(NetError::ConnectionReset)));

    // The vport is free for a new listener.
    listener(&server, 7, 4);
}

/// Next reset arriving at `raw`.
async fn recv_reset(raw: &UdpSocket) -> Segment {
    loop {
        let seg = recv_raw(raw).await;
        if seg.has(flags::RST) {
            return seg;
        }
    }
}

#[tokio::test]
async fn accept_skips_child_reset_before_claim() {
    let server = NetStack::start(NetConfig::loopback());
    let client = NetStack::start(NetConfig::loopback());
    let (l, addr) = listener(&server, 7, 4);
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let theirs = raw_handshake(&raw, addr, 100).await;
    send_raw(&raw, addr.addr, addr.vport, Segment::new(101, theirs + 1, RAW_VPORT, addr.vport, flags::RST, vec![])).await;
    // Once the connection is gone, further traffic is answered with a reset.
    send_raw(&raw, addr.addr, addr.vport, Segment::new(101, theirs + 1, RAW_VPORT, addr.vport, flags::ACK, vec![1])).await;
    recv_reset(&raw).await;
    assert_eq!(server.socket_count(), 2);

    let (child, id) = connected_pair(&server, l, &client, addr).await;
    assert_eq!(server.getpeername(child).unwrap(), client.getsockname(id).unwrap());
    // Listener and the live child; the reset one was released.
    assert_eq!(server.socket_count(), 2);

    server.setsockopt(l, SockOpt::NonBlocking(true)).unwrap();
    assert!(matches!(server.accept(CallerId::next(), l).await, Err(NetError::WouldBlock)));
}

/// A SYN whose sequence number leaves no room is dropped without taking
/// down the stack.
#[tokio::test]
async fn syn_at_sequence_limit_leaves_stack_serving() {
    let stack = NetStack::start(NetConfig::loopback());
    let (l, addr) = listener(&stack, 7, 4);
    let receiver = stack.socket(AF_INET, SOCK_DGRAM_P2P, 0).unwrap();
    stack
        .bind(receiver, VirtualAddr::new("127.0.0.1:0".parse().unwrap(), 8))
        .unwrap();
    let dgram_addr = stack.getsockname(receiver).unwrap();
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let syn = |dst| Segment::new(u64::MAX, 0, RAW_VPORT, dst, flags::SYN, vec![]);
    send_raw(&raw, addr.addr, addr.vport, syn(addr.vport)).await;
    send_raw(&raw, addr.addr, 555, syn(555)).await;
    let rst = recv_reset(&raw).await;
    assert_eq!(rst.header.ack, 0);
    assert_eq!(rst.header.src_port, 555);

    stack.setsockopt(l, SockOpt::NonBlocking(true)).unwrap();
    assert!(matches!(stack.accept(CallerId::next(), l).await, Err(NetError::WouldBlock)));

    let sender = stack.socket(AF_INET, SOCK_DGRAM_P2P, 0).unwrap();
    stack.send_to(sender, b"still here", Some(dgram_addr)).unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = tokio::time::timeout(GUARD, stack.recv_from(CallerId::next(), receiver, &mut buf, RecvFlags::empty()))
        .await
        .expect("dispatcher stopped delivering")
        .unwrap();
    assert_eq!(&buf[..n], b"still here");

    // Ordinary handshakes still go through.
    stack.setsockopt(l, SockOpt::NonBlocking(false)).unwrap();
    raw_handshake(&raw, addr, 40).await;
    let (_, peer) = tokio::time::timeout(GUARD, stack.accept(CallerId::next(), l))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(peer.vport, RAW_VPORT);
}

#[tokio::test]
async fn cancel_caller_interrupts_accept() {
    let stack = NetStack::start(NetConfig::loopback());
    let (l, _) = listener(&stack, 7, 4);
    let me = CallerId::next();

    let blocked = stack.accept(me, l);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stack.cancel_caller(me)
    };
    let (result, removed) = tokio::time::timeout(GUARD, async { tokio::join!(blocked, cancel) })
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(matches!(result, Err(NetError::Interrupted)));
}

#[tokio::test]
async fn stream_operations_rejected_on_wrong_state() {
    let stack = NetStack::start(NetConfig::loopback());
    let id = stream(&stack);
    let me = CallerId::next();
    let mut buf = [0u8; 4];

    assert!(matches!(stack.send(id, b"x"), Err(NetError::NotConnected)));
    assert!(matches!(
        stack.recv(me, id, &mut buf, RecvFlags::DONT_WAIT).await,
        Err(NetError::NotConnected)
    ));

    let (l, _) = listener(&stack, 7, 4);
    assert!(matches!(
        stack.connect(me, l, VirtualAddr::new("127.0.0.1:9".parse().unwrap(), 1)).await,
        Err(NetError::InvalidArgument)
    ));

    let taken = stream(&stack);
    assert!(matches!(
        stack.bind(taken, VirtualAddr::new("127.0.0.1:0".parse().unwrap(), 7)),
        Err(NetError::AddrInUse)
    ));
}
