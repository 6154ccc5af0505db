use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use glam::IVec3;

use cubeworld::{
    BlockId, Channel, ChatLine, Chunk, ChunkPos, DisconnectReason, FlatTerrain, Host, HostEvent,
    PacketLossSimulation, PeerId, decode, encode,
};

/// Server side of a test: echoes every message back to its sender on the
/// same channel and forwards everything it sees.
struct EchoServer {
    addr: SocketAddr,
    events: Receiver<HostEvent>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EchoServer {
    fn start(loss: PacketLossSimulation) -> Self {
        let mut host = Host::bind("127.0.0.1:0").unwrap();
        host.set_packet_loss(loss);
        let addr = host.local_addr();
        let (tx, events) = unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&running);
        let handle = thread::spawn(move || {
            while flag.load(Ordering::Relaxed) {
                let mut batch = Vec::new();
                host.poll(Duration::from_millis(5), &mut batch).unwrap();
                for event in batch {
                    if let HostEvent::Received {
                        peer,
                        channel,
                        data,
                    } = &event
                    {
                        host.send_on(*peer, *channel, data).unwrap();
                    }
                    let _ = tx.send(event);
                }
            }
        });

        Self {
            addr,
            events,
            running,
            handle: Some(handle),
        }
    }

    fn wait_for(&self, timeout: Duration, mut pred: impl FnMut(&HostEvent) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.events.recv_timeout(left) {
                Ok(event) if pred(&event) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        false
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn collect_received(
    host: &mut Host,
    channel: Channel,
    count: usize,
    timeout: Duration,
) -> Vec<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut received = Vec::new();
    while received.len() < count && Instant::now() < deadline {
        let mut events = Vec::new();
        host.poll(Duration::from_millis(5), &mut events).unwrap();
        for event in events {
            if let HostEvent::Received {
                channel: from, data, ..
            } = event
            {
                if from == channel {
                    received.push(data);
                }
            }
        }
    }
    received
}

fn connect(server: &EchoServer) -> (Host, PeerId) {
    let mut client = Host::client().unwrap();
    let peer = client.connect(server.addr, Duration::from_secs(2)).unwrap();
    (client, peer)
}

#[test]
fn test_handshake_raises_connect_on_both_sides() {
    let server = EchoServer::start(PacketLossSimulation::default());
    let (mut client, peer) = connect(&server);

    assert!(client.is_connected(peer));
    assert_eq!(client.peer_addr(peer), Some(server.addr));
    assert!(server.wait_for(Duration::from_secs(1), |e| matches!(e, HostEvent::Connected(_))));

    let mut events = Vec::new();
    client.poll(Duration::from_millis(5), &mut events).unwrap();
    assert!(events.contains(&HostEvent::Connected(peer)));
}

#[test]
fn test_unreliable_state_round_trip() {
    let server = EchoServer::start(PacketLossSimulation::default());
    let (mut client, peer) = connect(&server);

    client.send_on(peer, Channel::State, &[1, 2, 3]).unwrap();
    let echoed = collect_received(&mut client, Channel::State, 1, Duration::from_secs(2));
    assert_eq!(echoed, vec![vec![1, 2, 3]]);
}

#[test]
fn test_chat_lines_arrive_in_order() {
    let server = EchoServer::start(PacketLossSimulation::default());
    let (mut client, peer) = connect(&server);

    for i in 0..20 {
        let mut line = ChatLine::new(7, format!("line {i}"));
        let bytes = encode(&mut line).unwrap();
        client.send_on(peer, Channel::Chat, &bytes).unwrap();
    }

    let echoed = collect_received(&mut client, Channel::Chat, 20, Duration::from_secs(3));
    let texts: Vec<String> = echoed
        .iter()
        .map(|bytes| decode::<ChatLine>(bytes).unwrap().text)
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("line {i}")).collect();
    assert_eq!(texts, expected);
}

#[test]
fn test_fragmented_chunk_survives_packet_loss() {
    let server = EchoServer::start(PacketLossSimulation::with_loss(20.0));
    let (mut client, peer) = connect(&server);
    client.set_packet_loss(PacketLossSimulation::with_loss(20.0));

    let mut chunk = FlatTerrain::default().generate(ChunkPos::from_grid(IVec3::new(0, -1, 0)));
    chunk.set(IVec3::new(3, 15, 3), BlockId::STONE);
    let payload = encode(&mut chunk).unwrap();
    assert!(payload.len() > 8 * 1024);

    client.send_on(peer, Channel::Chunk, &payload).unwrap();
    let echoed = collect_received(&mut client, Channel::Chunk, 1, Duration::from_secs(10));
    assert_eq!(echoed.len(), 1);

    let restored: Chunk = decode(&echoed[0]).unwrap();
    assert_eq!(restored.position(), chunk.position());
    assert_eq!(restored.blocks(), chunk.blocks());
}

#[test]
fn test_reliable_messages_arrive_in_order_under_loss() {
    let server = EchoServer::start(PacketLossSimulation::with_loss(30.0));
    let (mut client, peer) = connect(&server);
    client.set_packet_loss(PacketLossSimulation::with_loss(30.0));

    for i in 0u32..50 {
        client
            .send_on(peer, Channel::Events, &i.to_be_bytes())
            .unwrap();
    }

    let echoed = collect_received(&mut client, Channel::Events, 50, Duration::from_secs(15));
    let values: Vec<u32> = echoed
        .iter()
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    assert_eq!(values, (0..50).collect::<Vec<_>>());
}

#[test]
fn test_reliable_queue_drains_once_acknowledged() {
    let server = EchoServer::start(PacketLossSimulation::default());
    let (mut client, peer) = connect(&server);

    client.send_on(peer, Channel::Events, b"hello").unwrap();
    collect_received(&mut client, Channel::Events, 1, Duration::from_secs(2));

    let deadline = Instant::now() + Duration::from_secs(2);
    while client.pending_reliable(peer) > 0 && Instant::now() < deadline {
        client.poll(Duration::from_millis(5), &mut Vec::new()).unwrap();
    }
    assert_eq!(client.pending_reliable(peer), 0);
}

#[test]
fn test_disconnect_notifies_server() {
    let server = EchoServer::start(PacketLossSimulation::default());
    let (mut client, peer) = connect(&server);
    assert!(server.wait_for(Duration::from_secs(1), |e| matches!(e, HostEvent::Connected(_))));

    client.disconnect(peer);
    assert!(server.wait_for(Duration::from_secs(1), |e| matches!(
        e,
        HostEvent::Disconnected {
            reason: DisconnectReason::Graceful,
            ..
        }
    )));
}

#[test]
fn test_silent_peer_times_out() {
    let mut server = Host::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr();
    let accept = thread::spawn(move || {
        let mut events = Vec::new();
        while events.is_empty() {
            server.poll(Duration::from_millis(5), &mut events).unwrap();
        }
        // Handed back alive but never polled again, so it stays silent.
        server
    });

    let mut client = Host::client().unwrap();
    let peer = client.connect(addr, Duration::from_secs(2)).unwrap();
    let _silent = accept.join().unwrap();
    client.set_timeout(Duration::from_millis(300));

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut events = Vec::new();
    while Instant::now() < deadline {
        client.poll(Duration::from_millis(10), &mut events).unwrap();
        if events
            .iter()
            .any(|e| matches!(e, HostEvent::Disconnected { .. }))
        {
            break;
        }
    }
    assert!(events.contains(&HostEvent::Disconnected {
        peer,
        reason: DisconnectReason::Timeout,
    }));
}
