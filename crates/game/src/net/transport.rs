use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use super::codec::{decode, encode};
use super::connection::{ConnectionState, HeaderOutcome, PeerId, PeerManager};
use super::error::{ConnectionError, DisconnectReason, TransportError};
use super::protocol::{
    Channel, Fragment, MAX_FRAGMENT_SIZE, MAX_PACKET_SIZE, Packet, PacketType, Reliability,
};
use super::reliable::Accepted;
use super::stats::{NetworkStats, PacketLossSimulation, rand_u64};

const RECV_BUFFER_SIZE: usize = 2048;
const HANDSHAKE_RESEND: Duration = Duration::from_millis(100);
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(250);
const IMMEDIATE_ACK_THRESHOLD: usize = 16;
const DISCONNECT_NOTICES: usize = 3;
pub const DEFAULT_MAX_PEERS: usize = 64;

/// Receives everything a [`Host`] surfaces during [`Host::poll`].
pub trait TransportHandler {
    fn on_connect(&mut self, peer: PeerId);
    fn on_receive(&mut self, peer: PeerId, channel: Channel, data: Vec<u8>);
    fn on_disconnect(&mut self, peer: PeerId, reason: DisconnectReason);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Connected(PeerId),
    Received {
        peer: PeerId,
        channel: Channel,
        data: Vec<u8>,
    },
    Disconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
}

impl TransportHandler for Vec<HostEvent> {
    fn on_connect(&mut self, peer: PeerId) {
        self.push(HostEvent::Connected(peer));
    }

    fn on_receive(&mut self, peer: PeerId, channel: Channel, data: Vec<u8>) {
        self.push(HostEvent::Received {
            peer,
            channel,
            data,
        });
    }

    fn on_disconnect(&mut self, peer: PeerId, reason: DisconnectReason) {
        self.push(HostEvent::Disconnected { peer, reason });
    }
}

#[derive(Debug)]
struct Handshake {
    addr: SocketAddr,
    client_salt: u64,
    server_salt: Option<u64>,
    result: Option<Result<PeerId, ConnectionError>>,
}

/// Socket plus the bookkeeping every outgoing datagram goes through.
struct Link {
    socket: UdpSocket,
    stats: NetworkStats,
    loss: PacketLossSimulation,
}

impl Link {
    fn send(&mut self, packet: &mut Packet, addr: SocketAddr) -> io::Result<()> {
        let data = encode(packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("packet of {} bytes exceeds MTU", data.len()),
            ));
        }

        if self.loss.should_drop() {
            self.stats.packets_dropped_sim += 1;
            return Ok(());
        }

        let bytes = self.socket.send_to(&data, addr)?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        Ok(())
    }
}

/// One UDP socket carrying any number of peer sessions.
///
/// A host created with [`Host::bind`] accepts incoming handshakes; one made
/// with [`Host::client`] only talks to peers it reached through
/// [`Host::connect`]. All socket work happens inside `connect`, `send` and
/// `poll`, so a host is owned by exactly one thread.
pub struct Host {
    link: Link,
    local_addr: SocketAddr,
    peers: PeerManager,
    accepting: bool,
    handshake: Option<Handshake>,
    events: VecDeque<HostEvent>,
    recv_buffer: Vec<u8>,
    started: Instant,
}

impl Host {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::open(addr, true)
    }

    pub fn client() -> io::Result<Self> {
        Self::open("0.0.0.0:0", false)
    }

    fn open<A: ToSocketAddrs>(addr: A, accepting: bool) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            link: Link {
                socket,
                stats: NetworkStats::default(),
                loss: PacketLossSimulation::default(),
            },
            local_addr,
            peers: PeerManager::new(DEFAULT_MAX_PEERS),
            accepting,
            handshake: None,
            events: VecDeque::new(),
            recv_buffer: vec![0; RECV_BUFFER_SIZE],
            started: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.link.stats
    }

    pub fn set_packet_loss(&mut self, loss: PacketLossSimulation) {
        self.link.loss = loss;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.peers.set_timeout(timeout);
    }

    pub fn set_max_peers(&mut self, max_peers: usize) {
        self.peers.set_max_peers(max_peers);
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.get(peer).is_some_and(|p| p.is_connected())
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.get(peer).map(|p| p.addr)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.connected_ids()
    }

    /// Reliable data still queued or awaiting acknowledgement for `peer`.
    pub fn pending_reliable(&self, peer: PeerId) -> usize {
        self.peers.get(peer).map_or(0, |p| p.pending_reliable())
    }

    /// Runs the salted handshake against `addr`, blocking for at most `timeout`.
    /// The current step is resent every 100 ms until the remote answers.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<PeerId, ConnectionError> {
        if let Some(id) = self.peers.id_by_addr(&addr) {
            if self.is_connected(id) {
                return Ok(id);
            }
        }

        self.handshake = Some(Handshake {
            addr,
            client_salt: rand_u64(),
            server_salt: None,
            result: None,
        });
        log::debug!("connecting to {addr}");

        let deadline = Instant::now() + timeout;
        let mut last_step: Option<Instant> = None;
        loop {
            if let Some(result) = self.handshake.as_mut().and_then(|h| h.result.take()) {
                self.handshake = None;
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                self.handshake = None;
                return Err(ConnectionError::TimedOut {
                    addr,
                    waited: timeout,
                });
            }

            if last_step.is_none_or(|at| now.duration_since(at) >= HANDSHAKE_RESEND) {
                self.send_handshake_step()?;
                last_step = Some(now);
            }

            self.receive(HANDSHAKE_RESEND.min(deadline - now))?;
        }
    }

    fn send_handshake_step(&mut self) -> io::Result<()> {
        let Some(handshake) = &self.handshake else {
            return Ok(());
        };
        let payload = match handshake.server_salt {
            None => PacketType::ConnectionRequest {
                client_salt: handshake.client_salt,
            },
            Some(server_salt) => PacketType::ChallengeResponse {
                combined_salt: handshake.client_salt ^ server_salt,
            },
        };
        let addr = handshake.addr;
        self.link.send(&mut Packet::control(payload), addr)
    }

    pub fn send_on(
        &mut self,
        peer: PeerId,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.send(peer, channel, data, channel.reliability())
    }

    pub fn send(
        &mut self,
        peer: PeerId,
        channel: Channel,
        data: &[u8],
        reliability: Reliability,
    ) -> Result<(), TransportError> {
        let now = Instant::now();
        let target = self
            .peers
            .get_mut(peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        if !target.is_connected() {
            return Err(TransportError::NotConnected(peer));
        }

        match reliability {
            Reliability::Reliable => {
                target.queue_reliable(channel, data)?;
                self.flush_reliable(peer, now)?;
            }
            Reliability::Unreliable => {
                if data.len() > MAX_FRAGMENT_SIZE {
                    return Err(TransportError::PayloadTooLarge {
                        size: data.len(),
                        limit: MAX_FRAGMENT_SIZE,
                    });
                }
                let fragment = Fragment {
                    channel,
                    reliability,
                    message_id: 0,
                    index: 0,
                    count: 1,
                    data: data.to_vec(),
                };
                let addr = target.addr;
                let mut packet = target.session_packet(PacketType::Payload(fragment), now);
                self.link.send(&mut packet, addr)?;
            }
        }
        Ok(())
    }

    pub fn broadcast_on(&mut self, channel: Channel, data: &[u8]) -> Result<(), TransportError> {
        for peer in self.peers.connected_ids() {
            self.send_on(peer, channel, data)?;
        }
        Ok(())
    }

    fn flush_reliable(&mut self, peer: PeerId, now: Instant) -> io::Result<()> {
        let Some(target) = self.peers.get_mut(peer) else {
            return Ok(());
        };
        let (due, resends) = target.due_fragments(now);
        self.link.stats.reliable_resends += resends;

        let addr = target.addr;
        for fragment in due {
            let mut packet = target.session_packet(PacketType::Payload(fragment), now);
            self.link.send(&mut packet, addr)?;
        }
        Ok(())
    }

    /// Sends a best-effort disconnect notice and forgets the peer. No
    /// `on_disconnect` is raised for a disconnect this side asked for.
    pub fn disconnect(&mut self, peer: PeerId) {
        let Some(mut target) = self.peers.remove(peer) else {
            return;
        };
        if target.is_connected() {
            let now = Instant::now();
            for _ in 0..DISCONNECT_NOTICES {
                let mut packet = target.session_packet(PacketType::Disconnect, now);
                if let Err(e) = self.link.send(&mut packet, target.addr) {
                    log::debug!("disconnect notice to {} failed: {e}", target.addr);
                    break;
                }
            }
        }
        log::info!("peer {peer} ({}) disconnected locally", target.addr);
    }

    pub fn disconnect_all(&mut self) {
        for peer in self.peers.connected_ids() {
            self.disconnect(peer);
        }
    }

    /// Waits up to `timeout` for traffic, processes everything that arrived,
    /// services resends, acks, keepalives and timeouts, then dispatches the
    /// resulting events to `handler`.
    pub fn poll<H: TransportHandler>(
        &mut self,
        timeout: Duration,
        handler: &mut H,
    ) -> io::Result<()> {
        let wait = if self.events.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        self.receive(wait)?;
        self.service(Instant::now())?;

        while let Some(event) = self.events.pop_front() {
            match event {
                HostEvent::Connected(peer) => handler.on_connect(peer),
                HostEvent::Received {
                    peer,
                    channel,
                    data,
                } => handler.on_receive(peer, channel, data),
                HostEvent::Disconnected { peer, reason } => handler.on_disconnect(peer, reason),
            }
        }
        Ok(())
    }

    fn receive(&mut self, wait: Duration) -> io::Result<()> {
        if !wait.is_zero() {
            self.link.socket.set_nonblocking(false)?;
            self.link.socket.set_read_timeout(Some(wait))?;
            let first = self.link.socket.recv_from(&mut self.recv_buffer);
            self.link.socket.set_nonblocking(true)?;

            match first {
                Ok((size, addr)) => self.handle_datagram(size, addr)?,
                Err(e) if is_idle(&e) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
                Err(e) => return Err(e),
            }
        }

        loop {
            match self.link.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => self.handle_datagram(size, addr)?,
                Err(e) if is_idle(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle_datagram(&mut self, size: usize, addr: SocketAddr) -> io::Result<()> {
        if size > MAX_PACKET_SIZE {
            self.link.stats.packets_malformed += 1;
            log::warn!("dropping oversized datagram ({size} bytes) from {addr}");
            return Ok(());
        }

        let packet: Packet = match decode(&self.recv_buffer[..size]) {
            Ok(packet) => packet,
            Err(e) => {
                self.link.stats.packets_malformed += 1;
                log::warn!("dropping malformed packet from {addr}: {e}");
                return Ok(());
            }
        };
        if !packet.header.is_valid() {
            self.link.stats.packets_malformed += 1;
            log::debug!("dropping packet with foreign magic/version from {addr}");
            return Ok(());
        }

        self.link.stats.packets_received += 1;
        self.link.stats.bytes_received += size as u64;

        match packet.payload {
            PacketType::ConnectionRequest { client_salt } => {
                self.on_connection_request(addr, client_salt)
            }
            PacketType::ChallengeResponse { combined_salt } => {
                self.on_challenge_response(addr, combined_salt)
            }
            PacketType::ConnectionChallenge {
                server_salt,
                challenge,
            } => {
                self.on_challenge(addr, server_salt, challenge)
            }
            PacketType::ConnectionAccepted { peer_id } => {
                self.on_accepted(addr, peer_id);
                Ok(())
            }
            PacketType::ConnectionDenied { reason } => {
                if let Some(handshake) = self.handshake.as_mut().filter(|h| h.addr == addr) {
                    handshake.result = Some(Err(ConnectionError::Denied(reason)));
                }
                Ok(())
            }
            _ => self.on_session_packet(addr, packet),
        }
    }

    fn on_connection_request(&mut self, addr: SocketAddr, client_salt: u64) -> io::Result<()> {
        if !self.accepting {
            return Ok(());
        }

        if let Some(existing) = self.peers.get_by_addr_mut(&addr) {
            if existing.client_salt != client_salt {
                let id = existing.id;
                let was_connected = existing.is_connected();
                self.peers.remove(id);
                if was_connected {
                    log::info!("peer {id} ({addr}) replaced by a new session");
                    self.events.push_back(HostEvent::Disconnected {
                        peer: id,
                        reason: DisconnectReason::Replaced,
                    });
                }
            }
        }

        let now = Instant::now();
        let mut reply = match self.peers.get_or_create_pending(addr, client_salt) {
            Ok(peer) => {
                peer.touch(now);
                if peer.is_connected() {
                    Packet::control(PacketType::ConnectionAccepted { peer_id: peer.id })
                } else {
                    Packet::control(PacketType::ConnectionChallenge {
                        server_salt: peer.server_salt,
                        challenge: peer.combined_salt(),
                    })
                }
            }
            Err(reason) => {
                log::info!("denying connection from {addr}: {reason}");
                Packet::control(PacketType::ConnectionDenied {
                    reason: reason.to_string(),
                })
            }
        };
        self.link.send(&mut reply, addr)
    }

    fn on_challenge_response(&mut self, addr: SocketAddr, combined_salt: u64) -> io::Result<()> {
        if !self.accepting {
            return Ok(());
        }
        let Some(peer) = self.peers.get_by_addr_mut(&addr) else {
            return Ok(());
        };
        if combined_salt != peer.combined_salt() {
            log::warn!("challenge mismatch from {addr}");
            return Ok(());
        }

        peer.touch(Instant::now());
        if !peer.is_connected() {
            peer.state = ConnectionState::Connected;
            log::info!("peer {} connected from {addr}", peer.id);
            self.events.push_back(HostEvent::Connected(peer.id));
        }

        let mut reply = Packet::control(PacketType::ConnectionAccepted { peer_id: peer.id });
        self.link.send(&mut reply, addr)
    }

    fn on_challenge(
        &mut self,
        addr: SocketAddr,
        server_salt: u64,
        challenge: u64,
    ) -> io::Result<()> {
        let Some(handshake) = self.handshake.as_mut().filter(|h| h.addr == addr) else {
            return Ok(());
        };
        if handshake.result.is_some() {
            return Ok(());
        }
        if challenge != handshake.client_salt ^ server_salt {
            log::warn!("challenge mismatch from {addr}");
            handshake.result = Some(Err(ConnectionError::ChallengeMismatch(addr)));
            return Ok(());
        }

        let first = handshake.server_salt.is_none();
        handshake.server_salt = Some(server_salt);
        if first {
            self.send_handshake_step()?;
        }
        Ok(())
    }

    fn on_accepted(&mut self, addr: SocketAddr, remote_id: u32) {
        let Some(handshake) = self.handshake.as_mut().filter(|h| h.addr == addr) else {
            return;
        };
        let Some(server_salt) = handshake.server_salt else {
            return;
        };
        if handshake.result.is_some() {
            return;
        }

        let peer = self
            .peers
            .insert_connected(addr, handshake.client_salt, server_salt);
        log::info!("connected to {addr} as remote peer {remote_id}");
        handshake.result = Some(Ok(peer.id));
        self.events.push_back(HostEvent::Connected(peer.id));
    }

    fn on_session_packet(&mut self, addr: SocketAddr, packet: Packet) -> io::Result<()> {
        let now = Instant::now();
        let Some(peer) = self.peers.get_by_addr_mut(&addr) else {
            log::debug!("session packet from unknown address {addr}");
            return Ok(());
        };
        if !peer.is_connected() {
            return Ok(());
        }
        let id = peer.id;

        if peer.on_header(&packet.header, now) == HeaderOutcome::Duplicate {
            self.link.stats.packets_duplicate += 1;
            if !matches!(packet.payload, PacketType::Ack) {
                peer.owe_ack();
            }
            return Ok(());
        }

        match packet.payload {
            PacketType::Payload(fragment) => {
                let channel = fragment.channel;
                match fragment.reliability {
                    Reliability::Reliable => {
                        peer.owe_ack();
                        let mut delivered = Vec::new();
                        match peer.receive_reliable(fragment, &mut delivered) {
                            Accepted::New => {}
                            Accepted::Duplicate => self.link.stats.packets_duplicate += 1,
                            Accepted::OutOfWindow => {
                                log::debug!("peer {id}: reliable fragment outside receive window")
                            }
                        }
                        for data in delivered {
                            self.events.push_back(HostEvent::Received {
                                peer: id,
                                channel,
                                data,
                            });
                        }
                    }
                    Reliability::Unreliable => {
                        if fragment.count != 1 {
                            self.link.stats.packets_malformed += 1;
                            log::warn!("peer {id}: fragmented unreliable message dropped");
                        } else {
                            self.events.push_back(HostEvent::Received {
                                peer: id,
                                channel,
                                data: fragment.data,
                            });
                        }
                    }
                }
            }
            PacketType::Ping { timestamp } => {
                let mut pong = peer.session_packet(PacketType::Pong { timestamp }, now);
                self.link.send(&mut pong, addr)?;
            }
            PacketType::Disconnect => {
                self.peers.remove(id);
                log::info!("peer {id} ({addr}) disconnected");
                self.events.push_back(HostEvent::Disconnected {
                    peer: id,
                    reason: DisconnectReason::Graceful,
                });
                return Ok(());
            }
            _ => {}
        }

        if let Some(peer) = self.peers.get_mut(id) {
            if peer.acks_owed() >= IMMEDIATE_ACK_THRESHOLD {
                let mut ack = peer.session_packet(PacketType::Ack, now);
                self.link.send(&mut ack, addr)?;
            }
        }
        Ok(())
    }

    fn service(&mut self, now: Instant) -> io::Result<()> {
        for peer in self.peers.connected_ids() {
            self.flush_reliable(peer, now)?;

            let Some(target) = self.peers.get_mut(peer) else {
                continue;
            };
            let payload = if now.duration_since(target.last_send_time) >= KEEPALIVE_INTERVAL {
                Some(PacketType::Ping {
                    timestamp: now.duration_since(self.started).as_millis() as u64,
                })
            } else if target.acks_owed() > 0 {
                Some(PacketType::Ack)
            } else {
                None
            };
            if let Some(payload) = payload {
                let addr = target.addr;
                let mut packet = target.session_packet(payload, now);
                self.link.send(&mut packet, addr)?;
            }
        }

        for peer in self.peers.cleanup_timed_out(now) {
            if peer.is_connected() {
                log::info!("peer {} ({}) timed out", peer.id, peer.addr);
                self.events.push_back(HostEvent::Disconnected {
                    peer: peer.id,
                    reason: DisconnectReason::Timeout,
                });
            }
        }

        let connected: Vec<_> = self.peers.iter().filter(|p| p.is_connected()).collect();
        if !connected.is_empty() {
            let count = connected.len() as f32;
            self.link.stats.rtt_ms = connected.iter().map(|p| p.srtt()).sum::<f32>() / count;
            self.link.stats.rtt_variance =
                connected.iter().map(|p| p.rtt_var()).sum::<f32>() / count;
        }
        Ok(())
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
