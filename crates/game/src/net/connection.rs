use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::error::TransportError;
use super::protocol::{Channel, Fragment, Packet, PacketHeader, PacketType, Reliability};
use super::reliable::{Accepted, ReliableReceiver, ReliableSender};
use super::stats::rand_u64;
use super::tracking::{AckTracker, ReceiveTracker};

pub type PeerId = u32;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const TRACKED_PACKETS: usize = 1024;
const IN_FLIGHT_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
}

/// Result of looking at an incoming session packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOutcome {
    Fresh,
    Duplicate,
}

#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub state: ConnectionState,
    pub client_salt: u64,
    pub server_salt: u64,
    pub last_receive_time: Instant,
    pub last_send_time: Instant,
    send_sequence: u32,
    ack_tracker: AckTracker,
    receive_tracker: ReceiveTracker,
    senders: Vec<ReliableSender>,
    receivers: Vec<ReliableReceiver>,
    in_flight: HashMap<u32, Vec<(Channel, u32)>>,
    acks_owed: usize,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, client_salt: u64, server_salt: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            state: ConnectionState::Connecting,
            client_salt,
            server_salt,
            last_receive_time: now,
            last_send_time: now,
            // 0 is what an empty ack header carries, so it never names a real packet
            send_sequence: 1,
            ack_tracker: AckTracker::new(TRACKED_PACKETS),
            receive_tracker: ReceiveTracker::new(),
            senders: Channel::ALL.iter().map(|&c| ReliableSender::new(c)).collect(),
            receivers: Channel::ALL.iter().map(|_| ReliableReceiver::new()).collect(),
            in_flight: HashMap::new(),
            acks_owed: 0,
        }
    }

    pub fn combined_salt(&self) -> u64 {
        self.client_salt ^ self.server_salt
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_timed_out(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_receive_time) > timeout
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_receive_time = now;
    }

    /// Stamps a session packet with the next sequence and the current acks.
    pub fn session_packet(&mut self, payload: PacketType, now: Instant) -> Packet {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1).max(1);

        let (ack, ack_bitfield) = self.receive_tracker.ack_data();
        self.ack_tracker.track_packet(sequence, now);
        self.acks_owed = 0;
        self.last_send_time = now;

        if let PacketType::Payload(fragment) = &payload {
            if fragment.reliability == Reliability::Reliable {
                self.track_fragment(sequence, fragment.channel, fragment.message_id);
            }
        }

        Packet::new(PacketHeader::new(sequence, ack, ack_bitfield), payload)
    }

    fn track_fragment(&mut self, sequence: u32, channel: Channel, message_id: u32) {
        if self.in_flight.len() >= IN_FLIGHT_LIMIT {
            let current = self.send_sequence;
            self.in_flight
                .retain(|&seq, _| current.wrapping_sub(seq) < TRACKED_PACKETS as u32);
        }
        self.in_flight
            .entry(sequence)
            .or_default()
            .push((channel, message_id));
    }

    pub fn queue_reliable(&mut self, channel: Channel, data: &[u8]) -> Result<(), TransportError> {
        self.senders[channel.index()].queue(data)
    }

    /// Reliable fragments ready to go out now, and how many of them are resends.
    pub fn due_fragments(&mut self, now: Instant) -> (Vec<Fragment>, u64) {
        let rto = self.ack_tracker.rto();
        let mut due = Vec::new();
        let mut resends = 0;
        for sender in &mut self.senders {
            let (fragments, count) = sender.take_due(now, rto);
            due.extend(fragments);
            resends += count;
        }
        (due, resends)
    }

    pub fn on_header(&mut self, header: &PacketHeader, now: Instant) -> HeaderOutcome {
        self.touch(now);

        for sequence in self
            .ack_tracker
            .process_ack(header.ack, header.ack_bitfield, now)
        {
            if let Some(messages) = self.in_flight.remove(&sequence) {
                for (channel, message_id) in messages {
                    self.senders[channel.index()].acknowledge(message_id);
                }
            }
        }

        if self.receive_tracker.record_received(header.sequence) {
            HeaderOutcome::Fresh
        } else {
            HeaderOutcome::Duplicate
        }
    }

    pub fn owe_ack(&mut self) {
        self.acks_owed += 1;
    }

    pub fn acks_owed(&self) -> usize {
        self.acks_owed
    }

    pub fn receive_reliable(
        &mut self,
        fragment: Fragment,
        delivered: &mut Vec<Vec<u8>>,
    ) -> Accepted {
        let channel = fragment.channel;
        self.receivers[channel.index()].receive(fragment, delivered)
    }

    pub fn pending_reliable(&self) -> usize {
        self.senders.iter().map(ReliableSender::pending).sum()
    }

    pub fn srtt(&self) -> f32 {
        self.ack_tracker.srtt()
    }

    pub fn rtt_var(&self) -> f32 {
        self.ack_tracker.rtt_var()
    }
}

#[derive(Debug)]
pub struct PeerManager {
    peers_by_addr: HashMap<SocketAddr, PeerId>,
    peers: HashMap<PeerId, Peer>,
    next_peer_id: PeerId,
    max_peers: usize,
    timeout: Duration,
}

impl PeerManager {
    pub fn new(max_peers: usize) -> Self {
        Self::with_timeout(max_peers, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(max_peers: usize, timeout: Duration) -> Self {
        Self {
            peers_by_addr: HashMap::new(),
            peers: HashMap::new(),
            next_peer_id: 1,
            max_peers,
            timeout,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_max_peers(&mut self, max_peers: usize) {
        self.max_peers = max_peers;
    }

    pub fn get_or_create_pending(
        &mut self,
        addr: SocketAddr,
        client_salt: u64,
    ) -> Result<&mut Peer, &'static str> {
        let peer_id = match self.peers_by_addr.get(&addr) {
            Some(&id) => id,
            None => {
                if self.peers.len() >= self.max_peers {
                    return Err("server full");
                }
                let id = self.allocate_id();
                self.peers_by_addr.insert(addr, id);
                id
            }
        };

        match self.peers.entry(peer_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                Ok(entry.insert(Peer::new(peer_id, addr, client_salt, rand_u64())))
            }
        }
    }

    /// Registers a peer this side initiated; the handshake already finished.
    pub fn insert_connected(
        &mut self,
        addr: SocketAddr,
        client_salt: u64,
        server_salt: u64,
    ) -> &mut Peer {
        if let Some(old) = self.peers_by_addr.remove(&addr) {
            self.peers.remove(&old);
        }
        let id = self.allocate_id();
        self.peers_by_addr.insert(addr, id);

        let mut peer = Peer::new(id, addr, client_salt, server_salt);
        peer.state = ConnectionState::Connected;
        self.peers.entry(id).or_insert(peer)
    }

    fn allocate_id(&mut self) -> PeerId {
        let id = self.next_peer_id;
        self.next_peer_id = self.next_peer_id.wrapping_add(1).max(1);
        id
    }

    pub fn id_by_addr(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.peers_by_addr.get(addr).copied()
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut Peer> {
        let id = self.peers_by_addr.get(addr)?;
        self.peers.get_mut(id)
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.get(&peer_id)
    }

    pub fn get_mut(&mut self, peer_id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&peer_id)
    }

    pub fn remove(&mut self, peer_id: PeerId) -> Option<Peer> {
        let peer = self.peers.remove(&peer_id)?;
        self.peers_by_addr.remove(&peer.addr);
        Some(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn connected_ids(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.id)
            .collect()
    }

    /// Removes and returns every peer silent for longer than the timeout.
    pub fn cleanup_timed_out(&mut self, now: Instant) -> Vec<Peer> {
        let timed_out: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.is_timed_out(self.timeout, now))
            .map(|p| p.id)
            .collect();

        timed_out.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected()).count()
    }

    pub fn total_count(&self) -> usize {
        self.peers.len()
    }
}
