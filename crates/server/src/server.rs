use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use glam::Vec3;
use parking_lot::{Mutex, RwLock};

use cubeworld::{
    AuthoritativeWorld, Channel, ChatLine, Chunk, ChunkPos, CodecError, DisconnectReason,
    FlatTerrain, GameEvent, Host, HostEvent, InputState, NetworkStats, PacketLossSimulation,
    PeerId, StateAggregator, SyncQueue, TransportError, UserId, WorldCache, decode, encode,
};

use crate::config::ServerConfig;
use crate::events::ServerEvent;

const SPAWN_POSITION: Vec3 = Vec3::ZERO;

/// Work handed to the network thread by everyone else.
#[derive(Debug)]
enum Outgoing {
    To {
        user: UserId,
        channel: Channel,
        data: Vec<u8>,
    },
    Broadcast {
        channel: Channel,
        data: Vec<u8>,
    },
    Kick(UserId),
}

/// Decoded traffic for the tick thread.
#[derive(Debug)]
enum TickInput {
    Joined(UserId),
    Left(UserId),
    Input { user: UserId, input: InputState },
}

#[derive(Debug, Clone, Copy)]
pub struct UserInfo {
    pub addr: SocketAddr,
    pub joined_at: Instant,
}

/// Connected users. Written by the network thread, read by the tick thread
/// and the owner of the server.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: RwLock<HashMap<UserId, UserInfo>>,
}

impl UserRegistry {
    fn insert(&self, user: UserId, info: UserInfo) {
        self.users.write().insert(user, info);
    }

    fn remove(&self, user: UserId) -> Option<UserInfo> {
        self.users.write().remove(&user)
    }

    pub fn get(&self, user: UserId) -> Option<UserInfo> {
        self.users.read().get(&user).copied()
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.users.read().contains_key(&user)
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<UserId> {
        let mut ids: Vec<_> = self.users.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub bundles_applied: u64,
    pub user_count: usize,
    pub max_clients: usize,
    pub network_stats: NetworkStats,
}

/// A running server: one thread owns the socket, another owns the
/// aggregator and the authoritative world. Dropping it stops both.
pub struct GameServer {
    local_addr: SocketAddr,
    config: ServerConfig,
    running: Arc<AtomicBool>,
    inputs: Arc<SyncQueue<TickInput>>,
    outgoing: Sender<Outgoing>,
    events: Receiver<ServerEvent>,
    registry: Arc<UserRegistry>,
    network_stats: Arc<Mutex<NetworkStats>>,
    bundles_applied: Arc<AtomicU64>,
    threads: Vec<JoinHandle<()>>,
}

impl GameServer {
    pub fn start<A: ToSocketAddrs>(bind_addr: A, config: ServerConfig) -> io::Result<Self> {
        let mut host = Host::bind(bind_addr)?;
        host.set_max_peers(config.max_clients.min(cubeworld::MAX_PLAYERS));
        host.set_timeout(config.connection_timeout());
        if config.packet_loss_percent > 0.0 {
            host.set_packet_loss(PacketLossSimulation::with_loss(config.packet_loss_percent));
        }
        let local_addr = host.local_addr();

        let terrain = FlatTerrain::default();
        let mut chunks = WorldCache::new();
        let streamed =
            terrain.chunks_around(SPAWN_POSITION.floor().as_ivec3(), config.view_radius_chunks);
        for &position in &streamed {
            chunks.insert(terrain.generate(position));
        }
        let world = AuthoritativeWorld::new(chunks, config.movement(), SPAWN_POSITION);

        let running = Arc::new(AtomicBool::new(true));
        let inputs = Arc::new(SyncQueue::new());
        let (outgoing_tx, outgoing_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let registry = Arc::new(UserRegistry::default());
        let network_stats = Arc::new(Mutex::new(NetworkStats::default()));
        let bundles_applied = Arc::new(AtomicU64::new(0));

        let network = NetworkLoop {
            host,
            running: Arc::clone(&running),
            inputs: Arc::clone(&inputs),
            outgoing: outgoing_rx,
            events: events_tx.clone(),
            registry: Arc::clone(&registry),
            stats: Arc::clone(&network_stats),
            poll_timeout: config.poll_timeout(),
        };
        let tick = TickLoop {
            aggregator: StateAggregator::new(config.aggregator()),
            world,
            streamed,
            running: Arc::clone(&running),
            inputs: Arc::clone(&inputs),
            outgoing: outgoing_tx.clone(),
            events: events_tx,
            registry: Arc::clone(&registry),
            bundles_applied: Arc::clone(&bundles_applied),
            interval: config.tick_interval(),
        };

        let threads = vec![
            thread::Builder::new()
                .name("server-net".into())
                .spawn(move || network.run())?,
            thread::Builder::new()
                .name("server-tick".into())
                .spawn(move || tick.run())?,
        ];

        log::info!(
            "server listening on {local_addr}, tick {:?}, {} chunks around spawn",
            config.tick_interval(),
            config.view_radius_chunks
        );

        Ok(Self {
            local_addr,
            config,
            running,
            inputs,
            outgoing: outgoing_tx,
            events: events_rx,
            registry,
            network_stats,
            bundles_applied,
            threads,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn registry(&self) -> &UserRegistry {
        &self.registry
    }

    pub fn drain_events(&self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.events.try_iter()
    }

    /// Queues `chunk` for `user` on the chunk channel.
    pub fn send_chunk(&self, user: UserId, chunk: &Chunk) -> Result<(), CodecError> {
        let _ = self.outgoing.send(chunk_message(user, chunk)?);
        Ok(())
    }

    pub fn kick(&self, user: UserId) {
        let _ = self.outgoing.send(Outgoing::Kick(user));
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            bundles_applied: self.bundles_applied.load(Ordering::Relaxed),
            user_count: self.registry.len(),
            max_clients: self.config.max_clients,
            network_stats: self.network_stats.lock().clone(),
        }
    }

    /// Stops both threads and waits for them. Connected users get a
    /// disconnect notice from the network thread on its way out.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.inputs.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("server thread panicked");
            }
        }
    }
}

impl Drop for GameServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn chunk_message(user: UserId, chunk: &Chunk) -> Result<Outgoing, CodecError> {
    Ok(Outgoing::To {
        user,
        channel: Channel::Chunk,
        data: encode(&mut chunk.clone())?,
    })
}

struct NetworkLoop {
    host: Host,
    running: Arc<AtomicBool>,
    inputs: Arc<SyncQueue<TickInput>>,
    outgoing: Receiver<Outgoing>,
    events: Sender<ServerEvent>,
    registry: Arc<UserRegistry>,
    stats: Arc<Mutex<NetworkStats>>,
    poll_timeout: Duration,
}

impl NetworkLoop {
    fn run(mut self) {
        let mut batch = Vec::new();
        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.host.poll(self.poll_timeout, &mut batch) {
                self.report(format!("network error: {e}"));
            }
            for event in std::mem::take(&mut batch) {
                self.handle(event);
            }
            while let Ok(message) = self.outgoing.try_recv() {
                self.dispatch(message);
            }
            *self.stats.lock() = self.host.stats().clone();
        }
        self.host.disconnect_all();
    }

    fn handle(&mut self, event: HostEvent) {
        match event {
            HostEvent::Connected(peer) => {
                let Some(addr) = self.host.peer_addr(peer) else {
                    return;
                };
                self.registry.insert(
                    peer,
                    UserInfo {
                        addr,
                        joined_at: Instant::now(),
                    },
                );
                self.inputs.push(TickInput::Joined(peer));
            }
            HostEvent::Received {
                peer,
                channel: Channel::State,
                data,
            } => match decode::<InputState>(&data) {
                Ok(input) => self.inputs.push(TickInput::Input { user: peer, input }),
                Err(e) => log::warn!("dropping malformed input from user {peer}: {e}"),
            },
            HostEvent::Received {
                peer,
                channel: Channel::Chat,
                data,
            } => self.relay_chat(peer, &data),
            HostEvent::Received { peer, channel, data } => {
                log::debug!("ignoring {} bytes on {channel:?} from user {peer}", data.len());
            }
            HostEvent::Disconnected { peer, reason } => self.leave(peer, reason),
        }
    }

    fn relay_chat(&mut self, peer: PeerId, data: &[u8]) {
        let text = match decode::<String>(data) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("dropping malformed chat from user {peer}: {e}");
                return;
            }
        };
        let mut line = ChatLine::new(peer, text);
        match encode(&mut line) {
            Ok(bytes) => {
                if let Err(e) = self.host.broadcast_on(Channel::Chat, &bytes) {
                    self.report(format!("chat relay failed: {e}"));
                }
            }
            Err(e) => self.report(format!("encoding chat failed: {e}")),
        }
        let _ = self.events.send(ServerEvent::Chat {
            user_id: line.user_id,
            text: line.text,
        });
    }

    fn leave(&mut self, user: UserId, reason: DisconnectReason) {
        if self.registry.remove(user).is_some() {
            self.inputs.push(TickInput::Left(user));
            let _ = self.events.send(ServerEvent::UserLeft {
                user_id: user,
                reason,
            });
        }
    }

    fn dispatch(&mut self, message: Outgoing) {
        let result = match message {
            Outgoing::To {
                user,
                channel,
                data,
            } => self.host.send_on(user, channel, &data),
            Outgoing::Broadcast { channel, data } => self.host.broadcast_on(channel, &data),
            Outgoing::Kick(user) => {
                self.host.disconnect(user);
                self.leave(user, DisconnectReason::Kicked);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            // The user left while the message was queued.
            Err(TransportError::UnknownPeer(_) | TransportError::NotConnected(_)) => {}
            Err(e) => self.report(format!("send failed: {e}")),
        }
    }

    fn report(&self, message: String) {
        let _ = self.events.send(ServerEvent::Error { message });
    }
}

struct TickLoop {
    aggregator: StateAggregator,
    world: AuthoritativeWorld,
    streamed: Vec<ChunkPos>,
    running: Arc<AtomicBool>,
    inputs: Arc<SyncQueue<TickInput>>,
    outgoing: Sender<Outgoing>,
    events: Sender<ServerEvent>,
    registry: Arc<UserRegistry>,
    bundles_applied: Arc<AtomicU64>,
    interval: Duration,
}

impl TickLoop {
    fn run(mut self) {
        let mut next_tick = Instant::now() + self.interval;
        while self.running.load(Ordering::Relaxed) {
            let wait = next_tick.saturating_duration_since(Instant::now());
            if let Some(message) = self.inputs.pop_timeout(wait) {
                self.handle(message);
            }

            let now = Instant::now();
            if now >= next_tick {
                self.tick(now);
                next_tick += self.interval;
                if next_tick < now {
                    next_tick = now + self.interval;
                }
            }
        }
    }

    fn handle(&mut self, message: TickInput) {
        match message {
            TickInput::Joined(user) => self.join(user),
            TickInput::Left(user) => {
                self.aggregator.remove_user(user);
                self.world.remove_player(user);
                self.broadcast_event(GameEvent::PlayerLeft { user_id: user });
            }
            TickInput::Input { user, input } => {
                if let Err(e) = self.aggregator.receive(user, input, Instant::now()) {
                    log::warn!("dropping input from user {user}: {e}");
                }
            }
        }
    }

    fn join(&mut self, user: UserId) {
        self.aggregator.add_user(user);
        self.world.add_player(user);
        let start_sequence = self.aggregator.join_sequence();

        self.send_event(
            user,
            GameEvent::Welcome {
                user_id: user,
                next_sequence: start_sequence,
                spawn_position: self.world.spawn_position(),
            },
        );
        self.broadcast_event(GameEvent::PlayerJoined { user_id: user });

        let mut sent = 0;
        for position in &self.streamed {
            let Some(chunk) = self.world.chunks().get(*position) else {
                continue;
            };
            match chunk_message(user, chunk) {
                Ok(message) => {
                    self.send(message);
                    sent += 1;
                }
                Err(e) => log::error!("encoding chunk {position} failed: {e}"),
            }
        }
        log::debug!("streaming {sent} chunks to user {user}");

        if let Some(info) = self.registry.get(user) {
            let _ = self.events.send(ServerEvent::UserJoined {
                user_id: user,
                addr: info.addr,
                start_sequence,
            });
        }
    }

    fn tick(&mut self, now: Instant) {
        for bundle in self.aggregator.poll_ready(now) {
            let mut snapshot = self.world.apply_bundle(&bundle);
            self.bundles_applied.fetch_add(1, Ordering::Relaxed);
            match encode(&mut snapshot) {
                Ok(data) => self.send(Outgoing::Broadcast {
                    channel: Channel::State,
                    data,
                }),
                Err(e) => log::error!("encoding confirmation {} failed: {e}", bundle.sequence),
            }
        }
    }

    fn send_event(&self, user: UserId, mut event: GameEvent) {
        match encode(&mut event) {
            Ok(data) => self.send(Outgoing::To {
                user,
                channel: Channel::Events,
                data,
            }),
            Err(e) => log::error!("encoding {event:?} failed: {e}"),
        }
    }

    fn broadcast_event(&self, mut event: GameEvent) {
        match encode(&mut event) {
            Ok(data) => self.send(Outgoing::Broadcast {
                channel: Channel::Events,
                data,
            }),
            Err(e) => log::error!("encoding {event:?} failed: {e}"),
        }
    }

    fn send(&self, message: Outgoing) {
        // Only fails once the network thread is gone, i.e. during shutdown.
        let _ = self.outgoing.send(message);
    }
}
