use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, Sender, unbounded};
use glam::Vec3;
use parking_lot::{Mutex, RwLock};

use cubeworld::sync::PredictionStats;
use cubeworld::{
    Channel, ChatLine, Chunk, ClientPrediction, ConfirmationSnapshot, DisconnectReason,
    GameEvent, Host, HostEvent, InputCapture, InputSource, NetworkStats, PacketLossSimulation,
    PeerId, PlayerBody, PlayerState, Reconciliation, Sequence, SyncQueue, UserId, WorldCache,
    decode, encode,
};

use super::config::ClientConfig;

#[derive(Debug)]
enum Outgoing {
    Input(Vec<u8>),
    Chat(Vec<u8>),
}

/// What the server told us in its welcome.
#[derive(Debug, Clone, Copy)]
struct Session {
    user_id: UserId,
    next_sequence: Sequence,
    spawn: Vec3,
}

/// State shared between the client threads and whoever renders.
struct Shared {
    running: AtomicBool,
    prediction: Mutex<ClientPrediction>,
    world: Arc<RwLock<WorldCache>>,
    remote_players: RwLock<BTreeMap<UserId, PlayerState>>,
    snapshots: SyncQueue<ConfirmationSnapshot>,
    chunks: SyncQueue<Chunk>,
    chat: Arc<SyncQueue<ChatLine>>,
    network_stats: Mutex<NetworkStats>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
}

impl Shared {
    fn new(prediction: ClientPrediction) -> Self {
        Self {
            running: AtomicBool::new(true),
            prediction: Mutex::new(prediction),
            world: Arc::new(RwLock::new(WorldCache::new())),
            remote_players: RwLock::new(BTreeMap::new()),
            snapshots: SyncQueue::new(),
            chunks: SyncQueue::new(),
            chat: Arc::new(SyncQueue::new()),
            network_stats: Mutex::new(NetworkStats::default()),
            disconnect_reason: Mutex::new(None),
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.snapshots.stop();
        self.chunks.stop();
    }
}

/// A connected client. Four threads run behind it: the network thread owns
/// the socket, the input thread samples and predicts once per tick, the
/// reconciliation thread applies confirmations and the ingest thread fills
/// the world cache with streamed chunks.
pub struct NetworkClient {
    session: Session,
    server_addr: SocketAddr,
    shared: Arc<Shared>,
    outgoing: Sender<Outgoing>,
    threads: Vec<JoinHandle<()>>,
}

impl NetworkClient {
    pub fn connect<S>(config: ClientConfig, server_addr: SocketAddr, input: S) -> Result<Self>
    where
        S: InputSource + 'static,
    {
        let mut host = Host::client()?;
        host.set_timeout(config.connection_timeout());
        if config.packet_loss_percent > 0.0 {
            host.set_packet_loss(PacketLossSimulation::with_loss(config.packet_loss_percent));
        }

        log::info!("connecting to {server_addr}");
        let peer = host.connect(server_addr, config.connect_timeout())?;
        let (session, early_chunks) = await_welcome(&mut host, config.welcome_timeout())?;
        log::info!(
            "joined as user {} starting at {}, spawn {}",
            session.user_id,
            session.next_sequence,
            session.spawn
        );

        let prediction = ClientPrediction::new(
            session.user_id,
            PlayerBody::at(session.spawn),
            config.movement(),
            config.reconcile_tolerance,
        );
        let shared = Arc::new(Shared::new(prediction));
        for chunk in early_chunks {
            shared.chunks.push(chunk);
        }

        let (outgoing_tx, outgoing_rx) = unbounded();
        let network = NetworkLoop {
            host,
            peer,
            shared: Arc::clone(&shared),
            outgoing: outgoing_rx,
            poll_timeout: config.poll_timeout(),
        };
        let ticker = InputLoop {
            source: input,
            capture: InputCapture::starting_at(session.next_sequence),
            shared: Arc::clone(&shared),
            outgoing: outgoing_tx.clone(),
            interval: config.tick_interval(),
        };

        let reconcile_shared = Arc::clone(&shared);
        let ingest_shared = Arc::clone(&shared);
        let threads = vec![
            thread::Builder::new()
                .name("client-net".into())
                .spawn(move || network.run())?,
            thread::Builder::new()
                .name("client-input".into())
                .spawn(move || ticker.run())?,
            thread::Builder::new()
                .name("client-reconcile".into())
                .spawn(move || reconcile(&reconcile_shared))?,
            thread::Builder::new()
                .name("client-chunks".into())
                .spawn(move || ingest_chunks(&ingest_shared))?,
        ];

        Ok(Self {
            session,
            server_addr,
            shared,
            outgoing: outgoing_tx,
            threads,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.session.user_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.shared.disconnect_reason.lock()
    }

    /// Reconciled local body, for rendering.
    pub fn live(&self) -> PlayerBody {
        self.shared.prediction.lock().live()
    }

    pub fn prediction_stats(&self) -> PredictionStats {
        self.shared.prediction.lock().stats().clone()
    }

    pub fn last_confirmed(&self) -> Option<Sequence> {
        self.shared.prediction.lock().last_reconciled()
    }

    pub fn world(&self) -> Arc<RwLock<WorldCache>> {
        Arc::clone(&self.shared.world)
    }

    /// Everyone else as of the latest confirmation.
    pub fn remote_players(&self) -> Vec<PlayerState> {
        self.shared.remote_players.read().values().copied().collect()
    }

    pub fn chat(&self) -> Arc<SyncQueue<ChatLine>> {
        Arc::clone(&self.shared.chat)
    }

    pub fn send_chat(&self, text: &str) -> Result<()> {
        let mut text = text.to_string();
        cubeworld::event::truncate_chat(&mut text);
        let data = encode(&mut text)?;
        if self.outgoing.send(Outgoing::Chat(data)).is_err() {
            bail!("client is shut down");
        }
        Ok(())
    }

    pub fn network_stats(&self) -> NetworkStats {
        self.shared.network_stats.lock().clone()
    }

    /// Stops every thread and waits for them. The network thread sends the
    /// server a disconnect notice on its way out.
    pub fn shutdown(&mut self) {
        self.shared.stop();
        self.shared.chat.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("client thread panicked");
            }
        }
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Polls until the server's welcome arrives. Chunks that overtake it are
/// kept; anything else is dropped.
fn await_welcome(host: &mut Host, timeout: Duration) -> Result<(Session, Vec<Chunk>)> {
    let deadline = Instant::now() + timeout;
    let mut chunks = Vec::new();
    let mut events = Vec::new();

    while Instant::now() < deadline {
        host.poll(Duration::from_millis(5), &mut events)?;
        for event in events.drain(..) {
            match event {
                HostEvent::Received {
                    channel: Channel::Events,
                    data,
                    ..
                } => {
                    if let Ok(GameEvent::Welcome {
                        user_id,
                        next_sequence,
                        spawn_position,
                    }) = decode(&data)
                    {
                        let session = Session {
                            user_id,
                            next_sequence,
                            spawn: spawn_position,
                        };
                        return Ok((session, chunks));
                    }
                }
                HostEvent::Received {
                    channel: Channel::Chunk,
                    data,
                    ..
                } => match decode::<Chunk>(&data) {
                    Ok(chunk) => chunks.push(chunk),
                    Err(e) => log::warn!("dropping malformed chunk: {e}"),
                },
                HostEvent::Disconnected { reason, .. } => {
                    bail!("server dropped the connection: {}", reason.as_str())
                }
                _ => {}
            }
        }
    }
    bail!("no welcome from the server within {timeout:?}")
}

struct NetworkLoop {
    host: Host,
    peer: PeerId,
    shared: Arc<Shared>,
    outgoing: Receiver<Outgoing>,
    poll_timeout: Duration,
}

impl NetworkLoop {
    fn run(mut self) {
        let mut batch = Vec::new();
        while self.shared.running.load(Ordering::Relaxed) {
            if let Err(e) = self.host.poll(self.poll_timeout, &mut batch) {
                log::error!("network error: {e}");
            }
            for event in std::mem::take(&mut batch) {
                self.handle(event);
            }
            while let Ok(message) = self.outgoing.try_recv() {
                let (channel, data) = match message {
                    Outgoing::Input(data) => (Channel::State, data),
                    Outgoing::Chat(data) => (Channel::Chat, data),
                };
                if let Err(e) = self.host.send_on(self.peer, channel, &data) {
                    log::warn!("send on {channel:?} failed: {e}");
                }
            }
            *self.shared.network_stats.lock() = self.host.stats().clone();
        }
        self.host.disconnect(self.peer);
    }

    fn handle(&mut self, event: HostEvent) {
        match event {
            HostEvent::Connected(_) => {}
            HostEvent::Received { channel, data, .. } => self.dispatch(channel, &data),
            HostEvent::Disconnected { reason, .. } => {
                log::info!("server connection {}", reason.as_str());
                *self.shared.disconnect_reason.lock() = Some(reason);
                self.shared.stop();
            }
        }
    }

    fn dispatch(&mut self, channel: Channel, data: &[u8]) {
        match channel {
            Channel::State => match decode::<ConfirmationSnapshot>(data) {
                Ok(snapshot) => self.shared.snapshots.push(snapshot),
                Err(e) => log::warn!("dropping malformed confirmation: {e}"),
            },
            Channel::Chunk => match decode::<Chunk>(data) {
                Ok(chunk) => self.shared.chunks.push(chunk),
                Err(e) => log::warn!("dropping malformed chunk: {e}"),
            },
            Channel::Chat => match decode::<ChatLine>(data) {
                Ok(line) => self.shared.chat.push(line),
                Err(e) => log::warn!("dropping malformed chat line: {e}"),
            },
            Channel::Events => match decode::<GameEvent>(data) {
                Ok(GameEvent::PlayerJoined { user_id }) => log::info!("user {user_id} joined"),
                Ok(GameEvent::PlayerLeft { user_id }) => {
                    self.shared.remote_players.write().remove(&user_id);
                    log::info!("user {user_id} left");
                }
                Ok(other) => log::debug!("ignoring {other:?}"),
                Err(e) => log::warn!("dropping malformed event: {e}"),
            },
        }
    }
}

struct InputLoop<S> {
    source: S,
    capture: InputCapture,
    shared: Arc<Shared>,
    outgoing: Sender<Outgoing>,
    interval: Duration,
}

impl<S: InputSource> InputLoop<S> {
    fn run(mut self) {
        let mut next_tick = Instant::now();
        while self.shared.running.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now < next_tick {
                thread::sleep(next_tick - now);
                continue;
            }
            next_tick += self.interval;
            if next_tick < now {
                next_tick = now + self.interval;
            }

            let mut input = self.capture.capture(self.source.sample());
            {
                let mut prediction = self.shared.prediction.lock();
                let world = self.shared.world.read();
                prediction.apply_local(input, &*world);
            }

            match encode(&mut input) {
                Ok(data) => {
                    if self.outgoing.send(Outgoing::Input(data)).is_err() {
                        break;
                    }
                }
                Err(e) => log::error!("encoding input {} failed: {e}", input.sequence),
            }
        }
    }
}

fn reconcile(shared: &Shared) {
    while let Some(snapshot) = shared.snapshots.pop() {
        apply_confirmation(shared, &snapshot);
    }
}

/// Reconciles against `snapshot` and, unless it is stale, replaces the
/// remote player view with the players it carries.
fn apply_confirmation(shared: &Shared, snapshot: &ConfirmationSnapshot) {
    let (own, result) = {
        let mut prediction = shared.prediction.lock();
        let world = shared.world.read();
        (prediction.user_id(), prediction.reconcile(snapshot, &*world))
    };
    match result {
        Reconciliation::Corrected { error } => {
            log::debug!("corrected by {error} at {}", snapshot.sequence)
        }
        Reconciliation::Stale => {
            log::debug!("stale confirmation {}", snapshot.sequence);
            return;
        }
        Reconciliation::NotPresent => {
            log::warn!("confirmation {} does not include us", snapshot.sequence)
        }
        Reconciliation::WithinTolerance => {}
    }

    *shared.remote_players.write() = snapshot
        .players
        .iter()
        .filter(|p| p.user_id != own)
        .map(|p| (p.user_id, *p))
        .collect();
}

fn ingest_chunks(shared: &Shared) {
    while let Some(chunk) = shared.chunks.pop() {
        let position = chunk.position();
        if shared.world.write().insert(chunk) {
            log::debug!("received chunk {position}");
        } else {
            log::debug!("replaced chunk {position}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubeworld::sync::DEFAULT_TOLERANCE;
    use cubeworld::{
        ChunkPos, FlatTerrain, InputSample, InputState, MovementConfig, MovementFlags, apply_input,
    };
    use glam::IVec3;

    /// Minimal authority: welcomes one user, streams one chunk, confirms
    /// every input it hears and echoes chat.
    fn spawn_fake_server(
        welcome_sequence: u8,
    ) -> (SocketAddr, Arc<AtomicBool>, JoinHandle<()>) {
        let mut host = Host::bind("127.0.0.1:0").unwrap();
        let addr = host.local_addr();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::spawn(move || {
            let terrain = FlatTerrain::default();
            let mut body = PlayerBody::default();
            let movement = MovementConfig::default();
            let mut events = Vec::new();

            while flag.load(Ordering::Relaxed) {
                host.poll(Duration::from_millis(5), &mut events).unwrap();
                for event in events.drain(..) {
                    match event {
                        HostEvent::Connected(peer) => {
                            let ground = ChunkPos::from_grid(IVec3::new(0, -1, 0));
                            let data = encode(&mut terrain.generate(ground)).unwrap();
                            host.send_on(peer, Channel::Chunk, &data).unwrap();

                            let mut welcome = GameEvent::Welcome {
                                user_id: peer,
                                next_sequence: Sequence(welcome_sequence),
                                spawn_position: Vec3::ZERO,
                            };
                            let data = encode(&mut welcome).unwrap();
                            host.send_on(peer, Channel::Events, &data).unwrap();
                        }
                        HostEvent::Received {
                            peer,
                            channel: Channel::State,
                            data,
                        } => {
                            let input: InputState = decode(&data).unwrap();
                            apply_input(&mut body, &input, &movement, &terrain);
                            let mut snapshot = ConfirmationSnapshot {
                                sequence: input.sequence,
                                players: vec![
                                    PlayerState::new(peer, &body),
                                    PlayerState::new(99, &PlayerBody::at(Vec3::X)),
                                ],
                            };
                            let data = encode(&mut snapshot).unwrap();
                            host.send_on(peer, Channel::State, &data).unwrap();
                        }
                        HostEvent::Received {
                            peer,
                            channel: Channel::Chat,
                            data,
                        } => {
                            let text: String = decode(&data).unwrap();
                            let mut line = ChatLine::new(peer, text);
                            let data = encode(&mut line).unwrap();
                            host.send_on(peer, Channel::Chat, &data).unwrap();
                        }
                        _ => {}
                    }
                }
            }
        });
        (addr, running, handle)
    }

    fn forward() -> InputSample {
        InputSample {
            movement: MovementFlags::FORWARD,
            ..Default::default()
        }
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_client_predicts_and_reconciles() {
        let (addr, running, server) = spawn_fake_server(200);
        let mut client = NetworkClient::connect(ClientConfig::default(), addr, forward).unwrap();
        assert_eq!(client.user_id(), 1);

        assert!(wait_until(Duration::from_secs(3), || {
            client.prediction_stats().reconciliations >= 5
        }));
        assert!(client.live().position.z >= 5.0);
        assert!(client.last_confirmed().is_some());
        assert_eq!(client.prediction_stats().corrections, 0);
        assert_eq!(client.remote_players().len(), 1);
        assert_eq!(client.remote_players()[0].user_id, 99);

        let world = client.world();
        assert!(wait_until(Duration::from_secs(2), || world.read().len() == 1));

        client.shutdown();
        assert!(!client.is_running());
        running.store(false, Ordering::Relaxed);
        server.join().unwrap();
    }

    #[test]
    fn test_chat_round_trip() {
        let (addr, running, server) = spawn_fake_server(0);
        let client =
            NetworkClient::connect(ClientConfig::default(), addr, InputSample::default).unwrap();

        client.send_chat("hello there").unwrap();
        let chat = client.chat();
        let mut line = None;
        assert!(wait_until(Duration::from_secs(3), || {
            line = chat.try_pop();
            line.is_some()
        }));
        assert_eq!(line, Some(ChatLine::new(client.user_id(), "hello there")));

        drop(client);
        running.store(false, Ordering::Relaxed);
        server.join().unwrap();
    }

    #[test]
    fn test_departed_player_not_restored_by_queued_snapshot() {
        let prediction = ClientPrediction::new(
            1,
            PlayerBody::default(),
            MovementConfig::default(),
            DEFAULT_TOLERANCE,
        );
        let shared = Shared::new(prediction);
        let confirmation = |sequence: u8, users: &[UserId]| ConfirmationSnapshot {
            sequence: Sequence(sequence),
            players: users
                .iter()
                .map(|&user| PlayerState::new(user, &PlayerBody::default()))
                .collect(),
        };

        apply_confirmation(&shared, &confirmation(10, &[1, 2, 3]));
        let ids = |shared: &Shared| -> Vec<UserId> {
            shared.remote_players.read().keys().copied().collect()
        };
        assert_eq!(ids(&shared), vec![2, 3]);

        // user 2 left while 11 still sat in the queue
        shared.remote_players.write().remove(&2);
        apply_confirmation(&shared, &confirmation(11, &[1, 2, 3]));
        apply_confirmation(&shared, &confirmation(12, &[1, 3]));
        assert_eq!(ids(&shared), vec![3]);

        // a late datagram from before the leave changes nothing
        apply_confirmation(&shared, &confirmation(11, &[1, 2, 3]));
        assert_eq!(ids(&shared), vec![3]);
    }

    #[test]
    fn test_connect_fails_without_welcome() {
        let mut silent = Host::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr();
        let accept = thread::spawn(move || {
            let mut events = Vec::new();
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                silent.poll(Duration::from_millis(5), &mut events).unwrap();
            }
        });

        let config = ClientConfig {
            welcome_timeout_ms: 200,
            ..Default::default()
        };
        let result = NetworkClient::connect(config, addr, InputSample::default);
        assert!(result.is_err());
        accept.join().unwrap();
    }
}
