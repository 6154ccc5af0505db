use std::time::{Duration, Instant};

use glam::{IVec3, Vec3};

use cubeworld::sync::{Closure, DEFAULT_TOLERANCE};
use cubeworld::{
    AggregatorConfig, AuthoritativeWorld, BlockId, Chunk, ChunkPos, ClientPrediction,
    ConfirmationSnapshot, FlatTerrain, InputCapture, InputSample, MovementConfig, MovementFlags,
    PlayerBody, Reconciliation, Sequence, StateAggregator, SyncError, UserId, WorldCache, decode,
    encode,
};

fn flat_world() -> WorldCache {
    let terrain = FlatTerrain::default();
    let mut cache = WorldCache::new();
    for position in terrain.chunks_around(IVec3::ZERO, 1) {
        cache.insert(terrain.generate(position));
    }
    cache
}

fn client(user: UserId) -> ClientPrediction {
    ClientPrediction::new(
        user,
        PlayerBody::default(),
        MovementConfig::default(),
        DEFAULT_TOLERANCE,
    )
}

fn forward() -> InputSample {
    InputSample {
        movement: MovementFlags::FORWARD,
        ..Default::default()
    }
}

/// Encodes and decodes the snapshot the way it travels on the state channel.
fn over_the_wire(mut snapshot: ConfirmationSnapshot) -> ConfirmationSnapshot {
    let bytes = encode(&mut snapshot).unwrap();
    decode(&bytes).unwrap()
}

#[test]
fn test_clean_round_trip() {
    let now = Instant::now();
    let mut aggregator = StateAggregator::new(AggregatorConfig::default());
    let mut server = AuthoritativeWorld::new(flat_world(), MovementConfig::default(), Vec3::ZERO);
    aggregator.add_user(1);
    server.add_player(1);

    let client_world = flat_world();
    let mut capture = InputCapture::starting_at(aggregator.join_sequence());
    let mut prediction = client(1);

    let input = capture.capture(forward());
    prediction.apply_local(input, &client_world);
    aggregator.receive(1, input, now).unwrap();

    let ready = aggregator.poll_ready(now);
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].closure, Closure::Complete);

    let snapshot = over_the_wire(server.apply_bundle(&ready[0]));
    assert_eq!(
        snapshot.player(1).map(|p| p.position),
        Some(Vec3::new(0.0, 0.0, 1.0))
    );
    assert_eq!(
        prediction.reconcile(&snapshot, &client_world),
        Reconciliation::WithinTolerance
    );
    assert_eq!(prediction.outbox_len(), 0);
    assert_eq!(prediction.live().position, Vec3::new(0.0, 0.0, 1.0));
}

#[test]
fn test_lost_input_is_filled_after_timeout() {
    let now = Instant::now();
    let config = AggregatorConfig::default();
    let mut aggregator = StateAggregator::new(config);
    let mut server = AuthoritativeWorld::new(flat_world(), MovementConfig::default(), Vec3::ZERO);
    for user in [1, 2] {
        aggregator.add_user(user);
        server.add_player(user);
    }

    let client_world = flat_world();
    let mut capture = InputCapture::starting_at(Sequence(5));
    let mut prediction = client(1);
    let inputs: Vec<_> = (0..3).map(|_| capture.capture(forward())).collect();
    for input in &inputs {
        prediction.apply_local(*input, &client_world);
    }

    // User 1's second input never reaches the server.
    aggregator.receive(1, inputs[0], now).unwrap();
    aggregator.receive(1, inputs[2], now).unwrap();
    for sequence in 5..=7 {
        let idle = cubeworld::InputState {
            sequence: Sequence(sequence),
            ..Default::default()
        };
        aggregator.receive(2, idle, now).unwrap();
    }

    let first = aggregator.poll_ready(now);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].sequence, Sequence(5));

    let rest = aggregator.poll_ready(now + config.bundle_timeout + Duration::from_millis(1));
    let sequences: Vec<_> = rest.iter().map(|b| b.sequence).collect();
    assert_eq!(sequences, vec![Sequence(6), Sequence(7)]);
    assert_eq!(rest[0].closure, Closure::Timeout);
    assert_eq!(rest[0].reported, 1);
    assert_eq!(rest[0].inputs[&1].sequence, Sequence(6));
    assert_eq!(rest[0].inputs[&1].movement, MovementFlags::FORWARD);
    assert_eq!(aggregator.stats().filled_inputs, 1);

    let mut last = None;
    for bundle in first.iter().chain(rest.iter()) {
        last = Some(server.apply_bundle(bundle));
    }
    let snapshot = over_the_wire(last.unwrap());
    assert_eq!(
        snapshot.player(1).map(|p| p.position),
        Some(Vec3::new(0.0, 0.0, 3.0))
    );
    assert_eq!(snapshot.player(2).map(|p| p.position), Some(Vec3::ZERO));
    assert_eq!(
        prediction.reconcile(&snapshot, &client_world),
        Reconciliation::WithinTolerance
    );
}

#[test]
fn test_divergence_is_corrected_and_replayed() {
    let now = Instant::now();
    let mut walled = flat_world();
    let mut chunk = FlatTerrain::default().generate(ChunkPos::from_grid(IVec3::ZERO));
    for x in 0..4 {
        for y in 0..2 {
            chunk.set(IVec3::new(x, y, 1), BlockId::STONE);
        }
    }
    walled.insert(chunk);

    let mut aggregator = StateAggregator::new(AggregatorConfig::default());
    let mut server = AuthoritativeWorld::new(walled, MovementConfig::default(), Vec3::ZERO);
    aggregator.add_user(1);
    server.add_player(1);

    // The client has not received the wall yet.
    let client_world = flat_world();
    let mut capture = InputCapture::starting_at(Sequence(10));
    let mut prediction = client(1);

    let blocked = capture.capture(forward());
    prediction.apply_local(blocked, &client_world);
    let sideways = capture.capture(InputSample {
        movement: MovementFlags::LEFT,
        ..Default::default()
    });
    prediction.apply_local(sideways, &client_world);
    assert_eq!(prediction.live().position, Vec3::new(1.0, 0.0, 1.0));

    aggregator.receive(1, blocked, now).unwrap();
    let ready = aggregator.poll_ready(now);
    let snapshot = over_the_wire(server.apply_bundle(&ready[0]));
    assert_eq!(
        snapshot.player(1).map(|p| p.position),
        Some(Vec3::ZERO)
    );

    match prediction.reconcile(&snapshot, &client_world) {
        Reconciliation::Corrected { error } => assert_eq!(error, Vec3::new(0.0, 0.0, -1.0)),
        other => panic!("expected a correction, got {other:?}"),
    }
    // The unconfirmed sideways step is replayed on top of the server state.
    assert_eq!(prediction.live().position, Vec3::new(1.0, 0.0, 0.0));
    assert_eq!(prediction.outbox_len(), 1);
    assert_eq!(prediction.stats().corrections, 1);
}

#[test]
fn test_late_joiner_starts_ahead_of_cursor() {
    let now = Instant::now();
    let mut aggregator = StateAggregator::new(AggregatorConfig::default());
    aggregator.add_user(1);

    let mut veteran = InputCapture::starting_at(Sequence(250));
    for _ in 0..4 {
        aggregator.receive(1, veteran.capture(forward()), now).unwrap();
    }
    aggregator.poll_ready(now);
    assert_eq!(aggregator.cursor(), Some(Sequence(254)));

    aggregator.add_user(2);
    let start = aggregator.join_sequence();
    assert!(start.is_newer_than(Sequence(253)));

    let mut joiner = InputCapture::starting_at(start);
    let first = joiner.capture(InputSample::default());
    assert!(aggregator.receive(2, first, now).is_ok());

    let stale = cubeworld::InputState {
        sequence: Sequence(252),
        ..Default::default()
    };
    assert_eq!(
        aggregator.receive(2, stale, now),
        Err(SyncError::StaleSequence {
            sequence: Sequence(252),
            cursor: Sequence(254),
        })
    );
}

#[test]
fn test_chunk_stream_is_idempotent() {
    let terrain = FlatTerrain::default();
    let positions = terrain.chunks_around(IVec3::ZERO, 1);
    let wire: Vec<Vec<u8>> = positions
        .iter()
        .map(|&p| encode(&mut terrain.generate(p)).unwrap())
        .collect();

    let mut cache = WorldCache::new();
    let mut fresh = 0;
    // Delivered twice, second pass in reverse.
    for bytes in wire.iter().chain(wire.iter().rev()) {
        let chunk: Chunk = decode(bytes).unwrap();
        if cache.insert(chunk) {
            fresh += 1;
        }
    }
    assert_eq!(fresh, positions.len());
    assert_eq!(cache.len(), positions.len());

    let grass = IVec3::new(5, -1, -7);
    assert_eq!(
        cubeworld::BlockSource::block_at(&cache, grass),
        BlockId::GRASS
    );
}
