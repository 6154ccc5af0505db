mod net;

use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use net::{ClientConfig, NetworkClient, ScriptedInput, WalkPattern};

#[derive(Parser)]
#[command(name = "cubeworld-client")]
#[command(about = "Headless cubeworld client driven by a scripted walk")]
struct Args {
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:27015",
        help = "Server address to connect to"
    )]
    server: String,

    #[arg(long, value_enum, default_value_t = WalkPattern::Square)]
    pattern: WalkPattern,

    #[arg(long)]
    sprint: bool,

    #[arg(short, long, default_value_t = 30, help = "Seconds to stay connected")]
    duration: u64,

    #[arg(long, help = "Chat line to send after joining")]
    say: Option<String>,

    #[arg(long, help = "Milliseconds per tick, must match the server")]
    tick_interval: Option<u64>,

    #[arg(long, default_value_t = 0.0, help = "Outbound packet loss percentage (0-100)")]
    loss_percent: f32,
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("resolving {addr}"))?
        .next()
        .with_context(|| format!("{addr} resolved to nothing"))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server_addr = resolve(&args.server)?;

    let mut config = ClientConfig {
        packet_loss_percent: args.loss_percent.clamp(0.0, 100.0),
        ..Default::default()
    };
    if let Some(tick) = args.tick_interval {
        config.tick_interval_ms = tick;
    }

    let input = ScriptedInput::new(args.pattern)
        .sprinting(args.sprint)
        .into_source();
    let mut client = NetworkClient::connect(config, server_addr, input)?;
    log::info!("connected to {} as user {}", client.server_addr(), client.user_id());

    if let Some(text) = &args.say {
        client.send_chat(text)?;
    }

    let chat = client.chat();
    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut last_report = Instant::now();
    while client.is_running() && Instant::now() < deadline {
        while let Some(line) = chat.try_pop() {
            log::info!("<{}> {}", line.user_id, line.text);
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let live = client.live();
            let world = client.world();
            log::info!(
                "at {:.2} (confirmed {:?}), {} chunks, {} other players",
                live.position,
                client.last_confirmed(),
                world.read().len(),
                client.remote_players().len()
            );
            last_report = Instant::now();
        }
        thread::sleep(Duration::from_millis(20));
    }

    if let Some(reason) = client.disconnect_reason() {
        log::warn!("server connection {}", reason.as_str());
    }
    let prediction = client.prediction_stats();
    let network = client.network_stats();
    client.shutdown();

    log::info!(
        "{} inputs, {} reconciliations, {} corrections, {} stale; {} sent, {} received, {} resends",
        prediction.inputs_applied,
        prediction.reconciliations,
        prediction.corrections,
        prediction.stale_snapshots,
        network.packets_sent,
        network.packets_received,
        network.reliable_resends
    );
    Ok(())
}
