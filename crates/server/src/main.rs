mod config;
mod events;
mod server;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use config::ServerConfig;
use server::GameServer;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "cubeworld-server")]
#[command(about = "Authoritative cubeworld server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = cubeworld::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, help = "RON file with server settings")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Milliseconds per tick")]
    tick_interval: Option<u64>,

    #[arg(short, long)]
    max_clients: Option<usize>,

    #[arg(long, help = "Chunks streamed around spawn")]
    view_radius: Option<i32>,

    #[arg(long, help = "Outbound packet loss percentage (0-100)")]
    loss_percent: Option<f32>,

    #[arg(long, help = "Stop after this many seconds")]
    run_for: Option<u64>,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(tick) = self.tick_interval {
            config.tick_interval_ms = tick;
        }
        if let Some(max) = self.max_clients {
            config.max_clients = max;
        }
        if let Some(radius) = self.view_radius {
            config.view_radius_chunks = radius;
        }
        if let Some(loss) = self.loss_percent {
            config.packet_loss_percent = loss.clamp(0.0, 100.0);
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.server_config()?;
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let mut server = GameServer::start(&bind_addr, config)
        .with_context(|| format!("binding {bind_addr}"))?;
    log::info!("server started on {}", server.local_addr());

    let running = server.running();
    let deadline = args.run_for.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut last_stats = Instant::now();

    while running.load(Ordering::SeqCst) {
        for event in server.drain_events() {
            event.log();
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            let stats = server.stats();
            log::info!(
                "{}/{} users {:?}, {} bundles applied, {} sent / {} received, {} resends",
                stats.user_count,
                stats.max_clients,
                server.registry().ids(),
                stats.bundles_applied,
                stats.network_stats.packets_sent,
                stats.network_stats.packets_received,
                stats.network_stats.reliable_resends
            );
            last_stats = Instant::now();
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    log::info!("server shutting down");
    server.shutdown();
    Ok(())
}
