use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use cubeworld::{AggregatorConfig, MovementConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tick_interval_ms: u64,
    pub max_clients: usize,
    pub bundle_timeout_ms: u64,
    pub max_outstanding_bundles: usize,
    pub stale_window: u8,
    pub view_radius_chunks: i32,
    pub connection_timeout_secs: u64,
    pub poll_timeout_ms: u64,
    /// Outbound loss applied to every datagram, 0 disables.
    pub packet_loss_percent: f32,
    pub movement: MovementConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let aggregator = AggregatorConfig::default();
        Self {
            tick_interval_ms: cubeworld::net::DEFAULT_TICK_INTERVAL_MS,
            max_clients: cubeworld::MAX_PLAYERS,
            bundle_timeout_ms: aggregator.bundle_timeout.as_millis() as u64,
            max_outstanding_bundles: aggregator.max_outstanding,
            stale_window: aggregator.stale_window,
            view_radius_chunks: 2,
            connection_timeout_secs: 10,
            poll_timeout_ms: 5,
            packet_loss_percent: 0.0,
            movement: MovementConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        ron::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            bundle_timeout: Duration::from_millis(self.bundle_timeout_ms),
            max_outstanding: self.max_outstanding_bundles,
            stale_window: self.stale_window,
        }
    }

    /// Movement runs one step per input, so its tick must match the server's.
    pub fn movement(&self) -> MovementConfig {
        MovementConfig {
            tick_interval_ms: self.tick_interval_ms,
            ..self.movement
        }
    }
}
