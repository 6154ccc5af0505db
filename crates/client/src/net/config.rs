use std::time::Duration;

use cubeworld::MovementConfig;
use cubeworld::sync::DEFAULT_TOLERANCE;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Must match the server's tick so each input moves the same distance
    /// on both sides.
    pub tick_interval_ms: u64,
    pub reconcile_tolerance: f32,
    pub connect_timeout_ms: u64,
    pub welcome_timeout_ms: u64,
    pub connection_timeout_secs: u64,
    pub poll_timeout_ms: u64,
    pub packet_loss_percent: f32,
    pub movement: MovementConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: cubeworld::net::DEFAULT_TICK_INTERVAL_MS,
            reconcile_tolerance: DEFAULT_TOLERANCE,
            connect_timeout_ms: 5000,
            welcome_timeout_ms: 3000,
            connection_timeout_secs: 10,
            poll_timeout_ms: 5,
            packet_loss_percent: 0.0,
            movement: MovementConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn welcome_timeout(&self) -> Duration {
        Duration::from_millis(self.welcome_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn movement(&self) -> MovementConfig {
        MovementConfig {
            tick_interval_ms: self.tick_interval_ms,
            ..self.movement
        }
    }
}
