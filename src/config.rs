use std::thread::available_parallelism;
use std::time::Duration;

/// Channels that stay silent for longer than the heartbeat threshold are evicted, so
///  a threshold shorter than the slowest legitimate client keepalive would churn
///  perfectly healthy connections. Values below this floor are raised to it.
const HEARTBEAT_FLOOR_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Liveness threshold in seconds. Values below 30 are silently clamped to 30.
    ///  The liveness sweep runs every `heartbeat / 5` seconds (integer division),
    ///  so an expired channel may outlive the threshold by up to one fifth of it.
    pub heartbeat_secs: u64,

    /// Number of dispatcher workers handling inbound frames. Frame handling is
    ///  I/O-bound (it writes heartbeat replies), hence the generous default.
    pub receive_workers: usize,
}

impl ManagerConfig {
    pub fn new() -> ManagerConfig {
        ManagerConfig {
            heartbeat_secs: HEARTBEAT_FLOOR_SECS,
            receive_workers: 2 * available_parallelism().map(|n| n.get()).unwrap_or(4),
        }
    }

    pub(crate) fn effective(&self) -> EffectiveConfig {
        let heartbeat_secs = self.heartbeat_secs.max(HEARTBEAT_FLOOR_SECS);
        EffectiveConfig {
            heartbeat_secs,
            sweep_interval: Duration::from_secs(heartbeat_secs / 5),
            receive_workers: self.receive_workers.max(1),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EffectiveConfig {
    pub heartbeat_secs: u64,
    pub sweep_interval: Duration,
    pub receive_workers: usize,
}
