use std::time::Duration;

/// Default sync server endpoint for local development.
pub const DEFAULT_WS_URL: &str = "ws://localhost:3030/ws";

/// Tuning for the follower drift corrector and the leader broadcaster.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Drift (seconds) a follower tolerates before hard-seeking to the leader.
    pub delta_threshold: f64,
    /// Lower bound for runtime threshold adjustments.
    pub min_delta_threshold: f64,
    /// Upper bound for runtime threshold adjustments.
    pub max_delta_threshold: f64,
    /// Cadence of the leader's periodic sync-update broadcasts.
    pub broadcast_interval: Duration,
    /// Wait between reconnect attempts after the socket drops.
    pub reconnect_delay: Duration,
    /// How long a join request may wait for the server's reply.
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            delta_threshold: 0.5,
            min_delta_threshold: 0.1,
            max_delta_threshold: 5.0,
            broadcast_interval: Duration::from_millis(1000),
            reconnect_delay: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    /// Clamp a requested drift threshold into the supported range.
    pub fn clamp_threshold(&self, value: f64) -> f64 {
        value.clamp(self.min_delta_threshold, self.max_delta_threshold)
    }
}

/// Tuning for the fetch scheduler and buffer maintenance.
///
/// The address math assumes a fixed cadence: `groups_per_second` groups of
/// `objects_per_group` media objects each, so one object spans
/// `1 / (groups_per_second * objects_per_group)` seconds.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Media groups per second of playback.
    pub groups_per_second: f64,
    /// Media objects within each group.
    pub objects_per_group: u64,
    /// Seconds of media to keep fetched ahead of the playhead.
    pub fetch_ahead: f64,
    /// Seconds of already-played media to keep behind the playhead.
    pub back_buffer: f64,
    /// Total buffered seconds above which eviction kicks in.
    pub max_buffer: f64,
    /// Pause between scheduler iterations.
    pub tick_interval: Duration,
    /// Per-request deadline for a range fetch.
    pub fetch_timeout: Duration,
    /// How long to wait for the media pipeline to become ready.
    pub handshake_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            groups_per_second: 1.0,
            objects_per_group: 48,
            fetch_ahead: 5.0,
            back_buffer: 10.0,
            max_buffer: 30.0,
            tick_interval: Duration::from_millis(250),
            fetch_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_adjustments_stay_in_bounds() {
        let config = SyncConfig::default();
        assert_eq!(config.clamp_threshold(0.01), config.min_delta_threshold);
        assert_eq!(config.clamp_threshold(99.0), config.max_delta_threshold);
        assert_eq!(config.clamp_threshold(1.25), 1.25);
    }
}
