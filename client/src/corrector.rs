use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::player::Player;
use crate::protocol::ControlAction;

/// One leader report, as routed off the socket.
#[derive(Debug, Clone, Copy)]
pub enum LeaderReport {
    /// Periodic position broadcast.
    Position { timestamp: f64, is_playing: bool },
    /// Explicit play, pause or seek edge.
    Control {
        action: ControlAction,
        timestamp: f64,
        seek_target: Option<f64>,
    },
}

#[derive(Debug)]
enum Command {
    Apply(LeaderReport),
    SetIndependent(bool),
    SetThreshold(f64),
}

#[derive(Default)]
struct Shared {
    delta: Option<f64>,
    threshold: f64,
    independent: bool,
    last_leader_position: Option<f64>,
}

/// Feeds leader reports to the correction task and exposes its state.
///
/// Reports and settings changes share one queue, so they take effect in
/// the order they arrive and the newest report always wins.
#[derive(Clone)]
pub struct CorrectorHandle {
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Mutex<Shared>>,
}

impl CorrectorHandle {
    pub fn apply(&self, report: LeaderReport) {
        let _ = self.tx.send(Command::Apply(report));
    }

    /// Detach from (or reattach to) the leader's playback.
    pub fn set_independent(&self, independent: bool) {
        let _ = self.tx.send(Command::SetIndependent(independent));
    }

    pub fn set_threshold(&self, threshold: f64) {
        let _ = self.tx.send(Command::SetThreshold(threshold));
    }

    /// Drift measured at the last leader report, in seconds.
    pub fn delta(&self) -> Option<f64> {
        self.shared.lock().delta
    }

    pub fn threshold(&self) -> f64 {
        self.shared.lock().threshold
    }

    pub fn is_independent(&self) -> bool {
        self.shared.lock().independent
    }
}

struct Corrector {
    player: Arc<dyn Player>,
    shared: Arc<Mutex<Shared>>,
    min_threshold: f64,
    max_threshold: f64,
}

/// Spawn the correction task. It winds down once every handle is dropped.
pub fn spawn(player: Arc<dyn Player>, config: &SyncConfig) -> CorrectorHandle {
    let shared = Arc::new(Mutex::new(Shared {
        threshold: config.delta_threshold,
        ..Shared::default()
    }));
    let corrector = Corrector {
        player,
        shared: Arc::clone(&shared),
        min_threshold: config.min_delta_threshold,
        max_threshold: config.max_delta_threshold,
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            corrector.dispatch(command).await;
        }
    });
    CorrectorHandle { tx, shared }
}

impl Corrector {
    async fn dispatch(&self, command: Command) {
        match command {
            Command::Apply(report) => self.handle(report).await,
            Command::SetThreshold(value) => {
                let clamped = value.clamp(self.min_threshold, self.max_threshold);
                self.shared.lock().threshold = clamped;
            }
            Command::SetIndependent(independent) => self.toggle_independent(independent).await,
        }
    }

    async fn handle(&self, report: LeaderReport) {
        let (leader_time, play_state, forced_seek) = match report {
            LeaderReport::Position {
                timestamp,
                is_playing,
            } => (timestamp, Some(is_playing), None),
            LeaderReport::Control {
                action,
                timestamp,
                seek_target,
            } => match action {
                ControlAction::Play => (timestamp, Some(true), None),
                ControlAction::Pause => (timestamp, Some(false), None),
                ControlAction::Seek => {
                    let target = seek_target.unwrap_or(timestamp);
                    (target, None, Some(target))
                }
            },
        };

        let local = self.player.current_time();
        let delta = (local - leader_time).abs();
        let threshold = {
            let mut shared = self.shared.lock();
            shared.delta = Some(delta);
            shared.last_leader_position = Some(leader_time);
            if shared.independent {
                return;
            }
            shared.threshold
        };

        if let Some(target) = forced_seek {
            if let Err(err) = self.player.seek(target).await {
                tracing::warn!("Seek to leader target {target:.2}s failed: {err}");
            }
        } else if delta > threshold {
            tracing::debug!(
                "Drift {delta:.2}s exceeds {threshold:.2}s, seeking to {leader_time:.2}s"
            );
            if let Err(err) = self.player.seek(leader_time).await {
                tracing::warn!("Drift correction seek failed: {err}");
            }
        }

        if let Some(playing) = play_state {
            let result = if playing && !self.player.is_playing() {
                self.player.play().await
            } else if !playing && self.player.is_playing() {
                self.player.pause().await
            } else {
                Ok(())
            };
            if let Err(err) = result {
                tracing::warn!("Play-state reconciliation failed: {err}");
            }
        }
    }

    async fn toggle_independent(&self, independent: bool) {
        let resume_target = {
            let mut shared = self.shared.lock();
            let was_independent = shared.independent;
            shared.independent = independent;
            if was_independent && !independent {
                shared.last_leader_position
            } else {
                None
            }
        };
        // Rejoining the leader starts from wherever the leader last was.
        if let Some(target) = resume_target {
            if let Err(err) = self.player.seek(target).await {
                tracing::warn!("Seek back to the leader position failed: {err}");
            }
        }
    }
}
