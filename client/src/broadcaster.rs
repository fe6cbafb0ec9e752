use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::address::address_for_time;
use crate::config::{FetchConfig, SyncConfig};
use crate::player::Player;
use crate::protocol::{ControlAction, Role};
use crate::sync::SyncClient;

/// A local playback edge the leader announces the moment it happens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeaderAction {
    Play,
    Pause,
    Seek(f64),
}

/// Periodically broadcast the local playback position, plus an immediate
/// message for every explicit edge.
///
/// The task runs for followers too but stays silent until the role watch
/// flips to leader, which makes promotions take effect on the next tick.
/// Send failures are ignored here; reconnection is handled elsewhere.
pub fn spawn(
    player: Arc<dyn Player>,
    sync: Arc<SyncClient>,
    role_rx: watch::Receiver<Role>,
    mut control_rx: mpsc::UnboundedReceiver<LeaderAction>,
    sync_config: SyncConfig,
    fetch_config: FetchConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync_config.broadcast_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *role_rx.borrow() != Role::Leader {
                        continue;
                    }
                    let timestamp = player.current_time();
                    let address = address_for_time(timestamp, &fetch_config);
                    let _ = sync.send_sync_update(
                        timestamp,
                        address.group,
                        address.object,
                        player.is_playing(),
                    );
                }
                action = control_rx.recv() => {
                    let Some(action) = action else { break };
                    if *role_rx.borrow() != Role::Leader {
                        continue;
                    }
                    let timestamp = player.current_time();
                    let (wire_action, seek_target) = match action {
                        LeaderAction::Play => (ControlAction::Play, None),
                        LeaderAction::Pause => (ControlAction::Pause, None),
                        LeaderAction::Seek(target) => (ControlAction::Seek, Some(target)),
                    };
                    // Addresses point at the position playback lands on.
                    let address = address_for_time(seek_target.unwrap_or(timestamp), &fetch_config);
                    let _ = sync.send_playback_control(
                        wire_action,
                        timestamp,
                        address.group,
                        address.object,
                        seek_target,
                    );
                }
            }
        }
    })
}
