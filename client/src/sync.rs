use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::protocol::{ControlAction, Message, Role};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to connect to server: {0}")]
    Connect(String),
    #[error("not connected to the server")]
    NotConnected,
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to queue message to socket")]
    ChannelClosed,
}

/// WebSocket control channel to the session coordinator.
///
/// Holds the member identity the server assigned and traffic statistics;
/// message handling happens in the callback given to [`SyncClient::connect`].
pub struct SyncClient {
    inner: Arc<SyncClientState>,
}

struct SyncClientState {
    tx: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    room_id: Mutex<Option<String>>,
    client_id: Mutex<Option<Uuid>>,
    is_leader: Mutex<bool>,
    stats: Mutex<SyncStats>,
}

#[derive(Default, Clone)]
struct SyncStats {
    bytes_out: u64,
    bytes_in: u64,
    messages_out: u64,
    messages_in: u64,
    last_message_at: Option<Instant>,
    last_ping_sent: Option<Instant>,
    last_ping_nonce: Option<u64>,
    last_rtt_ms: Option<f32>,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
    endpoint_label: Option<String>,
}

pub struct SyncStatsSnapshot {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub messages_out: u64,
    pub messages_in: u64,
    pub last_rtt_ms: Option<f32>,
    pub last_message_age: Option<f32>,
    pub connected_duration: Option<f32>,
    pub reconnect_attempts: u32,
    pub endpoint_label: Option<String>,
}

impl SyncClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SyncClientState {
                tx: Mutex::new(None),
                room_id: Mutex::new(None),
                client_id: Mutex::new(None),
                is_leader: Mutex::new(false),
                stats: Mutex::new(SyncStats::default()),
            }),
        }
    }

    /// Connect to the sync server. Returns a receiver that resolves when the socket closes.
    pub async fn connect<F>(
        &self,
        server_url: &str,
        on_message: F,
    ) -> Result<oneshot::Receiver<()>, SyncError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .map_err(|err| SyncError::Connect(err.to_string()))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.inner.tx.lock() = Some(tx.clone());

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            send_inner.clear_transport();
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        let handler = Arc::new(on_message);
        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        recv_inner.record_incoming(text.len() as u64);
                        if let Ok(parsed) = serde_json::from_str::<Message>(&text) {
                            handler(parsed);
                        }
                    }
                    Ok(WsMessage::Pong(payload)) => {
                        recv_inner.handle_ws_pong(&payload);
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
            recv_inner.clear_transport();
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Keep-alive pings
        let ping_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                sleep(KEEPALIVE_INTERVAL).await;
                if ping_inner.send_keepalive().is_err() {
                    break;
                }
            }
        });

        Ok(disconnect_rx)
    }

    pub fn mark_connected(&self, label: &str) {
        self.inner.mark_connected(label);
    }

    pub fn mark_disconnected(&self) {
        self.inner.mark_disconnected();
    }

    pub fn stats_snapshot(&self) -> SyncStatsSnapshot {
        self.inner.snapshot()
    }

    /// Claim the leader seat of a room, creating the room if needed.
    pub fn join_as_leader(
        &self,
        room_id: &str,
        user_name: &str,
        media_track_name: &str,
    ) -> Result<(), SyncError> {
        self.send(Message::JoinAsLeader {
            room_id: room_id.to_string(),
            user_name: user_name.to_string(),
            media_track_name: media_track_name.to_string(),
        })
    }

    /// Join an existing room as a follower.
    pub fn join_as_follower(
        &self,
        room_id: &str,
        user_name: &str,
        media_track_name: &str,
    ) -> Result<(), SyncError> {
        self.send(Message::JoinAsFollower {
            room_id: room_id.to_string(),
            user_name: user_name.to_string(),
            media_track_name: media_track_name.to_string(),
        })
    }

    /// Broadcast the leader's current playback position.
    pub fn send_sync_update(
        &self,
        timestamp: f64,
        group_id: u64,
        object_id: u64,
        is_playing: bool,
    ) -> Result<(), SyncError> {
        self.send(Message::SyncUpdate {
            timestamp,
            group_id,
            object_id,
            is_playing,
        })
    }

    /// Announce a play, pause or seek edge to the room.
    pub fn send_playback_control(
        &self,
        action: ControlAction,
        timestamp: f64,
        group_id: u64,
        object_id: u64,
        seek_target: Option<f64>,
    ) -> Result<(), SyncError> {
        self.send(Message::PlaybackControl {
            action,
            timestamp,
            group_id,
            object_id,
            seek_target,
        })
    }

    /// Ask for the current room listing.
    pub fn request_rooms(&self) -> Result<(), SyncError> {
        self.send(Message::GetRooms)
    }

    /// Ask for the server's published configuration.
    pub fn request_config(&self) -> Result<(), SyncError> {
        self.send(Message::GetConfig)
    }

    /// Record the identity the server assigned on a successful join.
    pub fn set_room_joined(&self, room_id: String, client_id: Uuid, role: Role) {
        *self.inner.room_id.lock() = Some(room_id);
        *self.inner.client_id.lock() = Some(client_id);
        *self.inner.is_leader.lock() = role == Role::Leader;
    }

    /// Record a role change, as after a promotion.
    pub fn set_role(&self, role: Role) {
        *self.inner.is_leader.lock() = role == Role::Leader;
    }

    pub fn clear_room(&self) {
        *self.inner.room_id.lock() = None;
        *self.inner.client_id.lock() = None;
        *self.inner.is_leader.lock() = false;
    }

    pub fn room_id(&self) -> Option<String> {
        self.inner.room_id.lock().clone()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        *self.inner.client_id.lock()
    }

    pub fn is_leader(&self) -> bool {
        *self.inner.is_leader.lock()
    }

    pub fn send(&self, msg: Message) -> Result<(), SyncError> {
        let json = serde_json::to_string(&msg)?;
        let Some(tx) = self.inner.tx.lock().clone() else {
            return Err(SyncError::NotConnected);
        };
        self.inner.record_outgoing(json.len() as u64);
        tx.send(WsMessage::Text(json.into()))
            .map_err(|_| SyncError::ChannelClosed)
    }
}

impl Default for SyncClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncClientState {
    fn record_outgoing(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_out += bytes;
        stats.messages_out += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn record_incoming(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_in += bytes;
        stats.messages_in += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn handle_ws_pong(&self, payload: &[u8]) {
        self.record_incoming(payload.len() as u64);
        if payload.len() < 8 {
            return;
        }
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&payload[..8]);
        let nonce = u64::from_le_bytes(nonce_bytes);
        self.record_pong(nonce);
    }

    fn record_pong(&self, nonce: u64) {
        let mut stats = self.stats.lock();
        if stats.last_ping_nonce == Some(nonce) {
            if let Some(sent) = stats.last_ping_sent {
                stats.last_rtt_ms = Some(sent.elapsed().as_secs_f32() * 1000.0);
            }
            stats.last_ping_nonce = None;
            stats.last_ping_sent = None;
        }
    }

    fn send_keepalive(&self) -> Result<(), ()> {
        let nonce = Uuid::new_v4().as_u128() as u64;
        {
            let mut stats = self.stats.lock();
            stats.last_ping_nonce = Some(nonce);
            stats.last_ping_sent = Some(Instant::now());
        }

        let mut payload = Vec::with_capacity(24);
        payload.extend_from_slice(&nonce.to_le_bytes());
        payload.extend_from_slice(&current_unix_millis().to_le_bytes());
        self.record_outgoing(payload.len() as u64);
        self.enqueue_ws(WsMessage::Ping(payload.into()))
    }

    fn clear_transport(&self) {
        *self.tx.lock() = None;
        let mut stats = self.stats.lock();
        stats.last_ping_nonce = None;
        stats.last_ping_sent = None;
    }

    fn enqueue_ws(&self, message: WsMessage) -> Result<(), ()> {
        if let Some(tx) = self.tx.lock().clone() {
            tx.send(message).map_err(|_| ())
        } else {
            Err(())
        }
    }

    fn mark_connected(&self, label: &str) {
        let mut stats = self.stats.lock();
        stats.connected_since = Some(Instant::now());
        stats.endpoint_label = Some(label.to_string());
    }

    fn mark_disconnected(&self) {
        let mut stats = self.stats.lock();
        stats.connected_since = None;
        stats.reconnect_attempts += 1;
    }

    fn snapshot(&self) -> SyncStatsSnapshot {
        let stats = self.stats.lock();
        let last_message_age = stats
            .last_message_at
            .map(|inst| inst.elapsed().as_secs_f32());
        let connected_duration = stats
            .connected_since
            .map(|inst| inst.elapsed().as_secs_f32());
        SyncStatsSnapshot {
            bytes_out: stats.bytes_out,
            bytes_in: stats.bytes_in,
            messages_out: stats.messages_out,
            messages_in: stats.messages_in,
            last_rtt_ms: stats.last_rtt_ms,
            last_message_age,
            connected_duration,
            reconnect_attempts: stats.reconnect_attempts,
            endpoint_label: stats.endpoint_label.clone(),
        }
    }
}

fn current_unix_millis() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
impl SyncClient {
    /// Wire a bare channel in place of a live socket.
    pub(crate) fn attach_sender(&self, tx: mpsc::UnboundedSender<WsMessage>) {
        *self.inner.tx.lock() = Some(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(frame: WsMessage) -> Message {
        match frame {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sending_without_a_transport_fails() {
        let client = SyncClient::new();
        assert!(matches!(
            client.request_rooms(),
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn helpers_build_the_expected_wire_messages() {
        let client = SyncClient::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.attach_sender(tx);

        client
            .join_as_leader("movie-night", "Ada", "bbb/video")
            .unwrap();
        client.send_sync_update(12.5, 12, 24, true).unwrap();
        client
            .send_playback_control(ControlAction::Seek, 3.0, 90, 0, Some(90.5))
            .unwrap();

        assert!(matches!(
            decode(rx.try_recv().unwrap()),
            Message::JoinAsLeader { room_id, .. } if room_id == "movie-night"
        ));
        assert!(matches!(
            decode(rx.try_recv().unwrap()),
            Message::SyncUpdate { group_id: 12, object_id: 24, .. }
        ));
        assert!(matches!(
            decode(rx.try_recv().unwrap()),
            Message::PlaybackControl { seek_target: Some(target), .. } if target == 90.5
        ));

        let snapshot = client.stats_snapshot();
        assert_eq!(snapshot.messages_out, 3);
        assert!(snapshot.bytes_out > 0);
    }

    #[tokio::test]
    async fn pongs_echoing_the_ping_nonce_record_a_round_trip() {
        let client = SyncClient::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.attach_sender(tx);

        client.inner.send_keepalive().unwrap();
        let payload = match rx.try_recv().unwrap() {
            WsMessage::Ping(payload) => payload,
            other => panic!("expected a ping frame, got {other:?}"),
        };
        client.inner.handle_ws_pong(&payload);

        assert!(client.stats_snapshot().last_rtt_ms.is_some());
    }

    #[test]
    fn join_state_tracks_the_assigned_identity() {
        let client = SyncClient::new();
        let id = Uuid::new_v4();
        client.set_room_joined("movie-night".into(), id, Role::Leader);
        assert_eq!(client.room_id().as_deref(), Some("movie-night"));
        assert_eq!(client.user_id(), Some(id));
        assert!(client.is_leader());

        client.set_role(Role::Follower);
        assert!(!client.is_leader());

        client.clear_room();
        assert!(client.room_id().is_none());
    }
}
