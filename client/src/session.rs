use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::broadcaster::{self, LeaderAction};
use crate::config::{FetchConfig, SyncConfig};
use crate::corrector::{self, CorrectorHandle, LeaderReport};
use crate::events::{EventBus, Subscription};
use crate::fetch::{FetchError, FetchTransport};
use crate::player::{Player, PlayerError};
use crate::protocol::{
    ControlAction, ErrorCode, Message, PlaybackState, Role, RoomSummary, ServerConfig,
};
use crate::scheduler::{Scheduler, SchedulerNotice};
use crate::sync::{SyncClient, SyncError, SyncStatsSnapshot};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("join rejected by the server: {code:?} ({message})")]
    JoinRejected { code: ErrorCode, message: String },
    #[error("no reply to the join request in time")]
    JoinTimeout,
    #[error("no room has been joined yet")]
    NotJoined,
    #[error("streaming is already active")]
    AlreadyStreaming,
    #[error("media pipeline was not ready in time")]
    HandshakeTimeout,
    #[error("player failed: {0}")]
    Player(PlayerError),
    #[error("fetch failed: {0}")]
    Fetch(FetchError),
    #[error("append failed: {0}")]
    Append(PlayerError),
}

/// What to join, as what, and which media track to stream.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: String,
    pub user_name: String,
    pub track_name: String,
    pub role: Role,
}

/// The server's answer to a successful join.
#[derive(Debug, Clone)]
pub struct JoinGrant {
    pub room_id: String,
    pub user_id: Uuid,
    pub role: Role,
    pub media_name: String,
    pub playback: Option<PlaybackState>,
}

/// Notifications a session surfaces to its embedder.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Joined { room_id: String, role: Role },
    UserJoined { user_name: String, total_users: usize },
    UserLeft { user_name: String, total_users: usize },
    PromotedToLeader,
    LeaderChanged { leader_id: Uuid },
    RoomsListed { rooms: Vec<RoomSummary> },
    ConfigReceived(ServerConfig),
    ServerError { code: ErrorCode, message: String },
    Disconnected,
    Reconnected,
    StreamFailed { reason: String },
}

struct SessionInner {
    sync: Arc<SyncClient>,
    player: Arc<dyn Player>,
    sync_config: SyncConfig,
    fetch_config: FetchConfig,
    events: EventBus<SessionEvent>,
    corrector: CorrectorHandle,
    role_tx: watch::Sender<Role>,
    leader_pos_tx: watch::Sender<Option<f64>>,
    control_tx: Mutex<Option<mpsc::UnboundedSender<LeaderAction>>>,
    notice_tx: Mutex<Option<mpsc::UnboundedSender<SchedulerNotice>>>,
    active: Arc<AtomicBool>,
    closed: AtomicBool,
    pending_join: Mutex<Option<oneshot::Sender<Result<JoinGrant, (ErrorCode, String)>>>>,
    last_join: Mutex<Option<JoinRequest>>,
    track: Mutex<Option<String>>,
}

/// One member's view of a shared watch session.
///
/// Owns the socket, the drift corrector, the leader broadcaster and the
/// fetch scheduler, and routes server messages between them. Clones share
/// the same session.
#[derive(Clone)]
pub struct WatchSession {
    inner: Arc<SessionInner>,
}

impl WatchSession {
    /// Build an idle session around a player. Needs a Tokio runtime.
    pub fn new(player: Arc<dyn Player>, sync_config: SyncConfig, fetch_config: FetchConfig) -> Self {
        let corrector = corrector::spawn(Arc::clone(&player), &sync_config);
        let (role_tx, _) = watch::channel(Role::Follower);
        let (leader_pos_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner {
                sync: Arc::new(SyncClient::new()),
                player,
                sync_config,
                fetch_config,
                events: EventBus::new(),
                corrector,
                role_tx,
                leader_pos_tx,
                control_tx: Mutex::new(None),
                notice_tx: Mutex::new(None),
                active: Arc::new(AtomicBool::new(false)),
                closed: AtomicBool::new(false),
                pending_join: Mutex::new(None),
                last_join: Mutex::new(None),
                track: Mutex::new(None),
            }),
        }
    }

    /// Connect to the coordinator and keep the connection alive: after a
    /// drop, the session waits out the reconnect delay, dials again and
    /// replays its last join.
    pub async fn connect(&self, server_url: &str) -> Result<(), SyncError> {
        let disconnect_rx = self
            .inner
            .sync
            .connect(server_url, make_router(&self.inner))
            .await?;
        self.inner.sync.mark_connected(server_url);
        tokio::spawn(supervise_reconnect(
            Arc::clone(&self.inner),
            server_url.to_string(),
            disconnect_rx,
        ));
        Ok(())
    }

    /// Join a room and wait for the server's verdict.
    pub async fn join(&self, request: JoinRequest) -> Result<JoinGrant, SessionError> {
        let (tx, rx) = oneshot::channel();
        *self.inner.pending_join.lock() = Some(tx);
        *self.inner.track.lock() = Some(request.track_name.clone());
        *self.inner.last_join.lock() = Some(request.clone());
        if let Err(err) = send_join(&self.inner.sync, &request) {
            self.inner.pending_join.lock().take();
            return Err(err.into());
        }

        match timeout(self.inner.sync_config.request_timeout, rx).await {
            Ok(Ok(Ok(grant))) => Ok(grant),
            Ok(Ok(Err((code, message)))) => {
                // A rejected join must not be replayed on reconnect.
                self.inner.last_join.lock().take();
                Err(SessionError::JoinRejected { code, message })
            }
            // The resolver vanished, e.g. a newer join superseded this one.
            Ok(Err(_)) => Err(SessionError::JoinTimeout),
            Err(_) => {
                self.inner.pending_join.lock().take();
                Err(SessionError::JoinTimeout)
            }
        }
    }

    /// Spawn the fetch scheduler and the leader broadcaster.
    ///
    /// The returned handle resolves when streaming stops: with `Ok` after
    /// [`WatchSession::stop_streaming`], with the fatal error otherwise.
    pub fn start_streaming(
        &self,
        transport: Arc<dyn FetchTransport>,
    ) -> Result<JoinHandle<Result<(), SessionError>>, SessionError> {
        let Some(track) = self.inner.track.lock().clone() else {
            return Err(SessionError::NotJoined);
        };
        if self.inner.active.swap(true, Ordering::Relaxed) {
            return Err(SessionError::AlreadyStreaming);
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        *self.inner.control_tx.lock() = Some(control_tx);
        *self.inner.notice_tx.lock() = Some(notice_tx);

        broadcaster::spawn(
            Arc::clone(&self.inner.player),
            Arc::clone(&self.inner.sync),
            self.inner.role_tx.subscribe(),
            control_rx,
            self.inner.sync_config.clone(),
            self.inner.fetch_config.clone(),
        );

        let scheduler = Scheduler::new(
            Arc::clone(&self.inner.player),
            transport,
            self.inner.fetch_config.clone(),
            track,
            self.inner.role_tx.subscribe(),
            self.inner.leader_pos_tx.subscribe(),
            notice_rx,
            Arc::clone(&self.inner.active),
        );
        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move {
            let result = scheduler.run().await;
            inner.active.store(false, Ordering::Relaxed);
            if let Err(err) = &result {
                tracing::error!("Streaming ended: {err}");
                inner.events.emit(&SessionEvent::StreamFailed {
                    reason: err.to_string(),
                });
            }
            result
        }))
    }

    /// Wind down the scheduler and broadcaster without leaving the room.
    pub fn stop_streaming(&self) {
        self.inner.active.store(false, Ordering::Relaxed);
        *self.inner.control_tx.lock() = None;
        *self.inner.notice_tx.lock() = None;
    }

    /// Stop streaming and drop the reconnect supervision.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.stop_streaming();
    }

    pub async fn play(&self) -> Result<(), PlayerError> {
        self.inner.player.play().await?;
        self.send_action(LeaderAction::Play);
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), PlayerError> {
        self.inner.player.pause().await?;
        self.send_action(LeaderAction::Pause);
        Ok(())
    }

    /// Seek locally, prime the fetch window and, when leading, tell the room.
    pub async fn seek(&self, target: f64) -> Result<(), PlayerError> {
        self.inner.player.seek(target).await?;
        if let Some(notice_tx) = self.inner.notice_tx.lock().as_ref() {
            let _ = notice_tx.send(SchedulerNotice::SeekTo(target));
        }
        self.send_action(LeaderAction::Seek(target));
        Ok(())
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription<SessionEvent>
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn corrector(&self) -> &CorrectorHandle {
        &self.inner.corrector
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.inner.sync.stats_snapshot()
    }

    pub fn request_rooms(&self) -> Result<(), SyncError> {
        self.inner.sync.request_rooms()
    }

    pub fn request_config(&self) -> Result<(), SyncError> {
        self.inner.sync.request_config()
    }

    pub fn room_id(&self) -> Option<String> {
        self.inner.sync.room_id()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.inner.sync.user_id()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.sync.is_leader()
    }

    // The broadcaster drops these unless this member leads the room.
    fn send_action(&self, action: LeaderAction) {
        if let Some(control_tx) = self.inner.control_tx.lock().as_ref() {
            let _ = control_tx.send(action);
        }
    }
}

impl SessionInner {
    fn route(&self, message: Message) {
        match message {
            Message::RoomState {
                room_id,
                user_id,
                role,
                media_name,
                current_playback_state,
                ..
            } => {
                self.sync.set_room_joined(room_id.clone(), user_id, role);
                self.role_tx.send_replace(role);
                // Every granted join re-arms the scheduler's cursor jump.
                if let Some(notice_tx) = self.notice_tx.lock().as_ref() {
                    let _ = notice_tx.send(SchedulerNotice::Rejoined);
                }
                if let Some(playback) = current_playback_state {
                    self.leader_pos_tx.send_replace(Some(playback.timestamp));
                    if role == Role::Follower {
                        self.corrector.apply(LeaderReport::Position {
                            timestamp: playback.timestamp,
                            is_playing: playback.is_playing,
                        });
                    }
                }
                if let Some(resolver) = self.pending_join.lock().take() {
                    let _ = resolver.send(Ok(JoinGrant {
                        room_id: room_id.clone(),
                        user_id,
                        role,
                        media_name,
                        playback: current_playback_state,
                    }));
                }
                self.events.emit(&SessionEvent::Joined { room_id, role });
            }
            Message::SyncUpdate {
                timestamp,
                is_playing,
                ..
            } => {
                self.leader_pos_tx.send_replace(Some(timestamp));
                if self.is_follower() {
                    self.corrector.apply(LeaderReport::Position {
                        timestamp,
                        is_playing,
                    });
                }
            }
            Message::PlaybackControl {
                action,
                timestamp,
                seek_target,
                ..
            } => {
                let position = if action == ControlAction::Seek {
                    seek_target.unwrap_or(timestamp)
                } else {
                    timestamp
                };
                self.leader_pos_tx.send_replace(Some(position));
                if self.is_follower() {
                    self.corrector.apply(LeaderReport::Control {
                        action,
                        timestamp,
                        seek_target,
                    });
                    if action == ControlAction::Seek {
                        if let Some(notice_tx) = self.notice_tx.lock().as_ref() {
                            let _ = notice_tx.send(SchedulerNotice::SeekTo(position));
                        }
                    }
                }
            }
            Message::UserJoined {
                user_name,
                total_users,
                ..
            } => {
                self.events.emit(&SessionEvent::UserJoined {
                    user_name,
                    total_users,
                });
            }
            Message::UserLeft {
                user_name,
                total_users,
                new_leader_id,
                ..
            } => {
                if let Some(leader_id) = new_leader_id {
                    if self.sync.user_id() == Some(leader_id) {
                        self.sync.set_role(Role::Leader);
                        self.role_tx.send_replace(Role::Leader);
                        tracing::info!("Promoted to room leader");
                        self.events.emit(&SessionEvent::PromotedToLeader);
                    } else {
                        self.events.emit(&SessionEvent::LeaderChanged { leader_id });
                    }
                }
                self.events.emit(&SessionEvent::UserLeft {
                    user_name,
                    total_users,
                });
            }
            Message::RoomsList { rooms } => {
                self.events.emit(&SessionEvent::RoomsListed { rooms });
            }
            Message::Config { config } => {
                self.events.emit(&SessionEvent::ConfigReceived(config));
            }
            Message::Error { code, message } => {
                if let Some(resolver) = self.pending_join.lock().take() {
                    let _ = resolver.send(Err((code, message)));
                } else {
                    self.events.emit(&SessionEvent::ServerError { code, message });
                }
            }
            other => {
                tracing::debug!("Ignoring unexpected server message: {other:?}");
            }
        }
    }

    fn is_follower(&self) -> bool {
        *self.role_tx.borrow() == Role::Follower
    }
}

fn make_router(inner: &Arc<SessionInner>) -> impl Fn(Message) + Send + Sync + 'static {
    let inner = Arc::clone(inner);
    move |message| inner.route(message)
}

fn send_join(sync: &SyncClient, request: &JoinRequest) -> Result<(), SyncError> {
    match request.role {
        Role::Leader => {
            sync.join_as_leader(&request.room_id, &request.user_name, &request.track_name)
        }
        Role::Follower => {
            sync.join_as_follower(&request.room_id, &request.user_name, &request.track_name)
        }
    }
}

async fn supervise_reconnect(
    inner: Arc<SessionInner>,
    url: String,
    mut disconnect_rx: oneshot::Receiver<()>,
) {
    loop {
        let _ = (&mut disconnect_rx).await;
        if inner.closed.load(Ordering::Relaxed) {
            return;
        }
        inner.sync.mark_disconnected();
        inner.events.emit(&SessionEvent::Disconnected);
        tracing::warn!("Connection to {url} lost");

        loop {
            tokio::time::sleep(inner.sync_config.reconnect_delay).await;
            if inner.closed.load(Ordering::Relaxed) {
                return;
            }
            match inner.sync.connect(&url, make_router(&inner)).await {
                Ok(rx) => {
                    inner.sync.mark_connected(&url);
                    inner.events.emit(&SessionEvent::Reconnected);
                    tracing::info!("Reconnected to {url}");
                    let replay = inner.last_join.lock().clone();
                    if let Some(request) = replay {
                        if let Err(err) = send_join(&inner.sync, &request) {
                            tracing::warn!("Failed to replay the join request: {err}");
                        }
                    }
                    disconnect_rx = rx;
                    break;
                }
                Err(err) => {
                    tracing::warn!("Reconnect to {url} failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchRequest, ObjectStream};
    use crate::player::SimulatedPlayer;
    use async_trait::async_trait;
    use futures_util::stream;
    use futures_util::StreamExt;
    use std::time::Duration;

    struct NullTransport;

    #[async_trait]
    impl FetchTransport for NullTransport {
        async fn fetch(&self, _request: FetchRequest) -> Result<ObjectStream, FetchError> {
            Ok(stream::empty().boxed())
        }
    }

    fn test_session() -> (WatchSession, Arc<SimulatedPlayer>) {
        let player = Arc::new(SimulatedPlayer::new());
        let session = WatchSession::new(
            Arc::clone(&player) as Arc<dyn Player>,
            SyncConfig::default(),
            FetchConfig::default(),
        );
        (session, player)
    }

    fn room_state(role: Role, user_id: Uuid) -> Message {
        Message::RoomState {
            room_id: "movie-night".into(),
            user_id,
            role,
            leader_id: Some(user_id),
            leader_name: Some("Ada".into()),
            members: Vec::new(),
            total_users: 1,
            media_name: "Big Buck Bunny".into(),
            current_playback_state: None,
        }
    }

    fn leader_request() -> JoinRequest {
        JoinRequest {
            room_id: "movie-night".into(),
            user_name: "Ada".into(),
            track_name: "bbb/video".into(),
            role: Role::Leader,
        }
    }

    #[tokio::test]
    async fn join_resolves_once_the_room_state_arrives() {
        let (session, _player) = test_session();
        let (ws_tx, _ws_rx) = mpsc::unbounded_channel();
        session.inner.sync.attach_sender(ws_tx);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.join(leader_request()).await }
        });
        tokio::task::yield_now().await;

        let my_id = Uuid::new_v4();
        session.inner.route(room_state(Role::Leader, my_id));

        let grant = task.await.unwrap().unwrap();
        assert_eq!(grant.room_id, "movie-night");
        assert_eq!(grant.role, Role::Leader);
        assert_eq!(session.user_id(), Some(my_id));
        assert!(session.is_leader());
    }

    #[tokio::test]
    async fn rejected_joins_surface_the_server_code() {
        let (session, _player) = test_session();
        let (ws_tx, _ws_rx) = mpsc::unbounded_channel();
        session.inner.sync.attach_sender(ws_tx);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.join(leader_request()).await }
        });
        tokio::task::yield_now().await;

        session.inner.route(Message::Error {
            code: ErrorCode::MaxRoomsReached,
            message: "server is at its room limit".into(),
        });

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::JoinRejected {
                code: ErrorCode::MaxRoomsReached,
                ..
            })
        ));
        // A rejected join is not replayed after a reconnect.
        assert!(session.inner.last_join.lock().is_none());
    }

    #[tokio::test]
    async fn promotion_flips_the_role_and_raises_an_event() {
        let (session, _player) = test_session();
        let my_id = Uuid::new_v4();
        session.inner.route(room_state(Role::Follower, my_id));
        assert!(!session.is_leader());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = session.subscribe(move |event| sink.lock().push(event.clone()));

        session.inner.route(Message::UserLeft {
            user_id: Uuid::new_v4(),
            user_name: "Grace".into(),
            total_users: 1,
            new_leader_id: Some(my_id),
        });

        assert!(session.is_leader());
        assert_eq!(*session.inner.role_tx.borrow(), Role::Leader);
        assert!(seen
            .lock()
            .iter()
            .any(|event| matches!(event, SessionEvent::PromotedToLeader)));
    }

    #[tokio::test]
    async fn another_members_promotion_is_only_reported() {
        let (session, _player) = test_session();
        session.inner.route(room_state(Role::Follower, Uuid::new_v4()));

        let promoted = Uuid::new_v4();
        session.inner.route(Message::UserLeft {
            user_id: Uuid::new_v4(),
            user_name: "Grace".into(),
            total_users: 2,
            new_leader_id: Some(promoted),
        });

        assert!(!session.is_leader());
        assert_eq!(*session.inner.role_tx.borrow(), Role::Follower);
    }

    #[tokio::test]
    async fn leader_seeks_prime_the_follower_scheduler() {
        let (session, _player) = test_session();
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        *session.inner.notice_tx.lock() = Some(notice_tx);

        session.inner.route(room_state(Role::Follower, Uuid::new_v4()));
        assert!(matches!(
            notice_rx.try_recv(),
            Ok(SchedulerNotice::Rejoined)
        ));

        session.inner.route(Message::PlaybackControl {
            action: ControlAction::Seek,
            timestamp: 89.9,
            group_id: 90,
            object_id: 24,
            seek_target: Some(90.5),
        });

        assert!(matches!(
            notice_rx.try_recv(),
            Ok(SchedulerNotice::SeekTo(target)) if target == 90.5
        ));
        assert_eq!(*session.inner.leader_pos_tx.borrow(), Some(90.5));
    }

    #[tokio::test]
    async fn sync_updates_move_the_leader_position_watch() {
        let (session, _player) = test_session();
        session.inner.route(Message::SyncUpdate {
            timestamp: 42.0,
            group_id: 42,
            object_id: 0,
            is_playing: true,
        });
        assert_eq!(*session.inner.leader_pos_tx.borrow(), Some(42.0));
    }

    #[tokio::test]
    async fn streaming_requires_a_join_first() {
        let (session, _player) = test_session();
        let result = session.start_streaming(Arc::new(NullTransport));
        assert!(matches!(result, Err(SessionError::NotJoined)));
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_runs_and_stops_cleanly() {
        let (session, _player) = test_session();
        let (ws_tx, _ws_rx) = mpsc::unbounded_channel();
        session.inner.sync.attach_sender(ws_tx);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.join(leader_request()).await }
        });
        tokio::task::yield_now().await;
        session.inner.route(room_state(Role::Leader, Uuid::new_v4()));
        task.await.unwrap().unwrap();

        let handle = session.start_streaming(Arc::new(NullTransport)).unwrap();
        assert!(matches!(
            session.start_streaming(Arc::new(NullTransport)),
            Err(SessionError::AlreadyStreaming)
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        session.stop_streaming();
        assert!(handle.await.unwrap().is_ok());
    }
}
