use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::{
    ControlAction, ErrorCode, MemberInfo, Message, PlaybackState, Role, RoomSummary, ServerConfig,
};

const LOG_TAG: &str = "[Matinee Server]";

pub type ClientSender = mpsc::UnboundedSender<Message>;

/// Per-socket registration; `room_id` is set while the socket is a room member
struct Connection {
    sender: ClientSender,
    room_id: Option<String>,
}

/// One participant of a room
struct Member {
    name: String,
    role: Role,
    sender: ClientSender,
}

/// Room state behind a single lock, so joins, leaves and relays for the
/// same room never interleave
struct Room {
    id: String,
    leader_id: Option<Uuid>,
    members: HashMap<Uuid, Member>,
    media_name: String,
    playback: Option<PlaybackState>,
    /// Set when the emptied room is removed from the map, so a join that
    /// raced the removal knows to start over
    closed: bool,
}

impl Room {
    fn new(id: &str, media_name: &str) -> Self {
        Self {
            id: id.to_string(),
            leader_id: None,
            members: HashMap::new(),
            media_name: media_name.to_string(),
            playback: None,
            closed: false,
        }
    }

    fn leader_name(&self) -> Option<String> {
        self.leader_id
            .and_then(|id| self.members.get(&id))
            .map(|member| member.name.clone())
    }

    /// Full room snapshot as seen by one member
    fn state_for(&self, viewer: Uuid) -> Message {
        let role = self
            .members
            .get(&viewer)
            .map(|member| member.role)
            .unwrap_or(Role::Follower);
        Message::RoomState {
            room_id: self.id.clone(),
            user_id: viewer,
            role,
            leader_id: self.leader_id,
            leader_name: self.leader_name(),
            members: self
                .members
                .iter()
                .map(|(id, member)| MemberInfo {
                    id: *id,
                    name: member.name.clone(),
                    role: member.role,
                })
                .collect(),
            total_users: self.members.len(),
            media_name: self.media_name.clone(),
            current_playback_state: self.playback,
        }
    }

    fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            has_leader: self.leader_id.is_some(),
            user_count: self.members.len(),
            video_name: self.media_name.clone(),
            leader_name: self.leader_name(),
        }
    }

    fn senders_except(&self, excluded: Uuid) -> Vec<ClientSender> {
        self.members
            .iter()
            .filter(|(id, _)| **id != excluded)
            .map(|(_, member)| member.sender.clone())
            .collect()
    }
}

/// Everything a successful join produces: a snapshot for the joiner and a
/// notice for everyone already in the room
#[derive(Debug)]
pub struct JoinOutcome {
    pub state: Message,
    pub notice: Message,
    pub notify: Vec<ClientSender>,
}

/// Fan-out material for a departure, including fresh snapshots when the
/// departure promoted a new leader
pub struct LeaveOutcome {
    pub room_id: String,
    pub user_name: String,
    pub destroyed: bool,
    pub notice: Option<Message>,
    pub notify: Vec<ClientSender>,
    pub refreshed: Vec<(Uuid, Message)>,
}

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    config: Arc<ServerConfig>,
    /// All active rooms: room_id -> Room
    rooms: Arc<DashMap<String, Arc<RwLock<Room>>>>,
    /// All connected sockets: connection id -> Connection
    connections: Arc<DashMap<Uuid, Connection>>,
    /// Serializes room creation so the room cap holds under concurrent joins
    create_lock: Arc<Mutex<()>>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            rooms: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn add_connection(&self, conn_id: Uuid, sender: ClientSender) {
        self.connections.insert(
            conn_id,
            Connection {
                sender,
                room_id: None,
            },
        );
        tracing::info!("{LOG_TAG} Client {} connected", conn_id);
    }

    /// Drop the socket registration and leave whatever room it was in.
    pub async fn remove_connection(&self, conn_id: Uuid) -> Option<LeaveOutcome> {
        let (_, connection) = self.connections.remove(&conn_id)?;
        tracing::info!("{LOG_TAG} Client {} disconnected", conn_id);
        let room_id = connection.room_id?;
        self.depart_room(conn_id, &room_id).await
    }

    pub fn membership(&self, conn_id: Uuid) -> Option<String> {
        self.connections.get(&conn_id)?.room_id.clone()
    }

    pub fn send_to(&self, conn_id: Uuid, message: Message) {
        if let Some(connection) = self.connections.get(&conn_id) {
            let _ = connection.sender.send(message);
        }
    }

    /// Deliver a message to every socket that is not currently in a room.
    pub fn broadcast_lobby(&self, message: Message) {
        for connection in self.connections.iter() {
            if connection.room_id.is_none() {
                let _ = connection.sender.send(message.clone());
            }
        }
    }

    pub async fn join_room(
        &self,
        conn_id: Uuid,
        sender: ClientSender,
        room_id: &str,
        role: Role,
        user_name: &str,
        track_name: &str,
    ) -> Result<JoinOutcome, ErrorCode> {
        let name = sanitize_display_name(user_name).unwrap_or_else(|| default_display_name(conn_id));

        loop {
            let existing = self.rooms.get(room_id).map(|entry| Arc::clone(entry.value()));
            let room_lock = match existing {
                Some(lock) => lock,
                None => {
                    if role == Role::Follower {
                        return Err(ErrorCode::NoLeader);
                    }
                    let _create = self.create_lock.lock().await;
                    if !self.has_capacity_for(room_id) {
                        return Err(ErrorCode::MaxRoomsReached);
                    }
                    Arc::clone(
                        self.rooms
                            .entry(room_id.to_string())
                            .or_insert_with(|| Arc::new(RwLock::new(Room::new(room_id, track_name))))
                            .value(),
                    )
                }
            };

            let mut room = room_lock.write().await;
            if room.closed {
                continue;
            }

            if room.members.len() >= self.config.max_users_per_room {
                return Err(ErrorCode::RoomFull);
            }
            match role {
                Role::Leader if room.leader_id.is_some() => return Err(ErrorCode::LeaderExists),
                Role::Follower if room.leader_id.is_none() => return Err(ErrorCode::NoLeader),
                _ => {}
            }

            room.members.insert(
                conn_id,
                Member {
                    name: name.clone(),
                    role,
                    sender,
                },
            );
            if role == Role::Leader {
                room.leader_id = Some(conn_id);
                room.media_name = track_name.to_string();
            }
            if let Some(mut connection) = self.connections.get_mut(&conn_id) {
                connection.room_id = Some(room_id.to_string());
            }

            tracing::info!(
                "{LOG_TAG} {} ({}) joined room {} as {:?}",
                name,
                conn_id,
                room_id,
                role
            );

            let notice = Message::UserJoined {
                user_id: conn_id,
                user_name: name.clone(),
                role,
                total_users: room.members.len(),
            };
            let notify = room.senders_except(conn_id);
            return Ok(JoinOutcome {
                state: room.state_for(conn_id),
                notice,
                notify,
            });
        }
    }

    pub async fn leave_room(&self, conn_id: Uuid) -> Option<LeaveOutcome> {
        let room_id = self.connections.get_mut(&conn_id)?.room_id.take()?;
        self.depart_room(conn_id, &room_id).await
    }

    async fn depart_room(&self, conn_id: Uuid, room_id: &str) -> Option<LeaveOutcome> {
        let room_lock = Arc::clone(self.rooms.get(room_id)?.value());
        let mut room = room_lock.write().await;
        let member = room.members.remove(&conn_id)?;
        let was_leader = room.leader_id == Some(conn_id);
        if was_leader {
            room.leader_id = None;
        }

        if room.members.is_empty() {
            room.closed = true;
            self.rooms.remove(room_id);
            tracing::info!("{LOG_TAG} Room {} destroyed (empty)", room_id);
            return Some(LeaveOutcome {
                room_id: room_id.to_string(),
                user_name: member.name,
                destroyed: true,
                notice: None,
                notify: Vec::new(),
                refreshed: Vec::new(),
            });
        }

        let mut new_leader_id = None;
        if was_leader {
            let followers: Vec<Uuid> = room
                .members
                .iter()
                .filter(|(_, member)| member.role == Role::Follower)
                .map(|(id, _)| *id)
                .collect();
            if let Some(id) = followers.choose(&mut rand::thread_rng()).copied() {
                room.leader_id = Some(id);
                if let Some(promoted) = room.members.get_mut(&id) {
                    promoted.role = Role::Leader;
                }
                new_leader_id = Some(id);
                tracing::info!("{LOG_TAG} Room {} promoted {} to leader", room_id, id);
            }
        }

        tracing::info!("{LOG_TAG} {} left room {}", member.name, room_id);

        let notice = Message::UserLeft {
            user_id: conn_id,
            user_name: member.name.clone(),
            total_users: room.members.len(),
            new_leader_id,
        };
        let notify = room.senders_except(conn_id);
        let refreshed = if new_leader_id.is_some() {
            room.members
                .keys()
                .map(|&id| (id, room.state_for(id)))
                .collect()
        } else {
            Vec::new()
        };

        Some(LeaveOutcome {
            room_id: room_id.to_string(),
            user_name: member.name,
            destroyed: false,
            notice: Some(notice),
            notify,
            refreshed,
        })
    }

    /// Record the leader's position report and hand back the members to relay
    /// it to. Reports from anyone but the current leader are dropped.
    pub async fn relay_sync_update(
        &self,
        conn_id: Uuid,
        timestamp: f64,
        group_id: u64,
        object_id: u64,
        is_playing: bool,
    ) -> Option<Vec<ClientSender>> {
        let (room_id, room_lock) = self.member_room(conn_id)?;
        let mut room = room_lock.write().await;
        if room.leader_id != Some(conn_id) {
            tracing::warn!(
                "{LOG_TAG} Dropping sync-update from non-leader {} in room {}",
                conn_id,
                room_id
            );
            return None;
        }
        room.playback = Some(PlaybackState {
            timestamp,
            group_id,
            object_id,
            is_playing,
            last_update: now_epoch_ms(),
        });
        Some(room.senders_except(conn_id))
    }

    /// Same gate as [`relay_sync_update`], with the playback state derived
    /// from the action: play and pause toggle the flag, a seek moves the
    /// position to its target and keeps the flag as it was.
    pub async fn relay_playback_control(
        &self,
        conn_id: Uuid,
        action: ControlAction,
        timestamp: f64,
        group_id: u64,
        object_id: u64,
        seek_target: Option<f64>,
    ) -> Option<Vec<ClientSender>> {
        let (room_id, room_lock) = self.member_room(conn_id)?;
        let mut room = room_lock.write().await;
        if room.leader_id != Some(conn_id) {
            tracing::warn!(
                "{LOG_TAG} Dropping playback-control from non-leader {} in room {}",
                conn_id,
                room_id
            );
            return None;
        }
        let was_playing = room.playback.map(|state| state.is_playing).unwrap_or(false);
        let is_playing = match action {
            ControlAction::Play => true,
            ControlAction::Pause => false,
            ControlAction::Seek => was_playing,
        };
        let position = match action {
            ControlAction::Seek => seek_target.unwrap_or(timestamp),
            _ => timestamp,
        };
        room.playback = Some(PlaybackState {
            timestamp: position,
            group_id,
            object_id,
            is_playing,
            last_update: now_epoch_ms(),
        });
        Some(room.senders_except(conn_id))
    }

    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        let locks: Vec<Arc<RwLock<Room>>> = self
            .rooms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut rooms = Vec::with_capacity(locks.len());
        for lock in locks {
            let room = lock.read().await;
            if !room.closed {
                rooms.push(room.summary());
            }
        }
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        rooms
    }

    fn member_room(&self, conn_id: Uuid) -> Option<(String, Arc<RwLock<Room>>)> {
        let room_id = self.connections.get(&conn_id)?.room_id.clone()?;
        let lock = Arc::clone(self.rooms.get(&room_id)?.value());
        Some((room_id, lock))
    }

    /// The room cap gates creation only. A join that raced a concurrent
    /// creation of the same id falls through to that room's own verdicts.
    fn has_capacity_for(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id) || self.rooms.len() < self.config.max_room_count
    }
}

#[cfg(test)]
impl ServerState {
    async fn playback_of(&self, room_id: &str) -> Option<PlaybackState> {
        let lock = Arc::clone(self.rooms.get(room_id)?.value());
        let room = lock.read().await;
        room.playback
    }
}

fn sanitize_display_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut cleaned = String::with_capacity(trimmed.len().min(32));
    for ch in trimmed.chars() {
        if ch.is_control() {
            continue;
        }
        if cleaned.len() >= 32 {
            break;
        }
        cleaned.push(ch);
    }
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn default_display_name(conn_id: Uuid) -> String {
    let short = &conn_id.to_string()[..8];
    format!("Guest {short}")
}

pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}
