use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent between client and server (must match server protocol)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    // Client -> Server
    JoinAsLeader {
        room_id: String,
        user_name: String,
        media_track_name: String,
    },
    JoinAsFollower {
        room_id: String,
        user_name: String,
        media_track_name: String,
    },
    GetRooms,
    GetConfig,

    // Leader -> Server -> other members
    SyncUpdate {
        timestamp: f64,
        group_id: u64,
        object_id: u64,
        is_playing: bool,
    },
    PlaybackControl {
        action: ControlAction,
        timestamp: f64,
        group_id: u64,
        object_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        seek_target: Option<f64>,
    },

    // Server -> Client
    RoomState {
        room_id: String,
        user_id: Uuid,
        role: Role,
        leader_id: Option<Uuid>,
        leader_name: Option<String>,
        members: Vec<MemberInfo>,
        total_users: usize,
        media_name: String,
        current_playback_state: Option<PlaybackState>,
    },
    UserJoined {
        user_id: Uuid,
        user_name: String,
        role: Role,
        total_users: usize,
    },
    UserLeft {
        user_id: Uuid,
        user_name: String,
        total_users: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_leader_id: Option<Uuid>,
    },
    RoomsList {
        rooms: Vec<RoomSummary>,
    },
    Config {
        config: ServerConfig,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Membership role within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

/// Playback actions a leader may relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Play,
    Pause,
    Seek,
}

/// Machine-readable rejection codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MaxRoomsReached,
    RoomFull,
    LeaderExists,
    NoLeader,
    ParseError,
    UnknownMessage,
}

/// Last playback position reported by a room's leader
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub timestamp: f64,
    pub group_id: u64,
    pub object_id: u64,
    pub is_playing: bool,
    /// Coordinator clock, epoch milliseconds
    pub last_update: u64,
}

/// Roster entry inside a room-state payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
}

/// One entry of a rooms-list payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub has_leader: bool,
    pub user_count: usize,
    pub video_name: String,
    pub leader_name: Option<String>,
}

/// Server limits and the media catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub max_room_count: usize,
    pub max_users_per_room: usize,
    pub video_catalog: Vec<VideoEntry>,
}

/// A video the server knows how to announce
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoEntry {
    pub id: String,
    pub display_name: String,
    pub track_name: String,
}
