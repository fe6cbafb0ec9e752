use std::{env, fs, path::Path};

use crate::protocol::{ServerConfig, VideoEntry};

const LOG_TAG: &str = "[Matinee Server]";

pub const DEFAULT_PORT: u16 = 3030;
const DEFAULT_MAX_ROOMS: usize = 50;
const DEFAULT_USERS_PER_ROOM: usize = 12;
const MIN_USERS_PER_ROOM: usize = 2;
const MAX_USERS_PER_ROOM: usize = 64;

/// Resolve the listen port from `PORT`, falling back to the default.
pub fn port() -> u16 {
    env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

/// Load server limits and the video catalog.
///
/// `MATINEE_CONFIG` may point at a JSON file shaped like the `config`
/// message payload; an unreadable file falls back to the defaults.
pub fn load() -> ServerConfig {
    let config = match env::var("MATINEE_CONFIG") {
        Ok(path) => match read_config_file(Path::new(&path)) {
            Ok(config) => {
                tracing::info!("{LOG_TAG} Loaded config from {}", path);
                config
            }
            Err(err) => {
                tracing::warn!("{LOG_TAG} Ignoring config at {}: {}", path, err);
                default_config()
            }
        },
        Err(_) => default_config(),
    };
    normalize(config)
}

fn read_config_file(path: &Path) -> anyhow::Result<ServerConfig> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn normalize(mut config: ServerConfig) -> ServerConfig {
    config.max_room_count = config.max_room_count.max(1);
    config.max_users_per_room = config
        .max_users_per_room
        .clamp(MIN_USERS_PER_ROOM, MAX_USERS_PER_ROOM);
    config
}

pub fn default_config() -> ServerConfig {
    ServerConfig {
        max_room_count: DEFAULT_MAX_ROOMS,
        max_users_per_room: DEFAULT_USERS_PER_ROOM,
        video_catalog: vec![
            VideoEntry {
                id: "bbb".into(),
                display_name: "Big Buck Bunny".into(),
                track_name: "bbb/video".into(),
            },
            VideoEntry {
                id: "tos".into(),
                display_name: "Tears of Steel".into(),
                track_name: "tos/video".into(),
            },
        ],
    }
}
