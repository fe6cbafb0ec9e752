//! Engine for synchronized watch parties: keeps every member of a room
//! aligned to one leader's playhead while each fetches the shared media
//! track in addressed groups over HTTP.

pub mod address;
pub mod broadcaster;
pub mod buffer;
pub mod config;
pub mod corrector;
pub mod events;
pub mod fetch;
pub mod player;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod sync;

pub use config::{FetchConfig, SyncConfig, DEFAULT_WS_URL};
pub use fetch::{FetchTransport, HttpFetchTransport};
pub use player::{Player, SimulatedPlayer};
pub use session::{JoinRequest, SessionEvent, WatchSession};
pub use sync::SyncClient;
