use anyhow::Result;
use std::sync::Arc;
use tokio::time::Duration;
use url::Url;

use matinee_client::config::{FetchConfig, SyncConfig, DEFAULT_WS_URL};
use matinee_client::fetch::HttpFetchTransport;
use matinee_client::player::{Player, SimulatedPlayer};
use matinee_client::protocol::Role;
use matinee_client::session::{JoinRequest, SessionEvent, WatchSession};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "matinee_client=debug,info".into()),
        )
        .init();

    let options = match CliOptions::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    };
    if options.help {
        print_usage();
        return Ok(());
    }

    let player = Arc::new(SimulatedPlayer::new());
    let session = WatchSession::new(
        Arc::clone(&player) as Arc<dyn Player>,
        SyncConfig::default(),
        FetchConfig::default(),
    );
    let _events = session.subscribe(log_event);

    session.connect(&options.server).await?;
    tracing::info!("Connected to {}", options.server);

    if options.list_rooms {
        session.request_rooms()?;
        // The listing arrives as an event; give it a moment to print.
        tokio::time::sleep(Duration::from_millis(500)).await;
        return Ok(());
    }

    let role = if options.leader {
        Role::Leader
    } else {
        Role::Follower
    };
    let grant = session
        .join(JoinRequest {
            room_id: options.room.clone(),
            user_name: options.name.clone(),
            track_name: options.track.clone(),
            role,
        })
        .await?;
    tracing::info!(
        "Joined {} as {:?}, watching {}",
        grant.room_id,
        grant.role,
        grant.media_name
    );

    let fetch_base = match &options.fetch_base {
        Some(base) => Url::parse(base)?,
        None => media_base_from_ws(&options.server)?,
    };
    tracing::info!("Fetching media from {fetch_base}");
    let transport = Arc::new(HttpFetchTransport::new(fetch_base));
    let mut streaming = session.start_streaming(transport)?;

    let drift_session = session.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            if drift_session.is_leader() {
                continue;
            }
            if let Some(delta) = drift_session.corrector().delta() {
                tracing::info!("Drift from leader: {delta:.2}s");
            }
        }
    });

    if options.leader {
        session.play().await?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
        result = &mut streaming => {
            if let Ok(Err(err)) = result {
                tracing::error!("Streaming stopped: {err}");
            }
        }
    }

    session.shutdown();
    let stats = session.stats();
    tracing::info!(
        "Session totals: {} messages out / {} in, {} bytes out / {} in, {} reconnects",
        stats.messages_out,
        stats.messages_in,
        stats.bytes_out,
        stats.bytes_in,
        stats.reconnect_attempts
    );
    Ok(())
}

struct CliOptions {
    server: String,
    room: String,
    name: String,
    track: String,
    leader: bool,
    fetch_base: Option<String>,
    list_rooms: bool,
    help: bool,
}

impl CliOptions {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut options = CliOptions {
            server: DEFAULT_WS_URL.to_string(),
            room: "movie-night".to_string(),
            name: String::new(),
            track: "bbb/video".to_string(),
            leader: false,
            fetch_base: None,
            list_rooms: false,
            help: false,
        };
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--server" => options.server = expect_value(&mut args, "--server")?,
                "--room" => options.room = expect_value(&mut args, "--room")?,
                "--name" => options.name = expect_value(&mut args, "--name")?,
                "--track" => options.track = expect_value(&mut args, "--track")?,
                "--fetch-base" => {
                    options.fetch_base = Some(expect_value(&mut args, "--fetch-base")?)
                }
                "--leader" => options.leader = true,
                "--list-rooms" => options.list_rooms = true,
                "--help" | "-h" => options.help = true,
                other => return Err(format!("unknown argument: {other}")),
            }
        }
        Ok(options)
    }
}

fn expect_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} needs a value"))
}

fn print_usage() {
    eprintln!("Matinee watch-party client");
    eprintln!();
    eprintln!("Usage: matinee-client [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --server <url>      Sync server endpoint (default {DEFAULT_WS_URL})");
    eprintln!("  --room <id>         Room to join (default movie-night)");
    eprintln!("  --name <name>       Display name (the server picks a guest name if empty)");
    eprintln!("  --track <track>     Media track to stream (default bbb/video)");
    eprintln!("  --fetch-base <url>  Media relay base URL (default derived from --server)");
    eprintln!("  --leader            Join as the room leader");
    eprintln!("  --list-rooms        Print the open rooms and exit");
    eprintln!("  -h, --help          Show this help");
}

/// Derive the media relay base from the WebSocket endpoint, both served
/// from the same host by default.
fn media_base_from_ws(ws_url: &str) -> Result<Url> {
    let parsed = Url::parse(ws_url)?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => anyhow::bail!("unsupported WebSocket scheme: {other}"),
    };

    let mut http = parsed;
    http.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("could not derive a fetch URL from {ws_url}"))?;
    http.set_path("/");
    http.set_query(None);
    http.set_fragment(None);
    Ok(http)
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Joined { room_id, role } => {
            tracing::info!("Joined room {room_id} as {role:?}");
        }
        SessionEvent::UserJoined {
            user_name,
            total_users,
        } => {
            tracing::info!("{user_name} joined ({total_users} watching)");
        }
        SessionEvent::UserLeft {
            user_name,
            total_users,
        } => {
            tracing::info!("{user_name} left ({total_users} watching)");
        }
        SessionEvent::PromotedToLeader => {
            tracing::info!("This client now leads the room");
        }
        SessionEvent::LeaderChanged { leader_id } => {
            tracing::info!("Leadership moved to {leader_id}");
        }
        SessionEvent::RoomsListed { rooms } => {
            if rooms.is_empty() {
                tracing::info!("No open rooms");
            }
            for room in rooms {
                tracing::info!(
                    "Room {} [{} watching] {} (leader: {})",
                    room.id,
                    room.user_count,
                    room.video_name,
                    room.leader_name.as_deref().unwrap_or("none"),
                );
            }
        }
        SessionEvent::ConfigReceived(config) => {
            tracing::info!(
                "Server allows {} rooms of up to {} users each",
                config.max_room_count,
                config.max_users_per_room
            );
        }
        SessionEvent::ServerError { code, message } => {
            tracing::warn!("Server error {code:?}: {message}");
        }
        SessionEvent::Disconnected => {
            tracing::warn!("Disconnected from the server");
        }
        SessionEvent::Reconnected => {
            tracing::info!("Reconnected to the server");
        }
        SessionEvent::StreamFailed { reason } => {
            tracing::error!("Streaming failed: {reason}");
        }
    }
}
