use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

mod config;
mod protocol;
mod state;

use protocol::{classify_parse_failure, ErrorCode, Message, Role};
use state::{ClientSender, LeaveOutcome, ServerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "matinee_server=debug,info".into()),
        )
        .init();

    let addr = SocketAddr::from(([0, 0, 0, 0], config::port()));
    let state = ServerState::new(config::load());

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/ws", get(ws_endpoint))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Matinee Server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn handle_connection(socket: WebSocket, state: ServerState) {
    let conn_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.add_connection(conn_id, tx.clone());

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(AxumWsMessage::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                handle_message(&text, conn_id, &tx, &state).await;
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Client {} closing connection", conn_id);
                break;
            }
            Err(e) => {
                tracing::warn!("WebSocket error for {}: {}", conn_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    if let Some(outcome) = state.remove_connection(conn_id).await {
        finish_leave(&state, outcome).await;
    }
    send_task.abort();
}

async fn handle_message(text: &str, conn_id: Uuid, tx: &ClientSender, state: &ServerState) {
    let msg = match serde_json::from_str::<Message>(text) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::warn!("Rejecting message from {}: {}", conn_id, err);
            let _ = tx.send(Message::Error {
                code: classify_parse_failure(text),
                message: err.to_string(),
            });
            return;
        }
    };

    match msg {
        Message::JoinAsLeader {
            room_id,
            user_name,
            media_track_name,
        } => {
            handle_join(
                state,
                conn_id,
                tx,
                &room_id,
                Role::Leader,
                &user_name,
                &media_track_name,
            )
            .await;
        }

        Message::JoinAsFollower {
            room_id,
            user_name,
            media_track_name,
        } => {
            handle_join(
                state,
                conn_id,
                tx,
                &room_id,
                Role::Follower,
                &user_name,
                &media_track_name,
            )
            .await;
        }

        Message::GetRooms => {
            let rooms = state.list_rooms().await;
            let _ = tx.send(Message::RoomsList { rooms });
        }

        Message::GetConfig => {
            let _ = tx.send(Message::Config {
                config: state.config().clone(),
            });
        }

        Message::SyncUpdate {
            timestamp,
            group_id,
            object_id,
            is_playing,
        } => {
            if let Some(recipients) = state
                .relay_sync_update(conn_id, timestamp, group_id, object_id, is_playing)
                .await
            {
                relay(
                    recipients,
                    Message::SyncUpdate {
                        timestamp,
                        group_id,
                        object_id,
                        is_playing,
                    },
                );
            }
        }

        Message::PlaybackControl {
            action,
            timestamp,
            group_id,
            object_id,
            seek_target,
        } => {
            if let Some(recipients) = state
                .relay_playback_control(conn_id, action, timestamp, group_id, object_id, seek_target)
                .await
            {
                relay(
                    recipients,
                    Message::PlaybackControl {
                        action,
                        timestamp,
                        group_id,
                        object_id,
                        seek_target,
                    },
                );
            }
        }

        other => {
            tracing::warn!("Unexpected message from client {}: {:?}", conn_id, other);
            let _ = tx.send(Message::Error {
                code: ErrorCode::UnknownMessage,
                message: ErrorCode::UnknownMessage.describe().to_string(),
            });
        }
    }
}

async fn handle_join(
    state: &ServerState,
    conn_id: Uuid,
    tx: &ClientSender,
    room_id: &str,
    role: Role,
    user_name: &str,
    track_name: &str,
) {
    // Re-joining moves the member, with full leave fan-out for the old room.
    if state.membership(conn_id).is_some() {
        if let Some(outcome) = state.leave_room(conn_id).await {
            finish_leave(state, outcome).await;
        }
    }

    match state
        .join_room(conn_id, tx.clone(), room_id, role, user_name, track_name)
        .await
    {
        Ok(outcome) => {
            let _ = tx.send(outcome.state);
            relay(outcome.notify, outcome.notice);
            broadcast_listing(state).await;
        }
        Err(code) => {
            let _ = tx.send(Message::Error {
                code,
                message: code.describe().to_string(),
            });
        }
    }
}

async fn finish_leave(state: &ServerState, outcome: LeaveOutcome) {
    if let Some(notice) = outcome.notice {
        relay(outcome.notify, notice);
    }
    for (member, message) in outcome.refreshed {
        state.send_to(member, message);
    }
    broadcast_listing(state).await;
}

async fn broadcast_listing(state: &ServerState) {
    let rooms = state.list_rooms().await;
    state.broadcast_lobby(Message::RoomsList { rooms });
}

fn relay(recipients: Vec<ClientSender>, message: Message) {
    for tx in recipients {
        let _ = tx.send(message.clone());
    }
}
