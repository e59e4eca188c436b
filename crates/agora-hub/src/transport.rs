use crate::{
    lifecycle::ChatRuntime,
    registry::{Connection, TransportHandle},
};
use agora_core::wire::{decode_inbound, BroadcastMessage, InboundFrame, OutboundEvent, Participant};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub history_on_join: usize,
    pub announce_joins: bool,
    pub upload_dir: PathBuf,
}

#[derive(Clone)]
pub struct AppState {
    runtime: Arc<ChatRuntime>,
    settings: Arc<TransportSettings>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        runtime: Arc<ChatRuntime>,
        settings: TransportSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            settings: Arc::new(settings),
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let uploads = ServeDir::new(&state.settings.upload_dir);
    Router::new()
        .route("/ws/:user_id/:user_name", get(ws_handler))
        .route("/api/users", get(list_users))
        .route("/api/messages", get(recent_messages))
        .route(
            "/api/upload",
            post(upload_image).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/health", get(|| async { "ok" }))
        .nest_service("/uploads", uploads)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((user_id, user_name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user_id = user_id.trim().to_string();
    let user_name = user_name.trim().to_string();
    if user_id.is_empty() || user_name.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    ws.max_message_size(state.settings.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(state, socket, Participant::new(user_id, user_name)))
}

async fn handle_socket(state: AppState, socket: WebSocket, participant: Participant) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (handle, mut rx) = TransportHandle::channel(state.settings.queue_capacity);
    let write_timeout = state.settings.write_timeout;
    let write_conn = participant.id.clone();
    let write_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let send = ws_sender.send(Message::Text(payload.to_string()));
            match tokio::time::timeout(write_timeout, send).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(event = "write_error", participant_id = %write_conn, error = %err);
                    return;
                }
                Err(_) => {
                    warn!(event = "write_timeout", participant_id = %write_conn);
                    return;
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    let runtime = &state.runtime;
    let conn = runtime
        .registry()
        .register(participant.id.clone(), participant.name.clone(), handle)
        .await;
    info!(
        event = "participant_connected",
        participant_id = %participant.id,
        conn_id = conn.conn_id()
    );

    replay_history(&state, &participant).await;
    runtime.broadcaster().publish_presence().await;
    if state.settings.announce_joins {
        runtime
            .broadcaster()
            .announce(format!("{} joined the chat", participant.name))
            .await;
    }

    let reason = read_loop(&state, &mut ws_receiver, &conn).await;
    disconnect(&state, conn, reason).await;
    let _ = write_task.await;
}

async fn read_loop(
    state: &AppState,
    ws_receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    conn: &Connection,
) -> &'static str {
    let sender = conn.participant();
    loop {
        let next = tokio::select! {
            _ = state.shutdown.cancelled() => return "server_shutdown",
            next = ws_receiver.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                warn!(event = "read_error", conn_id = conn.conn_id(), error = %err);
                return "read_error";
            }
            None => return "stream_closed",
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => return "client_close",
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        let (content, kind) = match decode_inbound(&data, state.settings.max_frame_bytes) {
            Ok(InboundFrame::Message {
                content,
                message_type,
            }) => (content, message_type),
            Err(err) => {
                warn!(event = "message_invalid", conn_id = conn.conn_id(), error = %err);
                continue;
            }
        };
        if let Err(err) = state.runtime.relay().publish(&sender, &content, kind).await {
            warn!(
                event = "message_dropped",
                conn_id = conn.conn_id(),
                participant_id = %sender.id,
                error = %err
            );
        }
    }
}

async fn disconnect(state: &AppState, conn: Arc<Connection>, reason: &'static str) {
    let runtime = &state.runtime;
    let removed = runtime.registry().release(&conn).await;
    info!(
        event = "participant_disconnected",
        participant_id = %conn.participant_id(),
        conn_id = conn.conn_id(),
        reason,
        removed
    );
    if removed {
        runtime.broadcaster().publish_presence().await;
        if state.settings.announce_joins {
            runtime
                .broadcaster()
                .announce(format!("{} left the chat", conn.display_name()))
                .await;
        }
    }
}

async fn replay_history(state: &AppState, participant: &Participant) {
    let limit = state.settings.history_on_join;
    if limit == 0 {
        return;
    }
    let history = match state.runtime.log().recent(limit).await {
        Ok(history) => history,
        Err(err) => {
            warn!(event = "history_replay_failed", participant_id = %participant.id, error = %err);
            return;
        }
    };
    for stored in &history {
        let message = match BroadcastMessage::encode(&stored.to_event()) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "history_encode_failed", message_id = stored.id, error = %err);
                continue;
            }
        };
        if !state
            .runtime
            .broadcaster()
            .send_to(&participant.id, &message)
            .await
        {
            break;
        }
    }
    debug!(event = "history_replayed", participant_id = %participant.id, count = history.len());
}

async fn list_users(State(state): State<AppState>) -> Json<Vec<Participant>> {
    Json(state.runtime.registry().snapshot().await)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

fn history_limit(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

async fn recent_messages(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<OutboundEvent>>, (StatusCode, Json<serde_json::Value>)> {
    let limit = history_limit(query.limit);
    match state.runtime.log().recent(limit).await {
        Ok(history) => Ok(Json(history.iter().map(|msg| msg.to_event()).collect())),
        Err(err) => {
            warn!(event = "history_read_failed", error = %err);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            ))
        }
    }
}

#[derive(Debug, Error)]
enum UploadError {
    #[error("malformed upload: {0}")]
    Multipart(String),
    #[error("no file field in upload")]
    MissingFile,
    #[error("not an image: {0}")]
    NotAnImage(String),
    #[error("failed to save upload: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn upload_image(State(state): State<AppState>, multipart: Multipart) -> Json<UploadResponse> {
    match save_upload(&state.settings.upload_dir, multipart).await {
        Ok(url) => {
            info!(event = "upload_saved", url = %url);
            Json(UploadResponse {
                success: true,
                url: Some(url),
                error: None,
            })
        }
        Err(err) => {
            warn!(event = "upload_failed", error = %err);
            Json(UploadResponse {
                success: false,
                url: None,
                error: Some(err.to_string()),
            })
        }
    }
}

async fn save_upload(dir: &std::path::Path, mut multipart: Multipart) -> Result<String, UploadError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| UploadError::Multipart(err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = sanitize_file_name(field.file_name().unwrap_or("image"));
        let extension = image_extension(&file_name, field.content_type())?;
        let bytes = field
            .bytes()
            .await
            .map_err(|err| UploadError::Multipart(err.to_string()))?;

        let stem = file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&file_name);
        let stored_name = format!("{}_{}.{}", Uuid::new_v4().simple(), stem, extension);
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(&stored_name), &bytes).await?;
        return Ok(format!("/uploads/{stored_name}"));
    }
    Err(UploadError::MissingFile)
}

/// Base name only, restricted to `[A-Za-z0-9._-]`.
fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(raw);
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(64)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}

fn image_extension(file_name: &str, content_type: Option<&str>) -> Result<String, UploadError> {
    if let Some(content_type) = content_type {
        if !content_type.starts_with("image/") {
            return Err(UploadError::NotAnImage(content_type.to_string()));
        }
    }
    let from_name = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()));
    if let Some(ext) = from_name {
        return Ok(ext);
    }
    let from_type = content_type
        .and_then(|ct| ct.strip_prefix("image/"))
        .map(|sub| match sub {
            "jpeg" => "jpg".to_string(),
            other => other.to_ascii_lowercase(),
        })
        .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()));
    from_type.ok_or_else(|| UploadError::NotAnImage(file_name.to_string()))
}
