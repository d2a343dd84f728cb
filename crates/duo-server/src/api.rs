use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use duo_shared::constants::MAX_FRAME_SIZE;
use duo_shared::protocol::ProfileFields;
use duo_shared::UserId;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{Hub, HubStats};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::session;
use crate::upload_store::{UploadStore, UPLOADS_ROUTE};

/// Slack on top of the upload limit for multipart framing.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub uploads: Arc<UploadStore>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let body_limit = state.uploads.max_size() + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route("/ws", get(ws_handler))
        .route("/upload", post(upload))
        .route(&format!("{UPLOADS_ROUTE}/:file_name"), get(download))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct UploadResponse {
    url: String,
    #[serde(rename = "type")]
    mime_type: String,
}

/// Query string of the WebSocket handshake.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Handshake {
    #[serde(default)]
    user_id: String,
    nickname: Option<String>,
    age: Option<String>,
    avatar_seed: Option<String>,
}

impl Handshake {
    fn into_parts(self) -> Result<(UserId, ProfileFields), ServerError> {
        let user_id = UserId::new(self.user_id.trim());
        if user_id.is_blank() {
            return Err(ServerError::BadRequest("userId is required".to_string()));
        }
        let fields = ProfileFields {
            nickname: self.nickname,
            age: self.age,
            avatar_seed: self.avatar_seed,
        };
        Ok((user_id, fields))
    }
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats().await)
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(handshake): Query<Handshake>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let (user_id, fields) = handshake.into_parts()?;

    debug!(user = %user_id.short(), "WebSocket upgrade requested");

    Ok(ws
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| session::run(socket, state, user_id, fields)))
}

async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

        let stored = state
            .uploads
            .store(original_name.as_deref(), content_type.as_deref(), &data)
            .await?;

        let url = stored.url(&public_base_url(&state.config, &headers));
        info!(file = %stored.file_name, size = stored.size, "File uploaded");

        return Ok(Json(UploadResponse {
            url,
            mime_type: stored.mime_type,
        }));
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn download(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> Result<Response, ServerError> {
    let data = state.uploads.read(&file_name).await?;
    let mime = mime_guess::from_path(&file_name).first_or_octet_stream();

    Ok(([(header::CONTENT_TYPE, mime.essence_str().to_string())], data).into_response())
}

/// `PUBLIC_URL` when configured, otherwise the address the client used.
fn public_base_url(config: &ServerConfig, headers: &HeaderMap) -> String {
    if let Some(url) = &config.public_url {
        return url.clone();
    }

    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| format!("http://{host}"))
        .unwrap_or_else(|| format!("http://{}", config.http_addr))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
