use crate::agent::{ ChatAgent, TurnError };
use crate::auth::{ self, Authenticator };
use crate::cli::Args;
use crate::error::ChatError;
use crate::models::chat::{ Message, Room, Turn };
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use axum::{
    routing::{ get, post },
    Json,
    Router,
    extract::{ rejection::{ JsonRejection, PathRejection, QueryRejection }, Path, Query, State },
    response::{ IntoResponse, Response },
    http::{ header::AUTHORIZATION, HeaderMap, StatusCode },
};
use serde::{ de, Deserialize, Deserializer, Serialize };
use serde_json::json;
use tower_http::cors::{ Any, CorsLayer };
use tower_http::services::ServeDir;
use log::{ info, warn };

#[derive(Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
}

/// `?limit=&before_id=` leaves both unset.
#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub limit: Option<usize>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub before_id: Option<i64>,
}

fn empty_string_as_none<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
    where D: Deserializer<'de>, T: FromStr, T::Err: fmt::Display
{
    let opt = Option::<String>::deserialize(de)?;
    match opt.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse::<T>().map_err(de::Error::custom).map(Some),
    }
}

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
struct TokenResponse {
    ok: bool,
    token: String,
}

#[derive(Serialize)]
struct ReloadResponse {
    success: bool,
    message: String,
    details: Option<Vec<String>>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_message: Option<Message>,
}

/// A `ChatError` rendered as `{error, message}`, plus the stored user
/// message when a turn failed after persisting it.
#[derive(Debug)]
pub struct ApiError {
    error: ChatError,
    user_message: Option<Message>,
}

pub fn status_for(error: &ChatError) -> StatusCode {
    match error {
        ChatError::Storage(_) | ChatError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::Conflict(_) => StatusCode::CONFLICT,
        ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ChatError::Upstream(_) | ChatError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        ChatError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl From<ChatError> for ApiError {
    fn from(error: ChatError) -> Self {
        Self { error, user_message: None }
    }
}

impl From<TurnError> for ApiError {
    fn from(err: TurnError) -> Self {
        Self { error: err.error, user_message: err.user_message }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ChatError::invalid(rejection.body_text()).into()
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ChatError::invalid(rejection.body_text()).into()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ChatError::invalid(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, self.error);
        }
        let body = ErrorBody {
            error: self.error.kind(),
            message: self.error.to_string(),
            user_message: self.user_message,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<ChatAgent>,
    pub auth: Arc<Authenticator>,
    pub admin_api_key: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::bearer_token)
}

pub fn router(state: AppState, static_dir: Option<&str>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/rooms", get(list_rooms_handler).post(create_room_handler))
        .route("/rooms/{room_id}/messages", get(history_handler).post(post_message_handler))
        .route("/auth/signup", post(signup_handler))
        .route("/auth/login", post(login_handler))
        .route("/admin/reload-prompts", post(reload_prompts_handler));

    if let Some(dir) = static_dir.filter(|d| !d.trim().is_empty()) {
        info!("Serving static files from {}", dir);
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(cors).with_state(state)
}

pub async fn start_http_server(
    addr: &str,
    state: AppState,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = addr.parse::<SocketAddr>()?;
    let app = router(state, args.static_dir.as_deref());

    match (&args.tls_cert_path, &args.tls_key_path) {
        (Some(cert_path), Some(key_path)) if args.enable_tls => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;
            info!("Starting HTTPS API server on: https://{}", addr);
            axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                format!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e)
            })?;
            info!("Starting HTTP API server on: http://{}", addr);
            axum::serve(listener, app.into_make_service()).await?;
        }
    }

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_rooms_handler(State(state): State<AppState>) -> Result<Json<Vec<Room>>, ApiError> {
    Ok(Json(state.agent.messages().list_rooms().await?))
}

async fn create_room_handler(
    State(state): State<AppState>,
    req: Result<Json<CreateRoomRequest>, JsonRejection>
) -> Result<(StatusCode, Json<Room>), ApiError> {
    let Json(req) = req?;
    let room = state.agent.messages().create_room(&req.name).await?;
    info!("Created room {} ({})", room.name, room.id);
    Ok((StatusCode::CREATED, Json(room)))
}

async fn post_message_handler(
    State(state): State<AppState>,
    room_id: Result<Path<i64>, PathRejection>,
    headers: HeaderMap,
    req: Result<Json<PostMessageRequest>, JsonRejection>
) -> Result<Json<Turn>, ApiError> {
    let Path(room_id) = room_id?;
    let Json(req) = req?;
    let author = state.auth.resolve_author(bearer_token(&headers)).await?;
    let turn = state.agent.handle_turn(room_id, &author, &req.content).await?;
    Ok(Json(turn))
}

async fn history_handler(
    State(state): State<AppState>,
    room_id: Result<Path<i64>, PathRejection>,
    query: Result<Query<HistoryQuery>, QueryRejection>
) -> Result<Json<Vec<Message>>, ApiError> {
    let Path(room_id) = room_id?;
    let Query(query) = query?;
    let messages = state.agent.history(room_id, query.limit, query.before_id).await?;
    Ok(Json(messages))
}

async fn signup_handler(
    State(state): State<AppState>,
    creds: Result<Json<Credentials>, JsonRejection>
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(creds) = creds?;
    let token = state.auth.signup(&creds.username, &creds.password).await?;
    Ok(Json(TokenResponse { ok: true, token }))
}

async fn login_handler(
    State(state): State<AppState>,
    creds: Result<Json<Credentials>, JsonRejection>
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(creds) = creds?;
    let token = state.auth.login(&creds.username, &creds.password).await?;
    Ok(Json(TokenResponse { ok: true, token }))
}

async fn reload_prompts_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(expected) = state.admin_api_key.as_deref().filter(|k| !k.is_empty()) {
        let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            warn!("Rejected prompt reload with missing or wrong X-API-Key");
            return ApiError::from(ChatError::unauthorized("invalid admin key")).into_response();
        }
    }

    let (code, success, detail) = match state.agent.reload_prompts_if_changed().await {
        Ok(true) => (StatusCode::OK, true, "Local reloaded".to_string()),
        Ok(false) if state.agent.prompts_path().is_none() =>
            (StatusCode::OK, true, "No prompts file configured".to_string()),
        Ok(false) => (StatusCode::OK, true, "Local unchanged".to_string()),
        Err(e) => (StatusCode::BAD_REQUEST, false, format!("Local error: {}", e)),
    };

    (
        code,
        Json(ReloadResponse {
            success,
            message: if success { "Reload complete".into() } else { "Reload errors".into() },
            details: Some(vec![detail]),
        }),
    ).into_response()
}
