use axum::body::Body;
use axum::http::{ Request, StatusCode };
use axum::{ routing::post, Json, Router };
use clap::Parser;
use groupchat_agent::agent::{ AgentSettings, ChatAgent };
use groupchat_agent::auth::Authenticator;
use groupchat_agent::cli::Args;
use groupchat_agent::llm::chat::new_client;
use groupchat_agent::models::websocket::ServerMessage;
use groupchat_agent::server::api::{ router, AppState };
use groupchat_agent::store::initialize_store;
use groupchat_agent::websocket::Broadcaster;
use serde_json::{ json, Value };
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Replies with the number of prompt messages and the last one's content.
async fn counting_upstream(Json(body): Json<Value>) -> Json<Value> {
    let messages = body["messages"].as_array().cloned().unwrap_or_default();
    for message in &messages {
        let role = message["role"].as_str().unwrap_or_default();
        assert!(["system", "user", "assistant"].contains(&role), "unexpected role {}", role);
    }
    let last = messages
        .last()
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string();
    Json(json!({
        "choices": [{ "message": { "role": "assistant", "content": format!("saw {}: {}", messages.len(), last) } }]
    }))
}

async fn spawn_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/v1/chat/completions", post(counting_upstream));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1", addr)
}

fn args_for(dir: &TempDir, upstream: &str) -> Args {
    let database_url = format!("sqlite://{}", dir.path().join("chat.db").display());
    Args::parse_from([
        "groupchat-agent",
        "--store-type",
        "sqlite",
        "--database-url",
        &database_url,
        "--llm-api-base",
        upstream,
        "--llm-timeout-secs",
        "5",
    ])
}

fn build_app(args: &Args, broadcaster: &Broadcaster) -> Router {
    let stores = initialize_store(args).unwrap();
    let client = new_client(&args.llm_config()).unwrap();
    let agent = ChatAgent::new(stores.messages.clone(), client, AgentSettings::from_args(args))
        .unwrap()
        .with_broadcaster(broadcaster.clone());
    let auth = Authenticator::from_args(stores.users.clone(), args);
    router(
        AppState {
            agent: Arc::new(agent),
            auth: Arc::new(auth),
            admin_api_key: None,
        },
        None
    )
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn post_message(room_id: i64, content: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/rooms/{}/messages", room_id))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "content": content }).to_string()))
        .unwrap()
}

fn get_history(room_id: i64) -> Request<Body> {
    Request::builder()
        .uri(format!("/rooms/{}/messages", room_id))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn turns_persist_and_survive_restart() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_upstream().await;
    let args = args_for(&dir, &upstream);
    let broadcaster = Broadcaster::new(16);
    let mut feed = broadcaster.subscribe();

    {
        let app = build_app(&args, &broadcaster);

        let (status, turn) = send(&app, post_message(1, "Hello there")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(turn["bot_message"]["content"], "saw 2: anonymous: Hello there");
        assert_eq!(turn["bot_message"]["author"], "LLM Bot");

        let (status, turn) = send(&app, post_message(1, "And again")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(turn["bot_message"]["content"], "saw 4: anonymous: And again");
    }

    let mut published = Vec::new();
    while let Ok(ServerMessage::Message { message }) = feed.try_recv() {
        published.push(message.content);
    }
    assert_eq!(published.len(), 4);
    assert_eq!(published[0], "Hello there");

    let app = build_app(&args, &Broadcaster::new(16));
    let (status, history) = send(&app, get_history(1)).await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap();
    let roles: Vec<&str> = history.iter().map(|m| m["role"].as_str().unwrap()).collect();
    assert_eq!(roles, ["user", "bot", "user", "bot"]);
    assert_eq!(history[2]["content"], "And again");

    let ids: Vec<i64> = history.iter().map(|m| m["id"].as_i64().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn unreachable_upstream_keeps_the_user_message() {
    let dir = TempDir::new().unwrap();
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}/v1", listener.local_addr().unwrap())
    };
    let args = args_for(&dir, &closed);
    let app = build_app(&args, &Broadcaster::new(16));

    let (status, body) = send(&app, post_message(1, "anyone?")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_error");
    assert_eq!(body["user_message"]["content"], "anyone?");

    let (_, history) = send(&app, get_history(1)).await;
    assert_eq!(history.as_array().unwrap().len(), 1);
}
