use async_trait::async_trait;
use log::{ debug, warn };
use reqwest::{ Client as HttpClient, Response, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };

use super::ChatClient;
use crate::error::ChatError;
use crate::llm::LlmConfig;
use crate::models::chat::PromptMessage;

const ERROR_BODY_PREVIEW: usize = 512;

/// Client for any server exposing the OpenAI `/chat/completions` route
/// (OpenAI itself, vLLM, llama.cpp, Ollama's compatibility layer).
pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
    retry_on_connect: bool,
}

#[derive(Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

impl OpenAIChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self, ChatError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = &config.api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                ChatError::Config(format!("Invalid API key format: {}", e))
            )?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = HttpClient::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry_on_connect: config.retry_on_connect,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ChatError> {
        if config.model.trim().is_empty() {
            return Err(ChatError::Config("LLM model must not be empty".to_string()));
        }
        Self::new(config)
    }

    fn completions_url(&self) -> String {
        if self.base_url.ends_with("/chat/completions") {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    async fn send(&self, url: &str, req: &OpenAIChatRequest<'_>) -> Result<Response, reqwest::Error> {
        self.http.post(url).json(req).send().await
    }
}

fn classify_transport_error(url: &str, err: reqwest::Error) -> ChatError {
    if err.is_timeout() {
        ChatError::UpstreamTimeout(format!("no response from {} within deadline", url))
    } else {
        ChatError::Upstream(format!("request to {} failed: {}", url, err))
    }
}

fn preview(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_PREVIEW) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

fn parse_reply(body: &str) -> Result<String, ChatError> {
    let parsed: OpenAIResponse = serde_json
        ::from_str(body)
        .map_err(|e| ChatError::MalformedResponse(format!("invalid completion body: {}", e)))?;

    let content = parsed.choices
        .into_iter()
        .next()
        .ok_or_else(|| ChatError::MalformedResponse("no choices in completion".to_string()))?
        .message.content
        .ok_or_else(|| ChatError::MalformedResponse("choice has no message content".to_string()))?;

    let content = content.trim();
    if content.is_empty() {
        return Err(ChatError::MalformedResponse("completion content is empty".to_string()));
    }
    Ok(content.to_string())
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn complete(&self, history: &[PromptMessage]) -> Result<String, ChatError> {
        let url = self.completions_url();

        let messages = history
            .iter()
            .map(|m| OpenAIMessage {
                role: m.role.upstream_role().to_string(),
                content: Some(m.content.clone()),
            })
            .collect();

        let req = OpenAIChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        debug!("Sending {} messages to {} (model {})", history.len(), url, self.model);

        let resp = match self.send(&url, &req).await {
            Err(e) if self.retry_on_connect && e.is_connect() => {
                warn!("Connection to {} failed ({}), retrying once", url, e);
                self.send(&url, &req).await
            }
            other => other,
        }.map_err(|e| classify_transport_error(&url, e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| classify_transport_error(&url, e))?;

        if !status.is_success() {
            return Err(ChatError::Upstream(format!("{} returned {}: {}", url, status, preview(&body))));
        }

        parse_reply(&body)
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Role;
    use axum::{ Json, Router, http::{ HeaderMap as AxumHeaders, StatusCode }, routing::post };
    use serde_json::{ json, Value };
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn spawn_upstream(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    fn config_for(base_url: String) -> LlmConfig {
        LlmConfig {
            base_url,
            model: "test-model".to_string(),
            api_key: Some("sk-test".to_string()),
            timeout: Duration::from_secs(5),
            ..LlmConfig::default()
        }
    }

    fn window() -> Vec<PromptMessage> {
        vec![
            PromptMessage::new(Role::System, "be brief"),
            PromptMessage::new(Role::User, "alice: Hi"),
            PromptMessage::new(Role::Bot, "Hello!"),
            PromptMessage::new(Role::User, "alice: how are you?"),
        ]
    }

    #[tokio::test]
    async fn sends_window_and_parses_reply() {
        async fn handler(headers: AxumHeaders, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
            let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or("");
            let roles: Vec<&str> = body["messages"]
                .as_array()
                .unwrap()
                .iter()
                .map(|m| m["role"].as_str().unwrap())
                .collect();
            let ok = auth == "Bearer sk-test"
                && body["model"] == "test-model"
                && body["stream"] == false
                && roles == ["system", "user", "assistant", "user"];
            if !ok {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": "unexpected request" })));
            }
            (StatusCode::OK, Json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "  Fine, thanks!\n" } }]
            })))
        }

        let base = spawn_upstream(Router::new().route("/v1/chat/completions", post(handler))).await;
        let client = OpenAIChatClient::from_config(&config_for(base)).unwrap();

        let reply = client.complete(&window()).await.unwrap();
        assert_eq!(reply, "Fine, thanks!");
    }

    #[tokio::test]
    async fn omits_authorization_without_key() {
        async fn handler(headers: AxumHeaders) -> (StatusCode, Json<Value>) {
            if headers.contains_key("authorization") {
                return (StatusCode::UNAUTHORIZED, Json(json!({})));
            }
            (StatusCode::OK, Json(json!({ "choices": [{ "message": { "role": "assistant", "content": "ok" } }] })))
        }

        let base = spawn_upstream(Router::new().route("/v1/chat/completions", post(handler))).await;
        let mut config = config_for(base);
        config.api_key = None;
        let client = OpenAIChatClient::from_config(&config).unwrap();

        assert_eq!(client.complete(&window()).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn non_success_status_is_upstream_error() {
        async fn handler() -> (StatusCode, &'static str) {
            (StatusCode::SERVICE_UNAVAILABLE, "model loading")
        }

        let base = spawn_upstream(Router::new().route("/v1/chat/completions", post(handler))).await;
        let client = OpenAIChatClient::from_config(&config_for(base)).unwrap();

        match client.complete(&window()).await {
            Err(ChatError::Upstream(msg)) => {
                assert!(msg.contains("503"));
                assert!(msg.contains("model loading"));
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unparseable_body_is_malformed() {
        async fn garbage() -> &'static str {
            "<html>not json</html>"
        }
        async fn no_choices() -> Json<Value> {
            Json(json!({ "choices": [] }))
        }
        async fn null_content() -> Json<Value> {
            Json(json!({ "choices": [{ "message": { "role": "assistant", "content": null } }] }))
        }

        for app in [
            Router::new().route("/v1/chat/completions", post(garbage)),
            Router::new().route("/v1/chat/completions", post(no_choices)),
            Router::new().route("/v1/chat/completions", post(null_content)),
        ] {
            let base = spawn_upstream(app).await;
            let client = OpenAIChatClient::from_config(&config_for(base)).unwrap();
            let result = client.complete(&window()).await;
            assert!(matches!(result, Err(ChatError::MalformedResponse(_))), "got {:?}", result);
        }
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        async fn handler() -> Json<Value> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Json(json!({ "choices": [{ "message": { "role": "assistant", "content": "late" } }] }))
        }

        let base = spawn_upstream(Router::new().route("/v1/chat/completions", post(handler))).await;
        let mut config = config_for(base);
        config.timeout = Duration::from_millis(200);
        let client = OpenAIChatClient::from_config(&config).unwrap();

        let result = client.complete(&window()).await;
        assert!(matches!(result, Err(ChatError::UpstreamTimeout(_))), "got {:?}", result);
    }

    #[tokio::test]
    async fn refused_connection_is_upstream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = OpenAIChatClient::from_config(&config_for(format!("http://{}/v1", addr))).unwrap();
        let result = client.complete(&window()).await;
        assert!(matches!(result, Err(ChatError::Upstream(_))), "got {:?}", result);
    }

    #[test]
    fn base_url_may_already_name_the_route() {
        let client = OpenAIChatClient::from_config(
            &config_for("http://llm.local/v1/chat/completions/".to_string())
        ).unwrap();
        assert_eq!(client.completions_url(), "http://llm.local/v1/chat/completions");

        let client = OpenAIChatClient::from_config(&config_for("http://llm.local/v1".to_string())).unwrap();
        assert_eq!(client.completions_url(), "http://llm.local/v1/chat/completions");
    }

    #[test]
    fn empty_model_is_rejected() {
        let mut config = LlmConfig::default();
        config.model = " ".to_string();
        assert!(matches!(OpenAIChatClient::from_config(&config), Err(ChatError::Config(_))));
    }
}
