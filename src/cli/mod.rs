use clap::{ ArgAction, Parser };
use std::time::Duration;

use crate::llm::LlmConfig;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Message Store Args ---
    /// Message store backend (sqlite, memory)
    #[arg(long, env = "STORE_TYPE", default_value = "sqlite")]
    pub store_type: String,

    /// Database connection string (e.g., sqlite://groupchat.db, sqlite::memory:)
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://groupchat.db")]
    pub database_url: String,

    /// Name of the room created on first start.
    #[arg(long, env = "DEFAULT_ROOM", default_value = "general")]
    pub default_room: String,

    // --- LLM Upstream Args ---
    /// Base URL of the OpenAI-compatible endpoint, including the version prefix.
    #[arg(long, env = "LLM_API_BASE", default_value = "http://localhost:8001/v1")]
    pub llm_api_base: String,

    /// Model identifier sent with each completion request.
    #[arg(long, env = "LLM_MODEL", default_value = "llama-3-8b-instruct")]
    pub llm_model: String,

    /// Bearer credential for the upstream. Leave empty for local servers.
    #[arg(long, env = "LLM_API_KEY", default_value = "", hide_env_values = true)]
    pub llm_api_key: String,

    /// Seconds to wait for the upstream before giving up.
    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value = "120")]
    pub llm_timeout_secs: u64,

    #[arg(long, env = "LLM_TEMPERATURE", default_value = "0.2")]
    pub llm_temperature: f32,

    #[arg(long, env = "LLM_MAX_TOKENS", default_value = "512")]
    pub llm_max_tokens: u32,

    /// Retry once when the connection to the upstream cannot be established.
    #[arg(long, env = "LLM_RETRY_ON_CONNECT", default_value_t = true, action = ArgAction::Set)]
    pub llm_retry_on_connect: bool,

    // --- Conversation Args ---
    /// Display name stored as the author of bot replies.
    #[arg(long, env = "BOT_NAME", default_value = "LLM Bot")]
    pub bot_name: String,

    /// Number of recent room messages sent upstream with each turn.
    #[arg(long, env = "HISTORY_WINDOW", default_value = "12")]
    pub history_window: usize,

    /// Longest accepted user message, in characters.
    #[arg(long, env = "MAX_MESSAGE_CHARS", default_value = "4000")]
    pub max_message_chars: usize,

    /// Optional path to the prompt configuration file. Built-in prompts are used when unset.
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<String>,

    // --- Server Args ---
    /// Interface the HTTP API binds to.
    #[arg(long, env = "APP_HOST", default_value = "0.0.0.0")]
    pub app_host: String,

    /// Port the HTTP API listens on.
    #[arg(long, env = "APP_PORT", default_value = "8000")]
    pub app_port: u16,

    /// Host address and port for the WebSocket feed to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Start the WebSocket feed next to the HTTP API.
    #[arg(long, env = "ENABLE_WS", default_value_t = true, action = ArgAction::Set)]
    pub enable_ws: bool,

    /// Directory with a pre-built front end, served for unmatched paths.
    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<String>,

    /// Optional key required in the X-API-Key header for admin endpoints.
    #[arg(long, env = "ADMIN_API_KEY", hide_env_values = true)]
    pub admin_api_key: Option<String>,

    // --- Auth Args ---
    /// Secret used to sign bearer tokens.
    #[arg(long, env = "JWT_SECRET", default_value = "change_me", hide_env_values = true)]
    pub jwt_secret: String,

    /// Token lifetime in minutes.
    #[arg(long, env = "JWT_EXPIRE_MINUTES", default_value = "43200")]
    pub jwt_expire_minutes: i64,

    /// Reject messages and feed connections without a valid bearer token.
    #[arg(long, env = "REQUIRE_AUTH", default_value = "false")]
    pub require_auth: bool,

    // --- TLS Args ---
    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.app_host, self.app_port)
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            base_url: self.llm_api_base.clone(),
            model: self.llm_model.clone(),
            api_key: Some(self.llm_api_key.trim().to_string()).filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(self.llm_timeout_secs),
            temperature: self.llm_temperature,
            max_tokens: self.llm_max_tokens,
            retry_on_connect: self.llm_retry_on_connect,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.enable_tls && self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}
