pub mod chat;

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
    pub retry_on_connect: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001/v1".to_string(),
            model: "llama-3-8b-instruct".to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
            temperature: 0.2,
            max_tokens: 512,
            retry_on_connect: true,
        }
    }
}
