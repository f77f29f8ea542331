pub mod openai;

use async_trait::async_trait;
use std::sync::Arc;

use super::LlmConfig;
use self::openai::OpenAIChatClient;
use crate::error::ChatError;
use crate::models::chat::PromptMessage;

/// Sends a conversation window upstream and returns the reply text.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, history: &[PromptMessage]) -> Result<String, ChatError>;

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> Option<String>;
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, ChatError> {
    let client = OpenAIChatClient::from_config(config)?;
    Ok(Arc::new(client))
}
