use log::{ error, info };
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::cli::Args;
use crate::config::prompt::{ self, PromptConfig, PromptError };
use crate::error::ChatError;
use crate::llm::chat::ChatClient;
use crate::models::chat::{ Message, PromptMessage, Role, Turn };
use crate::models::websocket::ServerMessage;
use crate::store::MessageStore;
use crate::websocket::Broadcaster;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// A failed turn. `user_message` is set once the user's message was stored,
/// which is the case for every upstream failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TurnError {
    pub user_message: Option<Message>,
    #[source]
    pub error: ChatError,
}

impl From<ChatError> for TurnError {
    fn from(error: ChatError) -> Self {
        Self { user_message: None, error }
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub bot_name: String,
    pub history_window: usize,
    pub max_message_chars: usize,
    pub prompts_path: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            bot_name: "LLM Bot".to_string(),
            history_window: 12,
            max_message_chars: 4000,
            prompts_path: None,
        }
    }
}

impl AgentSettings {
    pub fn from_args(args: &Args) -> Self {
        Self {
            bot_name: args.bot_name.clone(),
            history_window: args.history_window,
            max_message_chars: args.max_message_chars,
            prompts_path: args.prompts_path.clone().filter(|p| !p.trim().is_empty()),
        }
    }
}

/// Runs chat turns: store the user message, ask the upstream, store the reply.
pub struct ChatAgent {
    messages: Arc<dyn MessageStore>,
    chat_client: Arc<dyn ChatClient>,
    prompt_config: RwLock<Arc<PromptConfig>>,
    broadcaster: Option<Broadcaster>,
    settings: AgentSettings,
}

impl ChatAgent {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        chat_client: Arc<dyn ChatClient>,
        settings: AgentSettings
    ) -> Result<Self, PromptError> {
        let prompt_config = prompt::load_or_default(settings.prompts_path.as_deref())?;
        info!(
            "Chat agent configured: Model={}, BaseURL={}, HistoryWindow={}",
            chat_client.get_model(),
            chat_client.get_base_url().as_deref().unwrap_or("adapter default"),
            settings.history_window
        );
        Ok(Self {
            messages,
            chat_client,
            prompt_config: RwLock::new(prompt_config),
            broadcaster: None,
            settings,
        })
    }

    pub fn with_broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    pub fn prompts_path(&self) -> Option<&str> {
        self.settings.prompts_path.as_deref()
    }

    fn validate_content<'a>(&self, content: &'a str) -> Result<&'a str, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::invalid("message content must not be empty"));
        }
        let chars = content.chars().count();
        if chars > self.settings.max_message_chars {
            return Err(
                ChatError::invalid(
                    format!(
                        "message is {} characters, the limit is {}",
                        chars,
                        self.settings.max_message_chars
                    )
                )
            );
        }
        Ok(content)
    }

    fn publish(&self, message: &Message) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(ServerMessage::Message { message: message.clone() });
        }
    }

    /// System prompt followed by the most recent room messages, oldest first.
    async fn conversation_window(&self, room_id: i64) -> Result<Vec<PromptMessage>, ChatError> {
        let recent = self.messages.list(room_id, self.settings.history_window.max(1), None).await?;
        let prompts = Arc::clone(&*self.prompt_config.read().await);

        let mut window = Vec::with_capacity(recent.len() + 1);
        window.push(PromptMessage::new(Role::System, prompts.system_prompt.clone()));
        for message in recent {
            let content = match message.role {
                Role::User => prompts.render_user_turn(message.author.as_deref(), &message.content),
                Role::Bot | Role::System => message.content,
            };
            window.push(PromptMessage::new(message.role, content));
        }
        Ok(window)
    }

    async fn reply_to(&self, user_message: &Message) -> Result<Message, ChatError> {
        let window = self.conversation_window(user_message.room_id).await?;
        let reply = self.chat_client.complete(&window).await?;
        let bot_message = self.messages.append(
            user_message.room_id,
            Role::Bot,
            Some(self.settings.bot_name.as_str()),
            &reply
        ).await?;
        self.publish(&bot_message);
        Ok(bot_message)
    }

    pub async fn handle_turn(
        &self,
        room_id: i64,
        author: &str,
        user_content: &str
    ) -> Result<Turn, TurnError> {
        let content = self.validate_content(user_content)?;
        if self.messages.find_room(room_id).await?.is_none() {
            return Err(ChatError::not_found(format!("room {}", room_id)).into());
        }

        let user_message = self.messages.append(room_id, Role::User, Some(author), content).await?;
        info!("Stored user message {} from {} in room {}", user_message.id, author, room_id);
        self.publish(&user_message);

        match self.reply_to(&user_message).await {
            Ok(bot_message) => {
                info!("Stored bot reply {} in room {}", bot_message.id, room_id);
                Ok(Turn { user_message, bot_message })
            }
            Err(error) => {
                error!("Turn for message {} in room {} failed: {}", user_message.id, room_id, error);
                Err(TurnError { user_message: Some(user_message), error })
            }
        }
    }

    pub async fn history(
        &self,
        room_id: i64,
        limit: Option<usize>,
        before_id: Option<i64>
    ) -> Result<Vec<Message>, ChatError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        self.messages.list(room_id, limit, before_id).await
    }

    pub async fn reload_prompts_if_changed(&self) -> Result<bool, PromptError> {
        let Some(path) = self.prompts_path() else {
            return Ok(false);
        };

        let current = Arc::clone(&*self.prompt_config.read().await);
        match prompt::reload_prompts_if_changed(path, &current)? {
            Some(new_config) => {
                *self.prompt_config.write().await = new_config;
                info!("Prompts successfully reloaded");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
