mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::ChatError;
use crate::models::chat::{ Message, Role, Room, User };

/// Append-only log of chat turns, grouped by room.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message. Unknown rooms surface as `ChatError::Storage`.
    async fn append(
        &self,
        room_id: i64,
        role: Role,
        author: Option<&str>,
        content: &str
    ) -> Result<Message, ChatError>;

    /// Up to `limit` most recent messages older than `before_id`, oldest first.
    async fn list(
        &self,
        room_id: i64,
        limit: usize,
        before_id: Option<i64>
    ) -> Result<Vec<Message>, ChatError>;

    async fn create_room(&self, name: &str) -> Result<Room, ChatError>;

    async fn find_room(&self, room_id: i64) -> Result<Option<Room>, ChatError>;

    async fn list_rooms(&self) -> Result<Vec<Room>, ChatError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, ChatError>;

    async fn find_user(&self, username: &str) -> Result<Option<User>, ChatError>;
}

#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub users: Arc<dyn UserStore>,
}

impl Stores {
    pub fn from_shared<S>(store: Arc<S>) -> Self where S: MessageStore + UserStore + 'static {
        Self {
            messages: store.clone(),
            users: store,
        }
    }
}

pub(crate) fn validate_room_name(name: &str) -> Result<&str, ChatError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::invalid("room name must not be empty"));
    }
    if name.chars().count() > 64 {
        return Err(ChatError::invalid("room name must be at most 64 characters"));
    }
    Ok(name)
}

/// The configured default room, held to the same rules as rooms created later.
pub(crate) fn default_room_name(name: &str) -> Result<&str, ChatError> {
    validate_room_name(name).map_err(|e| ChatError::Config(format!("DEFAULT_ROOM is invalid: {}", e)))
}

/// Maps a `DATABASE_URL` onto a SQLite path. `None` means an in-memory database.
pub fn sqlite_path(database_url: &str) -> Option<&str> {
    let url = database_url.trim();
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    match path {
        "" | ":memory:" => None,
        p => Some(p),
    }
}

pub fn create_store(args: &Args) -> Result<Stores, ChatError> {
    match args.store_type.to_lowercase().as_str() {
        "sqlite" => {
            let store = match sqlite_path(&args.database_url) {
                Some(path) => SqliteStore::open(path, &args.default_room)?,
                None => SqliteStore::in_memory(&args.default_room)?,
            };
            Ok(Stores::from_shared(Arc::new(store)))
        }
        "memory" => Ok(Stores::from_shared(Arc::new(MemoryStore::new(&args.default_room)?))),
        other => Err(ChatError::Config(format!("Unsupported store type: {}", other))),
    }
}

pub fn initialize_store(args: &Args) -> Result<Stores, ChatError> {
    match args.store_type.to_lowercase().as_str() {
        "sqlite" =>
            info!(
                "Chat messages will be stored in sqlite at {}",
                sqlite_path(&args.database_url).unwrap_or(":memory:")
            ),
        other => info!("Chat messages will be stored in: {}", other),
    }
    create_store(args)
}
