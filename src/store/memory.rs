use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{ default_room_name, validate_room_name, MessageStore, UserStore };
use crate::error::ChatError;
use crate::models::chat::{ Message, Role, Room, User };

#[derive(Default)]
struct Tables {
    rooms: Vec<Room>,
    messages: Vec<Message>,
    users: HashMap<String, User>,
    next_message_id: i64,
    next_user_id: i64,
}

/// Process-local store for development and tests. Nothing survives a restart.
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new(default_room: &str) -> Result<Self, ChatError> {
        let room = Room {
            id: 1,
            name: default_room_name(default_room)?.to_string(),
            created_at: Utc::now(),
        };
        Ok(Self {
            tables: Mutex::new(Tables {
                rooms: vec![room],
                next_message_id: 1,
                next_user_id: 1,
                ..Tables::default()
            }),
        })
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(
        &self,
        room_id: i64,
        role: Role,
        author: Option<&str>,
        content: &str
    ) -> Result<Message, ChatError> {
        let mut tables = self.tables.lock().await;
        if !tables.rooms.iter().any(|r| r.id == room_id) {
            return Err(ChatError::storage(format!("room {} does not exist", room_id)));
        }

        let message = Message {
            id: tables.next_message_id,
            room_id,
            role,
            author: author.map(str::to_string),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        tables.next_message_id += 1;
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn list(
        &self,
        room_id: i64,
        limit: usize,
        before_id: Option<i64>
    ) -> Result<Vec<Message>, ChatError> {
        let tables = self.tables.lock().await;
        if !tables.rooms.iter().any(|r| r.id == room_id) {
            return Err(ChatError::not_found(format!("room {}", room_id)));
        }

        // ids are assigned in push order, so the vector is already sorted by id
        let mut page: Vec<Message> = tables.messages
            .iter()
            .rev()
            .filter(|m| m.room_id == room_id)
            .filter(|m| before_id.map_or(true, |before| m.id < before))
            .take(limit)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn create_room(&self, name: &str) -> Result<Room, ChatError> {
        let name = validate_room_name(name)?;
        let mut tables = self.tables.lock().await;
        if tables.rooms.iter().any(|r| r.name == name) {
            return Err(ChatError::Conflict(format!("room '{}'", name)));
        }

        let id = tables.rooms.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let room = Room { id, name: name.to_string(), created_at: Utc::now() };
        tables.rooms.push(room.clone());
        debug!("Created room {} ({})", room.id, room.name);
        Ok(room)
    }

    async fn find_room(&self, room_id: i64) -> Result<Option<Room>, ChatError> {
        let tables = self.tables.lock().await;
        Ok(tables.rooms.iter().find(|r| r.id == room_id).cloned())
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, ChatError> {
        let tables = self.tables.lock().await;
        Ok(tables.rooms.clone())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, ChatError> {
        let mut tables = self.tables.lock().await;
        if tables.users.contains_key(username) {
            return Err(ChatError::Conflict(format!("username '{}'", username)));
        }

        let user = User {
            id: tables.next_user_id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        tables.next_user_id += 1;
        tables.users.insert(username.to_string(), user.clone());
        Ok(user)
    }

    async fn find_user(&self, username: &str) -> Result<Option<User>, ChatError> {
        let tables = self.tables.lock().await;
        Ok(tables.users.get(username).cloned())
    }
}
