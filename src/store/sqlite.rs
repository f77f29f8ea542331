//! SQLite-backed storage for rooms, messages and users.

use std::path::Path;

use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use log::{ debug, info };
use rusqlite::{ params, Connection, ErrorCode, OptionalExtension, Row };
use tokio::sync::Mutex;

use super::{ default_room_name, validate_room_name, MessageStore, UserStore };
use crate::error::ChatError;
use crate::models::chat::{ Message, Role, Room, User };

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS rooms (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        room_id INTEGER NOT NULL,
        role TEXT NOT NULL,
        author TEXT,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_messages_room ON messages(room_id, id);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>, default_room: &str) -> Result<Self, ChatError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs
                ::create_dir_all(parent)
                .map_err(|e| ChatError::storage(format!("Failed to create database directory: {}", e)))?;
        }

        let conn = Connection::open(db_path).map_err(|e|
            ChatError::storage(format!("Failed to open database: {}", e))
        )?;
        info!("Opened sqlite database at {}", db_path.display());
        Self::with_connection(conn, default_room)
    }

    pub fn in_memory(default_room: &str) -> Result<Self, ChatError> {
        let conn = Connection::open_in_memory().map_err(|e|
            ChatError::storage(format!("Failed to create in-memory database: {}", e))
        )?;
        Self::with_connection(conn, default_room)
    }

    fn with_connection(conn: Connection, default_room: &str) -> Result<Self, ChatError> {
        let default_room = default_room_name(default_room)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;

        // id 1 is reserved for the default room so clients can rely on it
        conn.execute(
            "INSERT OR IGNORE INTO rooms (id, name, created_at) VALUES (1, ?1, ?2)",
            params![default_room, Utc::now()]
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn row_to_room(row: &Row<'_>) -> rusqlite::Result<Room> {
    Ok(Room {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get::<_, DateTime<Utc>>(2)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let role = role
        .parse::<Role>()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                e.into()
            )
        })?;

    Ok(Message {
        id: row.get(0)?,
        room_id: row.get(1)?,
        role,
        author: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn room_exists(conn: &Connection, room_id: i64) -> Result<bool, ChatError> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM rooms WHERE id = ?1", params![room_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn insert_message(
    conn: &Connection,
    room_id: i64,
    role: Role,
    author: Option<&str>,
    content: &str
) -> Result<Message, ChatError> {
    let created_at = Utc::now();
    conn
        .execute(
            "INSERT INTO messages (room_id, role, author, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![room_id, role.as_str(), author, content, created_at]
        )
        .map_err(|e| ChatError::storage(format!("Failed to store message in room {}: {}", room_id, e)))?;

    Ok(Message {
        id: conn.last_insert_rowid(),
        room_id,
        role,
        author: author.map(str::to_string),
        content: content.to_string(),
        created_at,
    })
}

fn select_messages(
    conn: &Connection,
    room_id: i64,
    limit: usize,
    before_id: Option<i64>
) -> Result<Vec<Message>, ChatError> {
    let mut stmt = conn.prepare(
        "SELECT id, room_id, role, author, content, created_at FROM messages
         WHERE room_id = ?1 AND (?2 IS NULL OR id < ?2)
         ORDER BY id DESC LIMIT ?3"
    )?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![room_id, before_id, limit], row_to_message)?;

    let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
    // Reverse to get chronological order
    messages.reverse();
    Ok(messages)
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(
        &self,
        room_id: i64,
        role: Role,
        author: Option<&str>,
        content: &str
    ) -> Result<Message, ChatError> {
        let conn = self.conn.lock().await;
        let message = insert_message(&conn, room_id, role, author, content)?;
        debug!("Stored message {} in room {}", message.id, room_id);
        Ok(message)
    }

    async fn list(
        &self,
        room_id: i64,
        limit: usize,
        before_id: Option<i64>
    ) -> Result<Vec<Message>, ChatError> {
        let conn = self.conn.lock().await;
        if !room_exists(&conn, room_id)? {
            return Err(ChatError::not_found(format!("room {}", room_id)));
        }
        select_messages(&conn, room_id, limit, before_id)
    }

    async fn create_room(&self, name: &str) -> Result<Room, ChatError> {
        let name = validate_room_name(name)?;
        let conn = self.conn.lock().await;
        let created_at = Utc::now();
        conn
            .execute("INSERT INTO rooms (name, created_at) VALUES (?1, ?2)", params![name, created_at])
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ChatError::Conflict(format!("room '{}'", name))
                } else {
                    ChatError::from(e)
                }
            })?;

        Ok(Room {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            created_at,
        })
    }

    async fn find_room(&self, room_id: i64) -> Result<Option<Room>, ChatError> {
        let conn = self.conn.lock().await;
        let room = conn
            .query_row(
                "SELECT id, name, created_at FROM rooms WHERE id = ?1",
                params![room_id],
                row_to_room
            )
            .optional()?;
        Ok(room)
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, ChatError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM rooms ORDER BY id")?;
        let rooms = stmt.query_map([], row_to_room)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rooms)
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, ChatError> {
        let conn = self.conn.lock().await;
        let created_at = Utc::now();
        conn
            .execute(
                "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
                params![username, password_hash, created_at]
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ChatError::Conflict(format!("username '{}'", username))
                } else {
                    ChatError::from(e)
                }
            })?;

        Ok(User {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at,
        })
    }

    async fn find_user(&self, username: &str) -> Result<Option<User>, ChatError> {
        let conn = self.conn.lock().await;
        let user = conn
            .query_row(
                "SELECT id, username, password_hash, created_at FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                }
            )
            .optional()?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_and_list_in_order() {
        let store = SqliteStore::in_memory("general").unwrap();
        for content in ["first", "second", "third"] {
            store.append(1, Role::User, Some("alice"), content).await.unwrap();
        }
        store.append(1, Role::Bot, Some("LLM Bot"), "fourth").await.unwrap();

        let listed = store.list(1, 50, None).await.unwrap();
        let contents: Vec<&str> = listed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second", "third", "fourth"]);
        assert_eq!(listed[3].role, Role::Bot);
        assert_eq!(listed[0].author.as_deref(), Some("alice"));
        assert!(listed.iter().all(|m| m.room_id == 1));
    }

    #[tokio::test]
    async fn limit_and_before_id() {
        let store = SqliteStore::in_memory("general").unwrap();
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(store.append(1, Role::User, None, &format!("m{}", i)).await.unwrap().id);
        }

        let latest = store.list(1, 3, None).await.unwrap();
        assert_eq!(latest.iter().map(|m| m.id).collect::<Vec<_>>(), &ids[7..]);

        let older = store.list(1, 3, Some(ids[7])).await.unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), &ids[4..7]);

        let oldest = store.list(1, 100, Some(ids[1])).await.unwrap();
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].content, "m0");
    }

    #[tokio::test]
    async fn unknown_room() {
        let store = SqliteStore::in_memory("general").unwrap();
        assert!(matches!(store.list(99, 10, None).await, Err(ChatError::NotFound(_))));
        // foreign key violation
        assert!(matches!(
            store.append(99, Role::User, None, "hi").await,
            Err(ChatError::Storage(_))
        ));
        assert!(store.find_room(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rooms_are_unique_by_name() {
        let store = SqliteStore::in_memory("general").unwrap();
        let random = store.create_room("random").await.unwrap();
        assert_eq!(random.id, 2);
        assert!(matches!(store.create_room("random").await, Err(ChatError::Conflict(_))));
        assert!(matches!(store.create_room("  ").await, Err(ChatError::InvalidInput(_))));

        let names: Vec<String> = store.list_rooms().await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["general", "random"]);
    }

    #[tokio::test]
    async fn users_round_trip_and_conflict() {
        let store = SqliteStore::in_memory("general").unwrap();
        let alice = store.create_user("alice", "sha256$abc").await.unwrap();
        let found = store.find_user("alice").await.unwrap().unwrap();
        assert_eq!(found.id, alice.id);
        assert_eq!(found.password_hash, "sha256$abc");
        assert!(matches!(store.create_user("alice", "x").await, Err(ChatError::Conflict(_))));
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("chat.db");

        {
            let store = SqliteStore::open(&path, "general").unwrap();
            store.create_room("ops").await.unwrap();
            store.append(1, Role::User, Some("alice"), "persist me").await.unwrap();
        }

        let store = SqliteStore::open(&path, "renamed").unwrap();
        let messages = store.list(1, 10, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "persist me");

        let room = store.find_room(1).await.unwrap().unwrap();
        assert_eq!(room.name, "general");
        assert_eq!(store.list_rooms().await.unwrap().len(), 2);
    }

    #[test]
    fn invalid_default_room_is_a_config_error() {
        assert!(matches!(SqliteStore::in_memory("   "), Err(ChatError::Config(_))));
        assert!(matches!(SqliteStore::in_memory(&"x".repeat(100)), Err(ChatError::Config(_))));
    }
}
