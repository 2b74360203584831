use crate::errors::{AppError, AppResult};
use crate::models::{Message, Role, ThreadRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Chat history persistence. The thread registry writes through to it and
/// reloads from it on startup.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_thread(&self, thread: &ThreadRecord) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO threads (id, display_name, name_locked, created_at, last_message_time)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               display_name = excluded.display_name,
               name_locked = excluded.name_locked,
               last_message_time = excluded.last_message_time",
            params![
                thread.id,
                thread.display_name,
                thread.name_locked,
                thread.created_at.to_rfc3339(),
                thread.last_message_time.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_message(&self, message: &Message) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO messages (id, thread_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.thread_id,
                message.role.as_str(),
                message.content,
                message.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_threads(&self) -> AppResult<Vec<ThreadRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(
            "SELECT id, display_name, name_locked, created_at, last_message_time
             FROM threads ORDER BY created_at ASC",
        )?;
        let rows = statement.query_map([], parse_thread_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn load_messages(&self, thread_id: &str) -> AppResult<Vec<Message>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(
            "SELECT id, thread_id, role, content, created_at
             FROM messages WHERE thread_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = statement.query_map([thread_id], parse_message_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

fn parse_thread_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadRecord> {
    Ok(ThreadRecord {
        id: row.get(0)?,
        display_name: row.get(1)?,
        name_locked: row.get(2)?,
        created_at: parse_time(&row.get::<_, String>(3)?)?,
        last_message_time: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        role: parse_role(&row.get::<_, String>(2)?)?,
        content: row.get(3)?,
        timestamp: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_role(raw: &str) -> rusqlite::Result<Role> {
    Role::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown role '{}'", raw),
            )),
        )
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::models::{Message, Role, ThreadRecord};
    use chrono::Utc;

    fn thread(id: &str) -> ThreadRecord {
        let now = Utc::now();
        ThreadRecord {
            id: id.to_string(),
            display_name: "New Conversation".to_string(),
            name_locked: false,
            created_at: now,
            last_message_time: now,
        }
    }

    #[test]
    fn database_can_store_and_reload_thread_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("chat.db");
        let db = Database::new(&db_path).expect("db");

        db.upsert_thread(&thread("t1")).expect("insert thread");
        for (index, content) in ["hello", "hi there"].iter().enumerate() {
            db.insert_message(&Message {
                id: format!("m{}", index),
                role: if index == 0 { Role::User } else { Role::Assistant },
                content: content.to_string(),
                thread_id: "t1".to_string(),
                timestamp: Utc::now(),
            })
            .expect("insert message");
        }

        let reopened = Database::new(&db_path).expect("reopen");
        let threads = reopened.load_threads().expect("threads");
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, "t1");
        let messages = reopened.load_messages("t1").expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "hi there");
    }

    #[test]
    fn upsert_updates_name_and_activity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("chat.db")).expect("db");
        let mut record = thread("t1");
        db.upsert_thread(&record).expect("insert");
        record.display_name = "How do I create a table?".to_string();
        record.name_locked = true;
        db.upsert_thread(&record).expect("update");

        let threads = db.load_threads().expect("threads");
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].display_name, "How do I create a table?");
        assert!(threads[0].name_locked);
    }

    #[test]
    fn duplicate_message_ids_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("chat.db")).expect("db");
        db.upsert_thread(&thread("t1")).expect("thread");
        let message = Message {
            id: "m1".to_string(),
            role: Role::Assistant,
            content: "done".to_string(),
            thread_id: "t1".to_string(),
            timestamp: Utc::now(),
        };
        db.insert_message(&message).expect("first");
        db.insert_message(&message).expect("second");
        assert_eq!(db.load_messages("t1").expect("messages").len(), 1);
    }
}
