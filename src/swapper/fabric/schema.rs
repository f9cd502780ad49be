// Queue fabric schema

use super::fabric_error;
use crate::swapper::error::Result;
use rusqlite::Connection;

const CREATE_QUEUES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queues (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
)
"#;

/// `consumer_tag` is NULL while a message is ready and holds the tag of the
/// consumer it is delivered to until acked or released.
const CREATE_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    body BLOB NOT NULL,
    persistent INTEGER NOT NULL,
    consumer_tag TEXT,
    delivery_count INTEGER NOT NULL DEFAULT 0,
    published_at INTEGER NOT NULL,
    FOREIGN KEY (queue) REFERENCES queues(name) ON DELETE CASCADE
)
"#;

const CREATE_MESSAGES_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_queue_ready
ON messages(queue, consumer_tag, id)
"#;

const CREATE_CONSUMERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS consumers (
    tag TEXT PRIMARY KEY,
    queue TEXT NOT NULL,
    pid INTEGER NOT NULL,
    started_at INTEGER NOT NULL
)
"#;

/// Create all tables and indexes if they do not exist yet.
pub fn initialize(conn: &Connection) -> Result<()> {
    for statement in [
        CREATE_QUEUES_TABLE,
        CREATE_MESSAGES_TABLE,
        CREATE_MESSAGES_INDEX,
        CREATE_CONSUMERS_TABLE,
    ] {
        conn.execute(statement, [])
            .map_err(fabric_error("initialize schema"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();

        let result = initialize(&conn);
        assert!(result.is_ok(), "Schema initialization failed: {result:?}");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"queues".to_string()));
        assert!(tables.contains(&"messages".to_string()));
        assert!(tables.contains(&"consumers".to_string()));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
    }

    #[test]
    fn test_deleting_queue_cascades_to_messages() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        initialize(&conn).unwrap();

        conn.execute("INSERT INTO queues (name, created_at) VALUES ('q', 0)", [])
            .unwrap();
        conn.execute(
            "INSERT INTO messages (queue, body, persistent, published_at) VALUES ('q', x'00', 1, 0)",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM queues WHERE name = 'q'", []).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
