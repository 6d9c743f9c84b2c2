use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub const GENERAL_ROOM_ID: &str = "00000000-0000-0000-0000-000000000001";

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (chat schema)");
        conn.execute_batch(
            "
            CREATE TABLE profiles (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL
            );

            CREATE TABLE chat_rooms (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE chat_messages (
                id          TEXT PRIMARY KEY,
                room_id     TEXT NOT NULL REFERENCES chat_rooms(id),
                user_id     TEXT NOT NULL,
                message     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_chat_messages_room
                ON chat_messages(room_id, created_at);

            -- Seed the default general room
            INSERT INTO chat_rooms (id, name, description)
                VALUES ('00000000-0000-0000-0000-000000000001', 'general', 'Talk about anything');

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (read watermarks)");
        conn.execute_batch(
            "
            CREATE TABLE watermarks (
                user_id     TEXT NOT NULL,
                room_id     TEXT NOT NULL,
                read_at     TEXT NOT NULL,
                PRIMARY KEY (user_id, room_id)
            );

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
