use crate::models::{MessageRow, RoomRow, UnreadRow};
use crate::Database;
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Profiles --

    pub fn create_profile(&self, id: &str, name: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                (id, name),
            )?;
            Ok(())
        })
    }

    pub fn get_profile_name(&self, id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT name FROM profiles WHERE id = ?1", [id], |row| row.get(0))
                .optional()
        })
    }

    pub fn get_profile_id_by_name(&self, name: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT id FROM profiles WHERE name = ?1", [name], |row| row.get(0))
                .optional()
        })
    }

    // -- Rooms --

    pub fn create_room(&self, id: &str, name: &str, description: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO chat_rooms (id, name, description) VALUES (?1, ?2, ?3)",
                (id, name, description),
            )?;
            Ok(())
        })
    }

    pub fn list_rooms(&self) -> Result<Vec<RoomRow>> {
        self.with_conn(query_rooms)
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        room_id: &str,
        user_id: &str,
        message: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO chat_messages (id, room_id, user_id, message, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, room_id, user_id, message, created_at],
            )?;
            Ok(())
        })
    }

    /// Most recent `limit` messages of a room, returned oldest first.
    pub fn get_recent_messages(&self, room_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_recent_messages(conn, room_id, limit))
    }

    /// Deletes a message only when `user_id` is its author. Returns the
    /// removed row, or `None` when nothing matched.
    pub fn delete_message(&self, id: &str, user_id: &str) -> Result<Option<MessageRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row = query_message(&tx, id)?;
            let row = match row {
                Some(row) if row.user_id == user_id => row,
                _ => return Ok(None),
            };
            tx.execute("DELETE FROM chat_messages WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(Some(row))
        })
    }

    /// Messages in a room not written by `exclude_user`, optionally limited
    /// to those created strictly after `after`.
    pub fn get_unread_messages(
        &self,
        room_id: &str,
        exclude_user: &str,
        after: Option<&str>,
    ) -> Result<Vec<UnreadRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at FROM chat_messages
                 WHERE room_id = ?1
                   AND user_id != ?2
                   AND (?3 IS NULL OR created_at > ?3)
                 ORDER BY created_at ASC",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![room_id, exclude_user, after], |row| {
                    Ok(UnreadRow {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Watermarks --

    pub fn get_watermark(&self, user_id: &str, room_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT read_at FROM watermarks WHERE user_id = ?1 AND room_id = ?2",
                [user_id, room_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Every (room_id, read_at) the user has stamped.
    pub fn list_watermarks(&self, user_id: &str) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT room_id, read_at FROM watermarks WHERE user_id = ?1")?;
            let rows = stmt
                .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Unconditional overwrite: a later call always wins, even with an
    /// earlier timestamp.
    pub fn set_watermark(&self, user_id: &str, room_id: &str, read_at: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO watermarks (user_id, room_id, read_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, room_id) DO UPDATE SET read_at = excluded.read_at",
                [user_id, room_id, read_at],
            )?;
            Ok(())
        })
    }
}

fn query_rooms(conn: &Connection) -> Result<Vec<RoomRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, created_at FROM chat_rooms ORDER BY created_at, name",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok(RoomRow {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    conn.query_row(
        "SELECT m.id, m.room_id, m.user_id, p.name, m.message, m.created_at
         FROM chat_messages m
         LEFT JOIN profiles p ON m.user_id = p.id
         WHERE m.id = ?1",
        [id],
        message_row,
    )
    .optional()
}

fn query_recent_messages(conn: &Connection, room_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
    // JOIN profiles to fetch sender names in a single query.
    // rowid breaks created_at ties in insertion order.
    let mut stmt = conn.prepare(
        "SELECT id, room_id, user_id, name, message, created_at FROM (
             SELECT m.rowid AS seq, m.id, m.room_id, m.user_id, p.name, m.message, m.created_at
             FROM chat_messages m
             LEFT JOIN profiles p ON m.user_id = p.id
             WHERE m.room_id = ?1
             ORDER BY m.created_at DESC, m.rowid DESC
             LIMIT ?2
         )
         ORDER BY created_at ASC, seq ASC",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![room_id, limit], message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        user_id: row.get(2)?,
        sender_name: row.get(3)?,
        message: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::migrations::GENERAL_ROOM_ID;
    use crate::Database;

    const ALICE: &str = "00000000-0000-0000-0000-00000000000a";
    const BOB: &str = "00000000-0000-0000-0000-00000000000b";

    fn ts(minute: u32) -> String {
        format!("2024-03-01T10:{:02}:00.000000Z", minute)
    }

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_profile(ALICE, "alice").unwrap();
        db.create_profile(BOB, "bob").unwrap();
        db
    }

    #[test]
    fn recent_messages_are_the_newest_in_ascending_order() {
        let db = seeded();
        for minute in 0..5 {
            let id = format!("00000000-0000-0000-0000-0000000001{:02}", minute);
            db.insert_message(&id, GENERAL_ROOM_ID, ALICE, &format!("m{}", minute), &ts(minute))
                .unwrap();
        }

        let rows = db.get_recent_messages(GENERAL_ROOM_ID, 3).unwrap();
        let bodies: Vec<&str> = rows.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(bodies, vec!["m2", "m3", "m4"]);
        assert_eq!(rows[0].sender_name.as_deref(), Some("alice"));
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let db = seeded();
        db.insert_message("00000000-0000-0000-0000-0000000002ff", GENERAL_ROOM_ID, ALICE, "first", &ts(1))
            .unwrap();
        db.insert_message("00000000-0000-0000-0000-000000000200", GENERAL_ROOM_ID, BOB, "second", &ts(1))
            .unwrap();

        let rows = db.get_recent_messages(GENERAL_ROOM_ID, 10).unwrap();
        assert_eq!(rows[0].message, "first");
        assert_eq!(rows[1].message, "second");
    }

    #[test]
    fn unread_excludes_own_and_older_messages() {
        let db = seeded();
        db.insert_message("00000000-0000-0000-0000-000000000301", GENERAL_ROOM_ID, BOB, "old", &ts(0))
            .unwrap();
        db.insert_message("00000000-0000-0000-0000-000000000302", GENERAL_ROOM_ID, BOB, "new", &ts(1))
            .unwrap();
        db.insert_message("00000000-0000-0000-0000-000000000303", GENERAL_ROOM_ID, ALICE, "mine", &ts(2))
            .unwrap();

        let all = db.get_unread_messages(GENERAL_ROOM_ID, ALICE, None).unwrap();
        assert_eq!(all.len(), 2);

        let after = db.get_unread_messages(GENERAL_ROOM_ID, ALICE, Some(&ts(0))).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, "00000000-0000-0000-0000-000000000302");
    }

    #[test]
    fn watermark_last_write_wins_even_when_earlier() {
        let db = seeded();
        assert_eq!(db.get_watermark(ALICE, GENERAL_ROOM_ID).unwrap(), None);

        db.set_watermark(ALICE, GENERAL_ROOM_ID, &ts(30)).unwrap();
        db.set_watermark(ALICE, GENERAL_ROOM_ID, &ts(10)).unwrap();

        assert_eq!(db.get_watermark(ALICE, GENERAL_ROOM_ID).unwrap(), Some(ts(10)));
        assert_eq!(db.get_watermark(BOB, GENERAL_ROOM_ID).unwrap(), None);

        assert_eq!(
            db.list_watermarks(ALICE).unwrap(),
            vec![(GENERAL_ROOM_ID.to_string(), ts(10))]
        );
        assert!(db.list_watermarks(BOB).unwrap().is_empty());
    }

    #[test]
    fn only_the_author_can_delete() {
        let db = seeded();
        let id = "00000000-0000-0000-0000-000000000401";
        db.insert_message(id, GENERAL_ROOM_ID, ALICE, "hello", &ts(0)).unwrap();

        assert!(db.delete_message(id, BOB).unwrap().is_none());
        let removed = db.delete_message(id, ALICE).unwrap().unwrap();
        assert_eq!(removed.message, "hello");
        assert!(db.get_recent_messages(GENERAL_ROOM_ID, 10).unwrap().is_empty());
        assert!(db.delete_message(id, ALICE).unwrap().is_none());
    }

    #[test]
    fn general_room_is_seeded() {
        let db = Database::open_in_memory().unwrap();
        let rooms = db.list_rooms().unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "general");
    }
}
