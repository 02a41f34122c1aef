use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::Database;
use crate::models::{
    AppointmentRow, FileRow, MessageRow, NewMessage, ReadReceiptRow, ThreadMemberRow, ThreadRow,
    UserRow,
};

impl Database {
    // -- Users --

    /// Lazily create the external-id → chat-id mapping. Returns false when
    /// the user already existed (the stored mapping wins).
    pub fn create_user_if_absent(&self, user_id: &str, chat_user_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (user_id, chat_user_id) VALUES (?1, ?2)",
                (user_id, chat_user_id.to_string()),
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, user_id))
    }

    // -- Appointments --

    /// Conditional insert backing the bootstrap transition: exactly one
    /// caller wins the race to bind a group to a chat thread. Returns true
    /// when this call created the appointment.
    pub fn insert_appointment_if_absent(
        &self,
        appointment_id: &str,
        chat_thread_id: Uuid,
        moderator_user_id: Uuid,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO appointments (appointment_id, chat_thread_id, moderator_user_id)
                 VALUES (?1, ?2, ?3)",
                (
                    appointment_id,
                    chat_thread_id.to_string(),
                    moderator_user_id.to_string(),
                ),
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn get_appointment(&self, appointment_id: &str) -> Result<Option<AppointmentRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT appointment_id, chat_thread_id, moderator_user_id
                     FROM appointments WHERE appointment_id = ?1",
                    [appointment_id],
                    |row| {
                        Ok(AppointmentRow {
                            appointment_id: row.get(0)?,
                            chat_thread_id: row.get(1)?,
                            moderator_user_id: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Idempotent join record. Returns false when the user was already
    /// associated with the group.
    pub fn add_appointment_user(&self, appointment_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO appointment_users (appointment_id, user_id) VALUES (?1, ?2)",
                (appointment_id, user_id),
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn appointment_user_exists(&self, appointment_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM appointment_users WHERE appointment_id = ?1 AND user_id = ?2",
                    (appointment_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Threads --

    pub fn create_thread(&self, id: Uuid, topic: &str, created_at: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO threads (id, topic, version, created_at) VALUES (?1, ?2, 0, ?3)",
                (id.to_string(), topic, created_at.to_rfc3339()),
            )?;
            Ok(())
        })
    }

    pub fn get_thread(&self, id: Uuid) -> Result<Option<ThreadRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, topic, version, created_at FROM threads WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok(ThreadRow {
                            id: row.get(0)?,
                            topic: row.get(1)?,
                            version: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Removes a thread and its membership — used when a bootstrap loser
    /// discards the thread it created before noticing the winner.
    pub fn delete_thread(&self, id: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            let id = id.to_string();
            conn.execute("DELETE FROM thread_members WHERE thread_id = ?1", [&id])?;
            conn.execute("DELETE FROM threads WHERE id = ?1", [&id])?;
            Ok(())
        })
    }

    /// Adds a member and bumps the thread version. Idempotent: re-adding an
    /// existing member changes nothing and leaves the version alone.
    pub fn add_thread_member(
        &self,
        thread_id: Uuid,
        chat_user_id: Uuid,
        display_name: &str,
        role: &str,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO thread_members (thread_id, chat_user_id, display_name, role)
                 VALUES (?1, ?2, ?3, ?4)",
                (
                    thread_id.to_string(),
                    chat_user_id.to_string(),
                    display_name,
                    role,
                ),
            )?;
            if inserted > 0 {
                conn.execute(
                    "UPDATE threads SET version = version + 1 WHERE id = ?1",
                    [thread_id.to_string()],
                )?;
            }
            Ok(inserted > 0)
        })
    }

    pub fn list_thread_members(&self, thread_id: Uuid) -> Result<Vec<ThreadMemberRow>> {
        self.with_conn(|conn| query_thread_members(conn, thread_id))
    }

    pub fn is_thread_member(&self, thread_id: Uuid, chat_user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM thread_members WHERE thread_id = ?1 AND chat_user_id = ?2",
                    (thread_id.to_string(), chat_user_id.to_string()),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Messages --

    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, thread_id, sender_id, sender_display_name, message_type, content, created_on)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                (
                    msg.id.to_string(),
                    msg.thread_id.to_string(),
                    msg.sender_id.to_string(),
                    msg.sender_display_name,
                    msg.message_type.as_str(),
                    msg.content,
                    msg.created_on.to_rfc3339(),
                ),
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, thread_id: Uuid, message_id: Uuid) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, thread_id, sender_id, sender_display_name, message_type, content, created_on
                     FROM messages WHERE thread_id = ?1 AND id = ?2",
                    (thread_id.to_string(), message_id.to_string()),
                    map_message_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Newest-first page of messages for a thread.
    pub fn list_messages(&self, thread_id: Uuid, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, sender_id, sender_display_name, message_type, content, created_on
                 FROM messages
                 WHERE thread_id = ?1
                 ORDER BY created_on DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map((thread_id.to_string(), limit), map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Read receipts --

    /// Latest read position per reader; later receipts overwrite earlier.
    pub fn upsert_read_receipt(
        &self,
        thread_id: Uuid,
        reader_id: Uuid,
        message_id: Uuid,
        read_on: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO read_receipts (thread_id, reader_id, message_id, read_on)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (thread_id, reader_id) DO UPDATE SET
                     message_id = excluded.message_id,
                     read_on = excluded.read_on",
                (
                    thread_id.to_string(),
                    reader_id.to_string(),
                    message_id.to_string(),
                    read_on.to_rfc3339(),
                ),
            )?;
            Ok(())
        })
    }

    pub fn list_read_receipts(&self, thread_id: Uuid) -> Result<Vec<ReadReceiptRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT reader_id, message_id, read_on FROM read_receipts WHERE thread_id = ?1",
            )?;
            let rows = stmt
                .query_map([thread_id.to_string()], |row| {
                    Ok(ReadReceiptRow {
                        reader_id: row.get(0)?,
                        message_id: row.get(1)?,
                        read_on: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Files --

    pub fn insert_file(
        &self,
        group_id: &str,
        file_id: Uuid,
        name: &str,
        upload_date_time: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO files (id, group_id, name, upload_date_time) VALUES (?1, ?2, ?3, ?4)",
                (
                    file_id.to_string(),
                    group_id,
                    name,
                    upload_date_time.to_rfc3339(),
                ),
            )?;
            Ok(())
        })
    }

    pub fn get_file(&self, group_id: &str, file_id: Uuid) -> Result<Option<FileRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, group_id, name, upload_date_time
                     FROM files WHERE group_id = ?1 AND id = ?2",
                    (group_id, file_id.to_string()),
                    map_file_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Per-group file metadata, newest upload first.
    pub fn list_files(&self, group_id: &str) -> Result<Vec<FileRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, group_id, name, upload_date_time
                 FROM files
                 WHERE group_id = ?1
                 ORDER BY upload_date_time DESC",
            )?;
            let rows = stmt
                .query_map([group_id], map_file_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_user(conn: &Connection, user_id: &str) -> Result<Option<UserRow>> {
    let row = conn
        .query_row(
            "SELECT user_id, chat_user_id, created_at FROM users WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok(UserRow {
                    user_id: row.get(0)?,
                    chat_user_id: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn query_thread_members(conn: &Connection, thread_id: Uuid) -> Result<Vec<ThreadMemberRow>> {
    let mut stmt = conn.prepare(
        "SELECT chat_user_id, display_name, role FROM thread_members WHERE thread_id = ?1",
    )?;
    let rows = stmt
        .query_map([thread_id.to_string()], |row| {
            Ok(ThreadMemberRow {
                chat_user_id: row.get(0)?,
                display_name: row.get(1)?,
                role: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_display_name: row.get(3)?,
        message_type: row.get(4)?,
        content: row.get(5)?,
        created_on: row.get(6)?,
    })
}

fn map_file_row(row: &rusqlite::Row<'_>) -> std::result::Result<FileRow, rusqlite::Error> {
    Ok(FileRow {
        id: row.get(0)?,
        group_id: row.get(1)?,
        name: row.get(2)?,
        upload_date_time: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parley_types::models::MemberRole;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&dir.path().join("test.db")).expect("open db");
        (dir, db)
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn appointment_insert_is_create_if_absent() {
        let (_dir, db) = open_db();

        let first_thread = Uuid::new_v4();
        let second_thread = Uuid::new_v4();

        assert!(
            db.insert_appointment_if_absent("g1", first_thread, Uuid::new_v4())
                .unwrap()
        );
        // A concurrent second bootstrapper loses the race.
        assert!(
            !db.insert_appointment_if_absent("g1", second_thread, Uuid::new_v4())
                .unwrap()
        );

        let stored = db.get_appointment("g1").unwrap().expect("appointment");
        assert_eq!(stored.chat_thread_id, first_thread.to_string());
    }

    #[test]
    fn appointment_user_is_idempotent() {
        let (_dir, db) = open_db();

        db.insert_appointment_if_absent("g1", Uuid::new_v4(), Uuid::new_v4())
            .unwrap();
        db.create_user_if_absent("alice", Uuid::new_v4()).unwrap();

        assert!(db.add_appointment_user("g1", "alice").unwrap());
        assert!(!db.add_appointment_user("g1", "alice").unwrap());
        assert!(db.appointment_user_exists("g1", "alice").unwrap());
        assert!(!db.appointment_user_exists("g1", "bob").unwrap());
    }

    #[test]
    fn adding_member_bumps_thread_version_once() {
        let (_dir, db) = open_db();

        let thread_id = Uuid::new_v4();
        let member = Uuid::new_v4();
        db.create_thread(thread_id, "call", ts(0)).unwrap();

        assert!(
            db.add_thread_member(thread_id, member, "alice", MemberRole::User.as_str())
                .unwrap()
        );
        // Re-adding is a no-op and must not bump the version again.
        assert!(
            !db.add_thread_member(thread_id, member, "alice", MemberRole::User.as_str())
                .unwrap()
        );

        let thread = db.get_thread(thread_id).unwrap().expect("thread");
        assert_eq!(thread.version, 1);
        assert!(db.is_thread_member(thread_id, member).unwrap());
    }

    #[test]
    fn message_roundtrip_preserves_created_on() {
        let (_dir, db) = open_db();

        let thread_id = Uuid::new_v4();
        db.create_thread(thread_id, "", ts(0)).unwrap();

        let id = Uuid::new_v4();
        let created = ts(100);
        db.insert_message(&NewMessage {
            id,
            thread_id,
            sender_id: Uuid::new_v4(),
            sender_display_name: "Alice",
            message_type: parley_types::models::MessageType::Text,
            content: "hello",
            created_on: created,
        })
        .unwrap();

        let msg = db
            .get_message(thread_id, id)
            .unwrap()
            .expect("message")
            .into_message()
            .unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.created_on, created);
    }

    #[test]
    fn messages_list_newest_first() {
        let (_dir, db) = open_db();

        let thread_id = Uuid::new_v4();
        db.create_thread(thread_id, "", ts(0)).unwrap();
        for i in 0..3 {
            db.insert_message(&NewMessage {
                id: Uuid::new_v4(),
                thread_id,
                sender_id: Uuid::new_v4(),
                sender_display_name: "Alice",
                message_type: parley_types::models::MessageType::Text,
                content: &format!("m{}", i),
                created_on: ts(100 + i),
            })
            .unwrap();
        }

        let rows = db.list_messages(thread_id, 10).unwrap();
        let contents: Vec<_> = rows.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m1", "m0"]);
    }

    #[test]
    fn read_receipt_upsert_keeps_latest() {
        let (_dir, db) = open_db();

        let thread_id = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let (m1, m2) = (Uuid::new_v4(), Uuid::new_v4());
        db.create_thread(thread_id, "", ts(0)).unwrap();

        db.upsert_read_receipt(thread_id, reader, m1, ts(10)).unwrap();
        db.upsert_read_receipt(thread_id, reader, m2, ts(20)).unwrap();

        let receipts = db.list_read_receipts(thread_id).unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].message_id, m2.to_string());
    }

    #[test]
    fn files_list_newest_upload_first() {
        let (_dir, db) = open_db();

        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        db.insert_file("g1", old, "old.png", ts(100)).unwrap();
        db.insert_file("g1", new, "new.png", ts(200)).unwrap();
        db.insert_file("g2", Uuid::new_v4(), "other.png", ts(300)).unwrap();

        let files = db.list_files("g1").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].id, new.to_string());
        assert_eq!(files[1].id, old.to_string());
    }
}
