use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            user_id         TEXT PRIMARY KEY,
            chat_user_id    TEXT NOT NULL UNIQUE,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS appointments (
            appointment_id      TEXT PRIMARY KEY,
            chat_thread_id      TEXT NOT NULL,
            moderator_user_id   TEXT NOT NULL,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS appointment_users (
            appointment_id  TEXT NOT NULL REFERENCES appointments(appointment_id),
            user_id         TEXT NOT NULL REFERENCES users(user_id),
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (appointment_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS threads (
            id          TEXT PRIMARY KEY,
            topic       TEXT NOT NULL DEFAULT '',
            version     INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS thread_members (
            thread_id       TEXT NOT NULL REFERENCES threads(id),
            chat_user_id    TEXT NOT NULL,
            display_name    TEXT NOT NULL,
            role            TEXT NOT NULL DEFAULT 'user',
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (thread_id, chat_user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id                    TEXT PRIMARY KEY,
            thread_id             TEXT NOT NULL REFERENCES threads(id),
            sender_id             TEXT NOT NULL,
            sender_display_name   TEXT NOT NULL,
            message_type          TEXT NOT NULL DEFAULT 'text',
            content               TEXT NOT NULL,
            created_on            TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages(thread_id, created_on);

        CREATE TABLE IF NOT EXISTS read_receipts (
            thread_id   TEXT NOT NULL REFERENCES threads(id),
            reader_id   TEXT NOT NULL,
            message_id  TEXT NOT NULL,
            read_on     TEXT NOT NULL,
            PRIMARY KEY (thread_id, reader_id)
        );

        CREATE TABLE IF NOT EXISTS files (
            id                TEXT PRIMARY KEY,
            group_id          TEXT NOT NULL,
            name              TEXT NOT NULL,
            upload_date_time  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_files_group
            ON files(group_id, upload_date_time);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
