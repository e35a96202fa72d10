use crate::{
    chat::{MessageRecord, OutgoingMessage, ThreadSummary},
    entity::{Session, UserProfile},
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, created_at";

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Open a private in-memory database.
    ///
    /// The pool is pinned to one connection that never expires, otherwise the
    /// database would vanish with the connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Ok(Self { pool })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                avatar_url TEXT,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                expires_at DATETIME,
                revoked INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                sender_id TEXT NOT NULL REFERENCES users(id),
                receiver_id TEXT NOT NULL REFERENCES users(id),
                content TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                idempotency_key TEXT,
                UNIQUE (sender_id, idempotency_key)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_pair_created
                ON messages(sender_id, receiver_id, created_at DESC, seq DESC);

            CREATE TABLE IF NOT EXISTS thread_index (
                user_a TEXT NOT NULL,
                user_b TEXT NOT NULL,
                last_message_id TEXT NOT NULL,
                last_message TEXT NOT NULL,
                last_message_at DATETIME NOT NULL,
                last_seq INTEGER NOT NULL,
                PRIMARY KEY (user_a, user_b)
            );
            CREATE INDEX IF NOT EXISTS idx_thread_index_user_b ON thread_index(user_b);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.pool
            .acquire()
            .await
            .context("Failed to acquire database connection")?;
        Ok(())
    }

    /// Save or update a user profile.
    pub async fn save_user(&self, user: &UserProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, display_name, avatar_url, active)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                avatar_url = excluded.avatar_url,
                active = excluded.active
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.display_name)
        .bind(&user.avatar_url)
        .bind(user.active)
        .execute(&self.pool)
        .await
        .context("Failed to save user")?;

        Ok(())
    }

    /// Whether `id` names an active user.
    pub async fn user_exists(&self, id: Uuid) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM users WHERE id = ? AND active = 1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("Failed to look up user")?;

        Ok(found.is_some())
    }

    pub async fn save_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (token, user_id, expires_at, revoked)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(token) DO UPDATE SET
                user_id = excluded.user_id,
                expires_at = excluded.expires_at,
                revoked = excluded.revoked
            "#,
        )
        .bind(&session.token)
        .bind(session.user_id.to_string())
        .bind(session.expires_at)
        .bind(session.revoked)
        .execute(&self.pool)
        .await
        .context("Failed to save session")?;

        Ok(())
    }

    /// Look up a bearer token. Sessions of deactivated users are not returned.
    pub async fn find_session(&self, token: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT s.token, s.user_id, s.expires_at, s.revoked
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token = ? AND u.active = 1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up session")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Session {
            token: row.try_get("token")?,
            user_id: uuid_column(&row, "user_id")?,
            expires_at: row.try_get("expires_at")?,
            revoked: row.try_get("revoked")?,
        }))
    }

    /// Persist a new message and fold it into the thread index.
    ///
    /// When `idempotency_key` matches an earlier message from the same sender,
    /// that message is returned as stored and nothing is written. It may differ
    /// from `msg`; callers decide whether that is a replay or a conflict.
    pub async fn create_message(
        &self,
        msg: &OutgoingMessage,
        idempotency_key: Option<&str>,
    ) -> Result<MessageRecord> {
        if let Some(key) = idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(msg.sender_id, key).await? {
                return Ok(existing);
            }
        }

        let record = MessageRecord {
            id: Uuid::new_v4(),
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            content: msg.content.clone(),
            created_at: Utc::now(),
        };

        match (self.insert_message(&record, idempotency_key).await, idempotency_key) {
            (Ok(()), _) => Ok(record),
            (Err(err), Some(key)) if is_unique_violation(&err) => {
                // A concurrent request with the same key won the insert.
                self.find_by_idempotency_key(msg.sender_id, key)
                    .await?
                    .context("Idempotency key conflict without a stored message")
            }
            (Err(err), _) => Err(err),
        }
    }

    async fn insert_message(&self, record: &MessageRecord, idempotency_key: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let seq = sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, receiver_id, content, created_at, idempotency_key)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.sender_id.to_string())
        .bind(record.receiver_id.to_string())
        .bind(&record.content)
        .bind(record.created_at)
        .bind(idempotency_key)
        .execute(&mut *tx)
        .await
        .context("Failed to save message")?
        .last_insert_rowid();

        let (user_a, user_b) = pair_key(record.sender_id, record.receiver_id);

        sqlx::query(
            r#"
            INSERT INTO thread_index (user_a, user_b, last_message_id, last_message, last_message_at, last_seq)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_a, user_b) DO UPDATE SET
                last_message_id = excluded.last_message_id,
                last_message = excluded.last_message,
                last_message_at = excluded.last_message_at,
                last_seq = excluded.last_seq
            WHERE excluded.last_message_at > thread_index.last_message_at
               OR (excluded.last_message_at = thread_index.last_message_at
                   AND excluded.last_seq > thread_index.last_seq)
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .bind(record.id.to_string())
        .bind(&record.content)
        .bind(record.created_at)
        .bind(seq)
        .execute(&mut *tx)
        .await
        .context("Failed to update thread index")?;

        tx.commit().await.context("Failed to commit message")?;

        Ok(())
    }

    pub async fn find_by_idempotency_key(
        &self,
        sender_id: Uuid,
        key: &str,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE sender_id = ? AND idempotency_key = ?",
            MESSAGE_COLUMNS
        ))
        .bind(sender_id.to_string())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up idempotency key")?;

        row.as_ref().map(message_from_row).transpose()
    }

    /// One summary per counterpart of `user_id`, most recently active first.
    pub async fn list_threads(&self, user_id: Uuid) -> Result<Vec<ThreadSummary>> {
        let user = user_id.to_string();

        let rows = sqlx::query(
            r#"
            SELECT
                CASE WHEN t.user_a = ? THEN t.user_b ELSE t.user_a END AS other_user_id,
                u.display_name AS other_user_name,
                u.avatar_url AS other_user_avatar,
                t.last_message,
                t.last_message_at
            FROM thread_index t
            LEFT JOIN users u
                ON u.id = CASE WHEN t.user_a = ? THEN t.user_b ELSE t.user_a END
            WHERE t.user_a = ? OR t.user_b = ?
            ORDER BY t.last_message_at DESC, t.last_seq DESC
            "#,
        )
        .bind(&user)
        .bind(&user)
        .bind(&user)
        .bind(&user)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch threads")?;

        let mut threads = Vec::with_capacity(rows.len());

        for row in rows {
            let name: Option<String> = row.try_get("other_user_name")?;
            threads.push(ThreadSummary {
                other_user_id: uuid_column(&row, "other_user_id")?,
                // Profile rows can be purged upstream; keep the thread visible.
                other_user_name: name.unwrap_or_else(|| "Unknown user".to_string()),
                other_user_avatar: row.try_get("other_user_avatar")?,
                last_message: row.try_get("last_message")?,
                last_message_at: row.try_get("last_message_at")?,
            });
        }

        Ok(threads)
    }

    /// Retrieve the conversation between two users.
    /// Returns the newest `limit` messages (or all of them) ordered oldest to
    /// newest, together with the untruncated conversation size.
    pub async fn conversation(
        &self,
        user_id: Uuid,
        other_user_id: Uuid,
        limit: Option<u32>,
    ) -> Result<(Vec<MessageRecord>, i64)> {
        let (me, other) = (user_id.to_string(), other_user_id.to_string());
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, i64::from);

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE (sender_id = ? AND receiver_id = ?)
               OR (sender_id = ? AND receiver_id = ?)
            "#,
        )
        .bind(&me)
        .bind(&other)
        .bind(&other)
        .bind(&me)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to count conversation")?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM messages
            WHERE (sender_id = ? AND receiver_id = ?)
               OR (sender_id = ? AND receiver_id = ?)
            ORDER BY created_at DESC, seq DESC
            LIMIT ?
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(&me)
        .bind(&other)
        .bind(&other)
        .bind(&me)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to fetch conversation")?;

        tx.commit().await.context("Failed to finish conversation read")?;

        let mut messages = rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?;

        // Return in chronological order (oldest -> newest)
        messages.reverse();

        Ok((messages, total))
    }

    /// Recompute the thread index from the message table.
    /// Returns the number of threads written.
    pub async fn rebuild_thread_index(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM thread_index")
            .execute(&mut *tx)
            .await
            .context("Failed to clear thread index")?;

        let written = sqlx::query(
            r#"
            INSERT INTO thread_index (user_a, user_b, last_message_id, last_message, last_message_at, last_seq)
            SELECT user_a, user_b, id, content, created_at, seq
            FROM (
                SELECT
                    MIN(sender_id, receiver_id) AS user_a,
                    MAX(sender_id, receiver_id) AS user_b,
                    id, content, created_at, seq,
                    ROW_NUMBER() OVER (
                        PARTITION BY MIN(sender_id, receiver_id), MAX(sender_id, receiver_id)
                        ORDER BY created_at DESC, seq DESC
                    ) AS rn
                FROM messages
            )
            WHERE rn = 1
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("Failed to rebuild thread index")?
        .rows_affected();

        tx.commit().await.context("Failed to commit thread index")?;

        Ok(written)
    }
}

/// Unordered pair key: the lexicographically smaller id comes first.
fn pair_key(a: Uuid, b: Uuid) -> (String, String) {
    let (a, b) = (a.to_string(), b.to_string());
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn uuid_column(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).with_context(|| format!("Invalid UUID in column {}", column))
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(MessageRecord {
        id: uuid_column(row, "id")?,
        sender_id: uuid_column(row, "sender_id")?,
        receiver_id: uuid_column(row, "receiver_id")?,
        content: row.try_get("content")?,
        created_at,
    })
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .map_or(false, |db| db.is_unique_violation())
    })
}
