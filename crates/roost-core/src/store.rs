// ABOUTME: SQLite-backed storage for sessions, messages and engine lock records
// ABOUTME: Sequence numbers and in-flight uniqueness are enforced by the database, not by callers

use crate::error::{Result, RoostError};
use crate::types::{
    LockRecord, Message, ProviderSnapshot, Role, Session, SessionDefaults, SessionSummary,
};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, SqliteConnection, SqlitePool,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// How long a connection waits on SQLite's write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent storage for sessions. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open or create a session store at the given path
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        // WAL so a terminal process and a web process can share the file
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::debug!(path = %path.display(), "Session store opened");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_active TEXT NOT NULL,
                extensions TEXT NOT NULL DEFAULT '[]',
                provider TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Messages table - (session_id, seq) is the identity of a message
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 1,
                interrupted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (session_id, seq),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one in-flight response per session
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_in_flight ON messages(session_id) WHERE completed = 0 AND interrupted = 0",
        )
        .execute(&self.pool)
        .await?;

        // Engine lock records - one row per session bound to a live engine
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engine_locks (
                session_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                heartbeat_at INTEGER NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_last_active ON sessions(last_active)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Create a session and return its id
    pub async fn create(&self, title: &str, defaults: &SessionDefaults) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let title = match title.trim() {
            "" => format!("session_{}", now.format("%Y%m%d_%H%M%S")),
            t => t.to_string(),
        };
        let extensions = encode_extensions(&defaults.extensions);

        sqlx::query(
            "INSERT INTO sessions (id, title, created_at, last_active, extensions, provider, model) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&title)
        .bind(timestamp(now))
        .bind(timestamp(now))
        .bind(extensions)
        .bind(&defaults.provider.provider)
        .bind(&defaults.provider.model)
        .execute(&self.pool)
        .await?;

        tracing::info!(session_id = %id, title = %title, "Session created");
        Ok(id)
    }

    /// Get a session by id, or None if it doesn't exist
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, title, created_at, last_active, extensions, provider, model FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    /// Get a session by id, failing with `SessionNotFound` if missing
    pub async fn require(&self, session_id: &str) -> Result<Session> {
        self.get(session_id)
            .await?
            .ok_or_else(|| RoostError::SessionNotFound(session_id.to_string()))
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Append a message, assigning the next sequence number atomically.
    ///
    /// The insert computes `MAX(seq) + 1` inside the same statement that takes
    /// SQLite's write lock, so concurrent appends from any number of tasks or
    /// processes serialize and never share a number.
    pub async fn append(
        &self,
        session_id: &str,
        role: Role,
        body: &str,
        completed: bool,
    ) -> Result<i64> {
        let now = timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        let seq = match insert_message(&mut tx, session_id, role, body, completed, &now).await {
            Ok(seq) => seq,
            Err(e) => {
                drop(tx);
                return Err(self.insert_error(session_id, e).await);
            }
        };
        touch_in(&mut tx, session_id, &now).await?;

        tx.commit().await?;
        tracing::debug!(session_id = %session_id, seq, role = %role, completed, "Message appended");
        Ok(seq)
    }

    /// Append a completed user message and the in-flight response that answers it.
    ///
    /// Both rows commit together or not at all, so a rejected turn never
    /// leaves an unanswered user message behind. Returns `(user_seq, response_seq)`.
    pub async fn append_turn(&self, session_id: &str, text: &str) -> Result<(i64, i64)> {
        let now = timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        let inserted = async {
            let user_seq = insert_message(&mut tx, session_id, Role::User, text, true, &now).await?;
            let response_seq =
                insert_message(&mut tx, session_id, Role::Assistant, "", false, &now).await?;
            Ok::<_, InsertError>((user_seq, response_seq))
        }
        .await;
        let (user_seq, response_seq) = match inserted {
            Ok(seqs) => seqs,
            Err(e) => {
                drop(tx);
                return Err(self.insert_error(session_id, e).await);
            }
        };
        touch_in(&mut tx, session_id, &now).await?;

        tx.commit().await?;
        tracing::debug!(session_id = %session_id, user_seq, response_seq, "Turn appended");
        Ok((user_seq, response_seq))
    }

    async fn insert_error(&self, session_id: &str, e: InsertError) -> RoostError {
        match e {
            InsertError::MissingSession => RoostError::SessionNotFound(session_id.to_string()),
            InsertError::Database(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                match self.in_flight(session_id).await {
                    Ok(seq) => RoostError::DuplicateInFlight {
                        session_id: session_id.to_string(),
                        seq: seq.unwrap_or_default(),
                    },
                    Err(e) => e,
                }
            }
            InsertError::Database(e) => e.into(),
        }
    }

    /// Mark the in-flight message complete and replace its body
    pub async fn finalize(&self, session_id: &str, seq: i64, body: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE messages SET body = ?, completed = 1 WHERE session_id = ? AND seq = ? AND completed = 0 AND interrupted = 0",
        )
        .bind(body)
        .bind(session_id)
        .bind(seq)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_in_flight(session_id, seq).await);
        }

        self.touch(session_id).await?;
        tracing::debug!(session_id = %session_id, seq, "Message finalized");
        Ok(())
    }

    /// Leave the in-flight message incomplete, flagged as interrupted, keeping the partial text
    pub async fn interrupt(&self, session_id: &str, seq: i64, partial_body: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE messages SET body = ?, interrupted = 1 WHERE session_id = ? AND seq = ? AND completed = 0 AND interrupted = 0",
        )
        .bind(partial_body)
        .bind(session_id)
        .bind(seq)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_in_flight(session_id, seq).await);
        }

        tracing::info!(session_id = %session_id, seq, "Message interrupted");
        Ok(())
    }

    /// Interrupt whatever in-flight message a dead engine left behind.
    /// Returns the sequence number that was interrupted, if any.
    pub async fn interrupt_in_flight(&self, session_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "UPDATE messages SET interrupted = 1 WHERE session_id = ? AND completed = 0 AND interrupted = 0 RETURNING seq",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let seq = row.map(|r| r.get::<i64, _>("seq"));
        if let Some(seq) = seq {
            tracing::warn!(session_id = %session_id, seq, "Recovered dangling in-flight message");
        }
        Ok(seq)
    }

    /// Sequence number of the current in-flight message, if any
    pub async fn in_flight(&self, session_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT seq FROM messages WHERE session_id = ? AND completed = 0 AND interrupted = 0",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("seq")))
    }

    /// The current in-flight message with whatever body has been stored for it
    pub async fn in_flight_message(&self, session_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT seq, role, body, created_at, completed, interrupted FROM messages WHERE session_id = ? AND completed = 0 AND interrupted = 0",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_message(session_id)).transpose()
    }

    async fn not_in_flight(&self, session_id: &str, seq: i64) -> RoostError {
        match self.exists(session_id).await {
            Ok(false) => RoostError::SessionNotFound(session_id.to_string()),
            Ok(true) => match self.in_flight(session_id).await {
                Ok(expected) => RoostError::SequenceMismatch {
                    session_id: session_id.to_string(),
                    expected,
                    actual: seq,
                },
                Err(e) => e,
            },
            Err(e) => e,
        }
    }

    /// Full replay of a session's history as of now
    pub async fn load(&self, session_id: &str) -> Result<History> {
        if !self.exists(session_id).await? {
            return Err(RoostError::SessionNotFound(session_id.to_string()));
        }

        let row = sqlx::query(
            "SELECT COUNT(*) AS n, COALESCE(MAX(seq), 0) AS upto FROM messages WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        let len: i64 = row.get("n");
        Ok(History {
            pool: self.pool.clone(),
            session_id: session_id.to_string(),
            upto: row.get("upto"),
            len: len as usize,
        })
    }

    /// List all sessions, most recently active first
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT s.id, s.title, s.created_at, s.last_active,
                   (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id) AS message_count
            FROM sessions s
            ORDER BY s.last_active DESC, s.rowid DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    /// Update last_active timestamp
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET last_active = ? WHERE id = ?")
            .bind(timestamp(Utc::now()))
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RoostError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Replace the enabled extension set of a session
    pub async fn set_extensions(&self, session_id: &str, names: &BTreeSet<String>) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET extensions = ? WHERE id = ?")
            .bind(encode_extensions(names))
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RoostError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Delete a session with its messages and lock record. Deleting a missing session is not an error.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            tracing::info!(session_id = %session_id, "Session deleted");
        }
        Ok(())
    }

    // --- Engine lock records ---

    /// Claim the engine lock for a session.
    ///
    /// Succeeds when no record exists, when `owner` already holds it, or when
    /// the holder's heartbeat is older than `timeout`. Otherwise fails with
    /// `LockContention` naming the current holder.
    pub async fn try_acquire_lock(
        &self,
        session_id: &str,
        owner: &str,
        timeout: Duration,
    ) -> Result<()> {
        if !self.exists(session_id).await? {
            return Err(RoostError::SessionNotFound(session_id.to_string()));
        }

        let now = Utc::now().timestamp_millis();
        let stale_before = now - timeout.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO engine_locks (session_id, owner, heartbeat_at) VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                owner = excluded.owner,
                heartbeat_at = excluded.heartbeat_at
            WHERE engine_locks.owner = excluded.owner OR engine_locks.heartbeat_at <= ?
            "#,
        )
        .bind(session_id)
        .bind(owner)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(result) => result,
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                return Err(RoostError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        if result.rows_affected() == 0 {
            let holder = self
                .lock_holder(session_id)
                .await?
                .map(|lock| lock.owner)
                .unwrap_or_else(|| "unknown".to_string());
            return Err(RoostError::LockContention {
                session_id: session_id.to_string(),
                owner: holder,
            });
        }

        tracing::debug!(session_id = %session_id, owner = %owner, "Engine lock acquired");
        Ok(())
    }

    /// Refresh the heartbeat. Returns false if `owner` no longer holds the lock.
    pub async fn renew_lock(&self, session_id: &str, owner: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE engine_locks SET heartbeat_at = ? WHERE session_id = ? AND owner = ?")
                .bind(Utc::now().timestamp_millis())
                .bind(session_id)
                .bind(owner)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop the lock if `owner` holds it. Returns whether a record was removed.
    pub async fn release_lock(&self, session_id: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM engine_locks WHERE session_id = ? AND owner = ?")
            .bind(session_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            tracing::debug!(session_id = %session_id, owner = %owner, "Engine lock released");
        }
        Ok(result.rows_affected() > 0)
    }

    /// Current lock record for a session, if any
    pub async fn lock_holder(&self, session_id: &str) -> Result<Option<LockRecord>> {
        let row = sqlx::query(
            "SELECT session_id, owner, heartbeat_at FROM engine_locks WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let millis: i64 = r.get("heartbeat_at");
            LockRecord {
                session_id: r.get("session_id"),
                owner: r.get("owner"),
                heartbeat_at: DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now),
            }
        }))
    }
}

/// Replayable snapshot of a session's messages.
///
/// Bounded by the highest sequence number present when it was loaded; each
/// call to [`History::stream`] starts a fresh pass over the same range.
pub struct History {
    pool: SqlitePool,
    session_id: String,
    upto: i64,
    len: usize,
}

impl History {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lazily stream the messages in sequence order
    pub fn stream(&self) -> BoxStream<'_, Result<Message>> {
        let session_id = self.session_id.clone();
        sqlx::query_as::<_, MessageRow>(
            "SELECT seq, role, body, created_at, completed, interrupted FROM messages WHERE session_id = ? AND seq <= ? ORDER BY seq ASC",
        )
        .bind(self.session_id.clone())
        .bind(self.upto)
        .fetch(&self.pool)
        .map(move |row| row.map_err(RoostError::from)?.into_message(&session_id))
        .boxed()
    }

    /// Collect the whole history into memory
    pub async fn to_vec(&self) -> Result<Vec<Message>> {
        self.stream().try_collect().await
    }
}

enum InsertError {
    MissingSession,
    Database(sqlx::Error),
}

impl From<sqlx::Error> for InsertError {
    fn from(e: sqlx::Error) -> Self {
        InsertError::Database(e)
    }
}

/// Insert one message at the next sequence number of its session
async fn insert_message(
    conn: &mut SqliteConnection,
    session_id: &str,
    role: Role,
    body: &str,
    completed: bool,
    now: &str,
) -> std::result::Result<i64, InsertError> {
    let row = sqlx::query(
        r#"
        INSERT INTO messages (session_id, seq, role, body, created_at, completed, interrupted)
        SELECT s.id,
               COALESCE((SELECT MAX(m.seq) FROM messages m WHERE m.session_id = s.id), 0) + 1,
               ?, ?, ?, ?, 0
        FROM sessions s
        WHERE s.id = ?
        RETURNING seq
        "#,
    )
    .bind(role.as_str())
    .bind(body)
    .bind(now)
    .bind(completed)
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|r| r.get("seq")).ok_or(InsertError::MissingSession)
}

async fn touch_in(conn: &mut SqliteConnection, session_id: &str, now: &str) -> Result<()> {
    sqlx::query("UPDATE sessions SET last_active = ? WHERE id = ?")
        .bind(now)
        .bind(session_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn encode_extensions(names: &BTreeSet<String>) -> String {
    serde_json::to_string(names).unwrap_or_else(|_| "[]".to_string())
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    title: String,
    created_at: String,
    last_active: String,
    extensions: String,
    provider: String,
    model: String,
}

impl TryFrom<SessionRow> for Session {
    type Error = RoostError;

    fn try_from(row: SessionRow) -> Result<Self> {
        let extensions: BTreeSet<String> =
            serde_json::from_str(&row.extensions).map_err(|e| RoostError::CorruptRecord {
                session_id: row.id.clone(),
                detail: format!("extensions column: {e}"),
            })?;

        Ok(Session {
            created_at: parse_timestamp(&row.created_at),
            last_active: parse_timestamp(&row.last_active),
            extensions,
            provider: ProviderSnapshot {
                provider: row.provider,
                model: row.model,
            },
            id: row.id,
            title: row.title,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    title: String,
    created_at: String,
    last_active: String,
    message_count: i64,
}

impl From<SummaryRow> for SessionSummary {
    fn from(row: SummaryRow) -> Self {
        SessionSummary {
            id: row.id,
            title: row.title,
            created_at: parse_timestamp(&row.created_at),
            last_active: parse_timestamp(&row.last_active),
            message_count: row.message_count,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    seq: i64,
    role: String,
    body: String,
    created_at: String,
    completed: bool,
    interrupted: bool,
}

impl MessageRow {
    fn into_message(self, session_id: &str) -> Result<Message> {
        let role = self
            .role
            .parse::<Role>()
            .map_err(|detail| RoostError::CorruptRecord {
                session_id: session_id.to_string(),
                detail,
            })?;

        Ok(Message {
            seq: self.seq,
            role,
            body: self.body,
            created_at: parse_timestamp(&self.created_at),
            completed: self.completed,
            interrupted: self.interrupted,
        })
    }
}
