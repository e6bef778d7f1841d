use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

pub type DbPool = Pool<Sqlite>;

/// Open (creating if missing) the embedded store at `db_path`.
pub async fn init_pool(db_path: &str) -> Result<DbPool> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Open an in-memory store. A single connection keeps every query on the
/// same ephemeral database; useful for tests and throwaway deployments.
pub async fn init_memory_pool() -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

/// Run embedded SQL migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ─── User Queries ───────────────────────────────────────────────────────────

pub mod users {
    use super::{is_unique_violation, DbPool};
    use crate::envelope::unix_now;
    use crate::error::{ErrorCode, ProtocolError, ProtocolResult, Status};
    use crate::models::User;

    pub async fn get(pool: &DbPool, username: &str) -> ProtocolResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT username, password_hash, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(pool)
        .await?;
        Ok(user)
    }

    pub async fn exists(pool: &DbPool, username: &str) -> ProtocolResult<bool> {
        Ok(get(pool, username).await?.is_some())
    }

    pub async fn create(pool: &DbPool, username: &str, password_hash: &str) -> ProtocolResult<()> {
        let result =
            sqlx::query("INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?)")
                .bind(username)
                .bind(password_hash)
                .bind(unix_now())
                .execute(pool)
                .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(ProtocolError::with_code(
                Status::Conflict,
                ErrorCode::UserExists,
                "User already exists",
            )),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── Session Queries ────────────────────────────────────────────────────────

pub mod sessions {
    use super::DbPool;
    use crate::envelope::unix_now;
    use crate::error::ProtocolResult;

    /// Idempotent insert-or-refresh of a session token.
    pub async fn upsert(
        pool: &DbPool,
        token: &str,
        username: &str,
        ttl_seconds: i64,
    ) -> ProtocolResult<()> {
        let now = unix_now();
        sqlx::query(
            r#"
            INSERT INTO sessions (token, username, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(token) DO UPDATE SET
                username = excluded.username,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(token)
        .bind(username)
        .bind(now)
        .bind(now + ttl_seconds)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete(pool: &DbPool, token: &str) -> ProtocolResult<()> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ─── Presence Queries ───────────────────────────────────────────────────────

pub mod presence {
    use super::DbPool;
    use crate::envelope::unix_now;
    use crate::error::ProtocolResult;

    pub async fn update(pool: &DbPool, username: &str, state: &str) -> ProtocolResult<()> {
        sqlx::query(
            r#"
            INSERT INTO presence (username, state, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(username) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(username)
        .bind(state)
        .bind(unix_now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn list_online(pool: &DbPool) -> ProtocolResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT username FROM presence WHERE state = 'online' ORDER BY username ASC",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

// ─── Message Queries ────────────────────────────────────────────────────────

pub mod messages {
    use super::DbPool;
    use crate::envelope::{new_frame_id, unix_now};
    use crate::error::{ProtocolError, ProtocolResult};
    use crate::models::StoredMessage;
    use serde_json::Value;

    pub async fn insert(
        pool: &DbPool,
        conversation_id: &str,
        sender_id: &str,
        content: &Value,
    ) -> ProtocolResult<StoredMessage> {
        let message_id = new_frame_id();
        let timestamp = unix_now();
        let content_text = serde_json::to_string(content)
            .map_err(|e| ProtocolError::bad_request(format!("Encode failed: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO messages (message_id, conversation_id, sender_id, content, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message_id)
        .bind(conversation_id)
        .bind(sender_id)
        .bind(&content_text)
        .bind(timestamp)
        .execute(pool)
        .await?;
        Ok(StoredMessage {
            message_id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.clone(),
            timestamp,
        })
    }
}

// ─── Room Queries ───────────────────────────────────────────────────────────

pub mod rooms {
    use super::{is_unique_violation, DbPool};
    use crate::envelope::unix_now;
    use crate::error::{ProtocolError, ProtocolResult};
    use crate::models::Room;
    use serde_json::Value;

    /// Create a room and insert the owner as its first member in one
    /// transaction.
    pub async fn create(
        pool: &DbPool,
        room_id: &str,
        owner: &str,
        encrypted: bool,
        password_hash: Option<&str>,
        metadata: &Value,
    ) -> ProtocolResult<()> {
        let now = unix_now();
        let metadata_text = serde_json::to_string(metadata)
            .map_err(|e| ProtocolError::bad_request(format!("Encode failed: {e}")))?;

        let mut tx = pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO rooms (room_id, owner, encrypted, created_at, password_hash, metadata)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(room_id)
        .bind(owner)
        .bind(encrypted)
        .bind(now)
        .bind(password_hash)
        .bind(&metadata_text)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            return if is_unique_violation(&e) {
                Err(ProtocolError::conflict("Room already exists"))
            } else {
                Err(e.into())
            };
        }
        sqlx::query(
            "INSERT OR IGNORE INTO room_members (room_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(room_id)
        .bind(owner)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(pool: &DbPool, room_id: &str) -> ProtocolResult<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(
            r#"
            SELECT room_id, owner, encrypted, created_at, password_hash, metadata
            FROM rooms WHERE room_id = ?
            "#,
        )
        .bind(room_id)
        .fetch_optional(pool)
        .await?;
        Ok(room)
    }

    pub async fn exists(pool: &DbPool, room_id: &str) -> ProtocolResult<bool> {
        Ok(get(pool, room_id).await?.is_some())
    }

    pub async fn add_member(pool: &DbPool, room_id: &str, user_id: &str) -> ProtocolResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO room_members (room_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(unix_now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn remove_member(pool: &DbPool, room_id: &str, user_id: &str) -> ProtocolResult<()> {
        sqlx::query("DELETE FROM room_members WHERE room_id = ? AND user_id = ?")
            .bind(room_id)
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn list_members(pool: &DbPool, room_id: &str) -> ProtocolResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = ? ORDER BY user_id")
                .bind(room_id)
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn list_for_user(pool: &DbPool, user_id: &str) -> ProtocolResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT room_id FROM room_members WHERE user_id = ? ORDER BY room_id")
                .bind(user_id)
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Delete a room, cascading its membership rows.
    pub async fn delete(pool: &DbPool, room_id: &str) -> ProtocolResult<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM room_members WHERE room_id = ?")
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM rooms WHERE room_id = ?")
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

// ─── Offline Queue Queries ──────────────────────────────────────────────────

pub mod offline {
    use super::DbPool;
    use crate::envelope::{unix_now, Envelope};
    use crate::error::{ProtocolError, ProtocolResult};

    pub async fn enqueue(pool: &DbPool, user_id: &str, event: &Envelope) -> ProtocolResult<()> {
        let message = serde_json::to_string(event)
            .map_err(|e| ProtocolError::bad_request(format!("Encode failed: {e}")))?;
        sqlx::query("INSERT INTO offline_queue (user_id, message, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(&message)
            .bind(unix_now())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Return the user's queued events in insert order and delete them in
    /// the same transaction. Entries that fail to decode are dropped.
    pub async fn consume(pool: &DbPool, user_id: &str) -> ProtocolResult<Vec<Envelope>> {
        let mut tx = pool.begin().await?;
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, message FROM offline_queue WHERE user_id = ? ORDER BY id")
                .bind(user_id)
                .fetch_all(&mut *tx)
                .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query("DELETE FROM offline_queue WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut events = Vec::with_capacity(rows.len());
        for (id, message) in rows {
            match serde_json::from_str::<Envelope>(&message) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Dropping undecodable offline entry {id}: {e}"),
            }
        }
        Ok(events)
    }
}

// ─── File Session Queries ───────────────────────────────────────────────────

pub mod files {
    use super::DbPool;
    use crate::envelope::unix_now;
    use crate::error::ProtocolResult;
    use crate::models::{FileSession, FileStatus};

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        pool: &DbPool,
        session_id: &str,
        file_name: &str,
        file_size: i64,
        checksum: Option<&str>,
        sender_id: &str,
        target_type: &str,
        target_id: &str,
    ) -> ProtocolResult<()> {
        let now = unix_now();
        sqlx::query(
            r#"
            INSERT INTO files (session_id, file_name, file_size, checksum, sender_id,
                               target_type, target_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(file_name)
        .bind(file_size)
        .bind(checksum)
        .bind(sender_id)
        .bind(target_type)
        .bind(target_id)
        .bind(FileStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        pool: &DbPool,
        session_id: &str,
        status: FileStatus,
    ) -> ProtocolResult<()> {
        sqlx::query("UPDATE files SET status = ?, updated_at = ? WHERE session_id = ?")
            .bind(status.as_str())
            .bind(unix_now())
            .bind(session_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn get(pool: &DbPool, session_id: &str) -> ProtocolResult<Option<FileSession>> {
        let session = sqlx::query_as::<_, FileSession>(
            r#"
            SELECT session_id, file_name, file_size, checksum, sender_id,
                   target_type, target_id, status, created_at, updated_at
            FROM files WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
        Ok(session)
    }
}

// ─── Friend Queries ─────────────────────────────────────────────────────────

pub mod friends {
    use super::{is_unique_violation, DbPool};
    use crate::envelope::unix_now;
    use crate::error::ProtocolResult;
    use crate::models::FriendRequestRow;

    fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Create a friend request, or re-open the existing row for the ordered
    /// pair back to `pending` with the new message. Returns the row id.
    pub async fn send_request(
        pool: &DbPool,
        from_user: &str,
        to_user: &str,
        message: Option<&str>,
    ) -> ProtocolResult<i64> {
        let now = unix_now();
        let result = sqlx::query(
            r#"
            INSERT INTO friend_requests (from_user, to_user, message, status, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(from_user)
        .bind(to_user)
        .bind(message)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await;
        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => {
                sqlx::query(
                    r#"
                    UPDATE friend_requests
                    SET status = 'pending', message = ?, updated_at = ?
                    WHERE from_user = ? AND to_user = ?
                    "#,
                )
                .bind(message)
                .bind(now)
                .bind(from_user)
                .bind(to_user)
                .execute(pool)
                .await?;
                let (id,): (i64,) = sqlx::query_as(
                    "SELECT id FROM friend_requests WHERE from_user = ? AND to_user = ?",
                )
                .bind(from_user)
                .bind(to_user)
                .fetch_one(pool)
                .await?;
                Ok(id)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn pending_requests(
        pool: &DbPool,
        user_id: &str,
    ) -> ProtocolResult<Vec<FriendRequestRow>> {
        let rows = sqlx::query_as::<_, FriendRequestRow>(
            r#"
            SELECT id, from_user, to_user, message, status, created_at, updated_at
            FROM friend_requests
            WHERE to_user = ? AND status = 'pending'
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn sent_requests(
        pool: &DbPool,
        user_id: &str,
    ) -> ProtocolResult<Vec<FriendRequestRow>> {
        let rows = sqlx::query_as::<_, FriendRequestRow>(
            r#"
            SELECT id, from_user, to_user, message, status, created_at, updated_at
            FROM friend_requests
            WHERE from_user = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Accept a pending request: insert the canonical friendship row and
    /// flip the request to `accepted`, atomically. Idempotent when the
    /// friendship already exists. Returns false for unknown or already
    /// resolved requests.
    pub async fn accept_request(pool: &DbPool, request_id: i64) -> ProtocolResult<bool> {
        let now = unix_now();
        let mut tx = pool.begin().await?;
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT from_user, to_user FROM friend_requests WHERE id = ? AND status = 'pending'",
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((from_user, to_user)) = row else {
            return Ok(false);
        };
        let (user1, user2) = canonical_pair(&from_user, &to_user);
        sqlx::query("INSERT OR IGNORE INTO friends (user1, user2, created_at) VALUES (?, ?, ?)")
            .bind(user1)
            .bind(user2)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE friend_requests SET status = 'accepted', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(request_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn reject_request(pool: &DbPool, request_id: i64) -> ProtocolResult<bool> {
        let result = sqlx::query(
            "UPDATE friend_requests SET status = 'rejected', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(unix_now())
        .bind(request_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_friend(pool: &DbPool, a: &str, b: &str) -> ProtocolResult<bool> {
        let (user1, user2) = canonical_pair(a, b);
        let result = sqlx::query("DELETE FROM friends WHERE user1 = ? AND user2 = ?")
            .bind(user1)
            .bind(user2)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_friends(pool: &DbPool, user_id: &str) -> ProtocolResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT CASE WHEN user1 = ? THEN user2 ELSE user1 END AS friend_id
            FROM friends
            WHERE user1 = ? OR user2 = ?
            ORDER BY friend_id
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn are_friends(pool: &DbPool, a: &str, b: &str) -> ProtocolResult<bool> {
        let (user1, user2) = canonical_pair(a, b);
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM friends WHERE user1 = ? AND user2 = ?")
                .bind(user1)
                .bind(user2)
                .fetch_optional(pool)
                .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
pub(crate) async fn test_pool() -> DbPool {
    let pool = init_memory_pool().await.expect("in-memory pool");
    run_migrations(&pool).await.expect("migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::envelope::Envelope;
    use crate::error::{ErrorCode, Status};
    use crate::models::FileStatus;
    use serde_json::json;

    #[tokio::test]
    async fn init_pool_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested/server.db");
        let pool = init_pool(db_path.to_str().unwrap()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        users::create(&pool, "alice", "hash").await.unwrap();
        assert!(users::exists(&pool, "alice").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_user_conflicts() {
        let pool = test_pool().await;
        users::create(&pool, "alice", "hash").await.unwrap();
        let err = users::create(&pool, "alice", "other").await.unwrap_err();
        assert_eq!(err.status, Status::Conflict);
        assert_eq!(err.code, Some(ErrorCode::UserExists));
    }

    #[tokio::test]
    async fn session_upsert_is_idempotent() {
        let pool = test_pool().await;
        sessions::upsert(&pool, "tok", "alice", 3600).await.unwrap();
        sessions::upsert(&pool, "tok", "alice", 3600).await.unwrap();
        sessions::delete(&pool, "tok").await.unwrap();
    }

    #[tokio::test]
    async fn online_users_sorted_ascending() {
        let pool = test_pool().await;
        presence::update(&pool, "carol", "online").await.unwrap();
        presence::update(&pool, "alice", "online").await.unwrap();
        presence::update(&pool, "bob", "offline").await.unwrap();
        assert_eq!(presence::list_online(&pool).await.unwrap(), ["alice", "carol"]);

        presence::update(&pool, "carol", "offline").await.unwrap();
        assert_eq!(presence::list_online(&pool).await.unwrap(), ["alice"]);
    }

    #[tokio::test]
    async fn room_create_inserts_owner_member() {
        let pool = test_pool().await;
        rooms::create(&pool, "r1", "alice", false, None, &json!({}))
            .await
            .unwrap();
        assert_eq!(rooms::list_members(&pool, "r1").await.unwrap(), ["alice"]);

        let err = rooms::create(&pool, "r1", "bob", false, None, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status, Status::Conflict);
    }

    #[tokio::test]
    async fn room_delete_cascades_membership() {
        let pool = test_pool().await;
        rooms::create(&pool, "r1", "alice", false, None, &json!({}))
            .await
            .unwrap();
        rooms::add_member(&pool, "r1", "bob").await.unwrap();
        rooms::add_member(&pool, "r1", "bob").await.unwrap(); // idempotent
        assert_eq!(rooms::list_members(&pool, "r1").await.unwrap().len(), 2);

        rooms::delete(&pool, "r1").await.unwrap();
        assert!(!rooms::exists(&pool, "r1").await.unwrap());
        assert!(rooms::list_members(&pool, "r1").await.unwrap().is_empty());
        assert!(rooms::list_for_user(&pool, "bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_queue_is_fifo_and_drains_once() {
        let pool = test_pool().await;
        for i in 0..3 {
            let event = Envelope::event(Command::MessageEvent, json!({"seq": i}));
            offline::enqueue(&pool, "bob", &event).await.unwrap();
        }
        let drained = offline::consume(&pool, "bob").await.unwrap();
        assert_eq!(drained.len(), 3);
        for (i, event) in drained.iter().enumerate() {
            assert_eq!(event.payload["seq"], i);
        }
        assert!(offline::consume(&pool, "bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_session_status_transitions() {
        let pool = test_pool().await;
        files::create(&pool, "s1", "doc.pdf", 123_456, Some("abcd"), "alice", "user", "bob")
            .await
            .unwrap();
        let session = files::get(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(session.status, "pending");
        assert_eq!(session.file_size, 123_456);

        files::update_status(&pool, "s1", FileStatus::Accepted)
            .await
            .unwrap();
        let session = files::get(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(session.status, "accepted");
        assert!(files::get(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn friend_accept_is_atomic_and_idempotent() {
        let pool = test_pool().await;
        let id = friends::send_request(&pool, "bob", "alice", Some("hey"))
            .await
            .unwrap();
        assert!(friends::accept_request(&pool, id).await.unwrap());
        assert!(friends::are_friends(&pool, "alice", "bob").await.unwrap());
        assert!(friends::are_friends(&pool, "bob", "alice").await.unwrap());
        // Second accept finds the row no longer pending.
        assert!(!friends::accept_request(&pool, id).await.unwrap());
        assert_eq!(friends::list_friends(&pool, "alice").await.unwrap(), ["bob"]);
    }

    #[tokio::test]
    async fn rejected_request_reopens_as_pending() {
        let pool = test_pool().await;
        let id = friends::send_request(&pool, "bob", "alice", None).await.unwrap();
        assert!(friends::reject_request(&pool, id).await.unwrap());
        assert!(!friends::reject_request(&pool, id).await.unwrap());

        let reopened = friends::send_request(&pool, "bob", "alice", Some("again"))
            .await
            .unwrap();
        assert_eq!(reopened, id);
        let pending = friends::pending_requests(&pool, "alice").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn delete_friend_removes_canonical_row() {
        let pool = test_pool().await;
        let id = friends::send_request(&pool, "carol", "bob", None).await.unwrap();
        friends::accept_request(&pool, id).await.unwrap();
        assert!(friends::delete_friend(&pool, "carol", "bob").await.unwrap());
        assert!(!friends::delete_friend(&pool, "bob", "carol").await.unwrap());
        assert!(!friends::are_friends(&pool, "bob", "carol").await.unwrap());
    }
}
