//! Single-file embedded repository backend.
//!
//! Meant for demos and small single-instance deployments. The rusqlite
//! connection lives behind an async mutex; statements are short enough
//! that holding the lock across a call is acceptable, and it is exactly
//! that exclusivity which makes the etag check atomic per row.
//!
//! Timestamps are stored as fixed-width UTC strings so that SQL string
//! ordering equals chronological ordering; keyset pagination compares
//! `(sort_value, id)` row values against the decoded cursor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tokio::sync::Mutex;

use crate::agentstream::event::ChatRole;
use crate::agentstream::repository::{
    new_etag, new_id, ChatRepository, Cursor, ListMessagesOptions, ListThreadsOptions,
    MessageEntity, MessageUpdate, NewMessage, NewThread, PaginatedResult, RepoError, RepoResult,
    SortOrder, Thread, ThreadSortField, ThreadUpdate, UpdateOutcome, WriteOptions,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS threads (
    id               TEXT PRIMARY KEY,
    user_id          TEXT NOT NULL,
    title            TEXT,
    is_bookmarked    INTEGER NOT NULL DEFAULT 0,
    is_deleted       INTEGER NOT NULL DEFAULT 0,
    metadata         TEXT NOT NULL DEFAULT '{}',
    trace_id         TEXT,
    created_at       TEXT NOT NULL,
    last_modified_at TEXT NOT NULL,
    etag             TEXT NOT NULL,
    version          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_threads_user_modified
    ON threads (user_id, last_modified_at);

CREATE TABLE IF NOT EXISTS messages (
    id               TEXT NOT NULL,
    thread_id        TEXT NOT NULL,
    user_id          TEXT NOT NULL,
    role             TEXT NOT NULL,
    content          TEXT NOT NULL,
    is_deleted       INTEGER NOT NULL DEFAULT 0,
    metadata         TEXT NOT NULL DEFAULT '{}',
    created_at       TEXT NOT NULL,
    last_modified_at TEXT NOT NULL,
    etag             TEXT NOT NULL,
    version          INTEGER NOT NULL,
    PRIMARY KEY (thread_id, id)
);
CREATE INDEX IF NOT EXISTS idx_messages_thread_created
    ON messages (thread_id, created_at);
";

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn role_to_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::System => "system",
    }
}

fn role_from_str(raw: &str) -> ChatRole {
    match raw {
        "assistant" => ChatRole::Assistant,
        "system" => ChatRole::System,
        _ => ChatRole::User,
    }
}

fn sort_expr(field: ThreadSortField) -> &'static str {
    match field {
        ThreadSortField::LastModifiedAt => "last_modified_at",
        ThreadSortField::CreatedAt => "created_at",
        ThreadSortField::Title => "COALESCE(title, '')",
    }
}

fn row_to_thread(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let metadata: String = row.get("metadata")?;
    let created_at: String = row.get("created_at")?;
    let last_modified_at: String = row.get("last_modified_at")?;
    Ok(Thread {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        is_bookmarked: row.get::<_, i64>("is_bookmarked")? != 0,
        is_deleted: row.get::<_, i64>("is_deleted")? != 0,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        trace_id: row.get("trace_id")?,
        created_at: parse_ts(&created_at),
        last_modified_at: parse_ts(&last_modified_at),
        etag: row.get("etag")?,
        version: row.get("version")?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageEntity> {
    let metadata: String = row.get("metadata")?;
    let created_at: String = row.get("created_at")?;
    let last_modified_at: String = row.get("last_modified_at")?;
    let role: String = row.get("role")?;
    Ok(MessageEntity {
        id: row.get("id")?,
        thread_id: row.get("thread_id")?,
        user_id: row.get("user_id")?,
        role: role_from_str(&role),
        content: row.get("content")?,
        is_deleted: row.get::<_, i64>("is_deleted")? != 0,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        created_at: parse_ts(&created_at),
        last_modified_at: parse_ts(&last_modified_at),
        etag: row.get("etag")?,
        version: row.get("version")?,
    })
}

fn db_err(e: rusqlite::Error) -> RepoError {
    RepoError::new(e.to_string())
}

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &str) -> RepoResult<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fully in-memory database, for tests.
    pub fn open_in_memory() -> RepoResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn fetch_thread(
        conn: &Connection,
        thread_id: &str,
        include_deleted: bool,
    ) -> RepoResult<Option<Thread>> {
        let mut stmt = conn
            .prepare("SELECT * FROM threads WHERE id = ?1 AND (?2 OR is_deleted = 0)")
            .map_err(db_err)?;
        let mut rows = stmt
            .query_map(params![thread_id, include_deleted], row_to_thread)
            .map_err(db_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(db_err)?)),
            None => Ok(None),
        }
    }

    fn touch_thread(conn: &Connection, user_id: &str, thread_id: &str) -> RepoResult<()> {
        conn.execute(
            "UPDATE threads SET last_modified_at = ?1, etag = ?2, version = version + 1
             WHERE id = ?3 AND user_id = ?4",
            params![fmt_ts(&Utc::now()), new_etag(), thread_id, user_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Conditional update applying `set_clause` (which must bump etag,
    /// version and last_modified_at itself).
    fn conditional_thread_write(
        conn: &Connection,
        user_id: &str,
        thread_id: &str,
        options: &WriteOptions,
        apply: impl Fn(&Connection, &Thread) -> RepoResult<()>,
    ) -> RepoResult<UpdateOutcome<Thread>> {
        for attempt in 0..2 {
            let current = match Self::fetch_thread(conn, thread_id, true)? {
                Some(thread) if thread.user_id == user_id => thread,
                _ => return Ok(UpdateOutcome::NotFound),
            };
            if attempt == 0 {
                if let Some(expected) = &options.if_match {
                    if &current.etag != expected {
                        if options.retry_on_conflict {
                            continue;
                        }
                        return Ok(UpdateOutcome::Conflict);
                    }
                }
            }
            apply(conn, &current)?;
            return match Self::fetch_thread(conn, thread_id, true)? {
                Some(thread) => Ok(UpdateOutcome::Updated(thread)),
                None => Ok(UpdateOutcome::NotFound),
            };
        }
        Ok(UpdateOutcome::Conflict)
    }

    fn set_thread_deleted(
        conn: &Connection,
        user_id: &str,
        thread_id: &str,
        options: &WriteOptions,
        deleted: bool,
    ) -> RepoResult<UpdateOutcome<Thread>> {
        Self::conditional_thread_write(conn, user_id, thread_id, options, |conn, current| {
            conn.execute(
                "UPDATE threads SET is_deleted = ?1, last_modified_at = ?2, etag = ?3,
                        version = version + 1
                 WHERE id = ?4",
                params![deleted, fmt_ts(&Utc::now()), new_etag(), current.id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }
}

#[async_trait]
impl ChatRepository for SqliteRepository {
    async fn create_thread(&self, new: NewThread) -> RepoResult<Thread> {
        let conn = self.conn.lock().await;
        let id = new.id.unwrap_or_else(new_id);
        if let Some(existing) = Self::fetch_thread(&conn, &id, true)? {
            if existing.user_id == new.user_id {
                return Ok(existing);
            }
            return Err(RepoError::new(format!(
                "thread '{}' already exists under another user",
                id
            )));
        }
        let now = fmt_ts(&Utc::now());
        let metadata = new
            .metadata
            .unwrap_or_else(|| serde_json::json!({}))
            .to_string();
        conn.execute(
            "INSERT INTO threads
               (id, user_id, title, is_bookmarked, is_deleted, metadata, trace_id,
                created_at, last_modified_at, etag, version)
             VALUES (?1, ?2, ?3, 0, 0, ?4, ?5, ?6, ?6, ?7, 1)",
            params![id, new.user_id, new.title, metadata, new.trace_id, now, new_etag()],
        )
        .map_err(db_err)?;
        Self::fetch_thread(&conn, &id, true)?
            .ok_or_else(|| RepoError::new("thread vanished after insert"))
    }

    async fn get_thread(
        &self,
        thread_id: &str,
        include_deleted: bool,
    ) -> RepoResult<Option<Thread>> {
        let conn = self.conn.lock().await;
        Self::fetch_thread(&conn, thread_id, include_deleted)
    }

    async fn update_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        updates: ThreadUpdate,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<Thread>> {
        let conn = self.conn.lock().await;
        Self::conditional_thread_write(&conn, user_id, thread_id, &options, |conn, current| {
            let title = updates.title.clone().or_else(|| current.title.clone());
            let bookmarked = updates.is_bookmarked.unwrap_or(current.is_bookmarked);
            let metadata = updates
                .metadata
                .clone()
                .unwrap_or_else(|| current.metadata.clone())
                .to_string();
            conn.execute(
                "UPDATE threads SET title = ?1, is_bookmarked = ?2, metadata = ?3,
                        last_modified_at = ?4, etag = ?5, version = version + 1
                 WHERE id = ?6",
                params![
                    title,
                    bookmarked,
                    metadata,
                    fmt_ts(&Utc::now()),
                    new_etag(),
                    current.id
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    async fn delete_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<Thread>> {
        let conn = self.conn.lock().await;
        Self::set_thread_deleted(&conn, user_id, thread_id, &options, true)
    }

    async fn restore_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<Thread>> {
        let conn = self.conn.lock().await;
        Self::set_thread_deleted(&conn, user_id, thread_id, &options, false)
    }

    async fn hard_delete_thread(&self, user_id: &str, thread_id: &str) -> RepoResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM threads WHERE id = ?1 AND user_id = ?2",
                params![thread_id, user_id],
            )
            .map_err(db_err)?;
        if removed > 0 {
            conn.execute(
                "DELETE FROM messages WHERE thread_id = ?1",
                params![thread_id],
            )
            .map_err(db_err)?;
        }
        Ok(removed > 0)
    }

    async fn list_threads(
        &self,
        options: ListThreadsOptions,
    ) -> RepoResult<PaginatedResult<Thread>> {
        let conn = self.conn.lock().await;
        let limit = options.effective_limit();
        let expr = sort_expr(options.sort_by);
        let (dir, cmp) = match options.sort_order {
            SortOrder::Ascending => ("ASC", ">"),
            SortOrder::Descending => ("DESC", "<"),
        };

        let cursor = options
            .continuation_token
            .as_deref()
            .and_then(Cursor::decode);
        let cursor_clause = if cursor.is_some() {
            format!("AND ({}, id) {} (?4, ?5)", expr, cmp)
        } else {
            String::new()
        };
        let sql = format!(
            "SELECT * FROM threads
             WHERE user_id = ?1 AND (?2 OR is_deleted = 0)
               AND (?3 IS NULL OR is_bookmarked = ?3)
               {}
             ORDER BY {} {}, id {}
             LIMIT {}",
            cursor_clause,
            expr,
            dir,
            dir,
            limit + 1
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let bookmark: Option<bool> = options.is_bookmarked;
        let mut items: Vec<Thread> = match &cursor {
            Some(cursor) => stmt
                .query_map(
                    params![
                        options.user_id,
                        options.include_deleted,
                        bookmark,
                        cursor.k,
                        cursor.id
                    ],
                    row_to_thread,
                )
                .map_err(db_err)?
                .collect::<Result<_, _>>()
                .map_err(db_err)?,
            None => stmt
                .query_map(
                    params![options.user_id, options.include_deleted, bookmark],
                    row_to_thread,
                )
                .map_err(db_err)?
                .collect::<Result<_, _>>()
                .map_err(db_err)?,
        };

        let has_more = items.len() > limit;
        items.truncate(limit);
        let continuation_token = if has_more {
            items.last().map(|t| {
                let k = match options.sort_by {
                    ThreadSortField::LastModifiedAt => fmt_ts(&t.last_modified_at),
                    ThreadSortField::CreatedAt => fmt_ts(&t.created_at),
                    ThreadSortField::Title => t.title.clone().unwrap_or_default(),
                };
                Cursor::new(k, t.id.clone()).encode()
            })
        } else {
            None
        };

        let total_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM threads
                 WHERE user_id = ?1 AND (?2 OR is_deleted = 0)
                   AND (?3 IS NULL OR is_bookmarked = ?3)",
                params![options.user_id, options.include_deleted, bookmark],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        Ok(PaginatedResult {
            items,
            continuation_token,
            has_more,
            total_count: Some(total_count as usize),
        })
    }

    async fn upsert_message(&self, new: NewMessage) -> RepoResult<MessageEntity> {
        let conn = self.conn.lock().await;
        let thread = Self::fetch_thread(&conn, &new.thread_id, true)?
            .filter(|t| t.user_id == new.user_id)
            .ok_or_else(|| RepoError::new(format!("thread '{}' not found", new.thread_id)))?;

        let now = fmt_ts(&Utc::now());
        let metadata = new
            .metadata
            .unwrap_or_else(|| serde_json::json!({}))
            .to_string();
        conn.execute(
            "INSERT INTO messages
               (id, thread_id, user_id, role, content, is_deleted, metadata,
                created_at, last_modified_at, etag, version)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7, ?8, 1)
             ON CONFLICT (thread_id, id) DO UPDATE SET
                role = excluded.role,
                content = excluded.content,
                metadata = excluded.metadata,
                last_modified_at = excluded.last_modified_at,
                etag = excluded.etag,
                version = messages.version + 1",
            params![
                new.id,
                new.thread_id,
                new.user_id,
                role_to_str(new.role),
                new.content,
                metadata,
                now,
                new_etag()
            ],
        )
        .map_err(db_err)?;
        Self::touch_thread(&conn, &thread.user_id, &thread.id)?;

        let mut stmt = conn
            .prepare("SELECT * FROM messages WHERE thread_id = ?1 AND id = ?2")
            .map_err(db_err)?;
        stmt.query_row(params![new.thread_id, new.id], row_to_message)
            .map_err(db_err)
    }

    async fn get_messages(
        &self,
        user_id: &str,
        thread_id: &str,
        options: ListMessagesOptions,
    ) -> RepoResult<PaginatedResult<MessageEntity>> {
        let conn = self.conn.lock().await;
        let limit = options.effective_limit();
        let cursor = options
            .continuation_token
            .as_deref()
            .and_then(Cursor::decode);
        let cursor_clause = if cursor.is_some() {
            "AND (created_at, id) > (?5, ?6)"
        } else {
            ""
        };
        let role = options.role.map(role_to_str);
        let sql = format!(
            "SELECT * FROM messages
             WHERE thread_id = ?1 AND user_id = ?2
               AND (?3 IS NULL OR role = ?3)
               AND (?4 OR is_deleted = 0)
               {}
             ORDER BY created_at ASC, id ASC
             LIMIT {}",
            cursor_clause,
            limit + 1
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let mut items: Vec<MessageEntity> = match &cursor {
            Some(cursor) => stmt
                .query_map(
                    params![
                        thread_id,
                        user_id,
                        role,
                        options.include_deleted,
                        cursor.k,
                        cursor.id
                    ],
                    row_to_message,
                )
                .map_err(db_err)?
                .collect::<Result<_, _>>()
                .map_err(db_err)?,
            None => stmt
                .query_map(
                    params![thread_id, user_id, role, options.include_deleted],
                    row_to_message,
                )
                .map_err(db_err)?
                .collect::<Result<_, _>>()
                .map_err(db_err)?,
        };

        let has_more = items.len() > limit;
        items.truncate(limit);
        let continuation_token = if has_more {
            items
                .last()
                .map(|m| Cursor::new(fmt_ts(&m.created_at), m.id.clone()).encode())
        } else {
            None
        };

        Ok(PaginatedResult {
            items,
            continuation_token,
            has_more,
            total_count: None,
        })
    }

    async fn update_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
        updates: MessageUpdate,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<MessageEntity>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM messages WHERE thread_id = ?1 AND id = ?2 AND user_id = ?3")
            .map_err(db_err)?;
        let current = match stmt
            .query_row(params![thread_id, message_id, user_id], row_to_message)
        {
            Ok(message) => message,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(UpdateOutcome::NotFound),
            Err(e) => return Err(db_err(e)),
        };
        if let Some(expected) = &options.if_match {
            if &current.etag != expected && !options.retry_on_conflict {
                return Ok(UpdateOutcome::Conflict);
            }
        }
        let content = updates.content.unwrap_or(current.content);
        let metadata = updates
            .metadata
            .unwrap_or(current.metadata)
            .to_string();
        conn.execute(
            "UPDATE messages SET content = ?1, metadata = ?2, last_modified_at = ?3,
                    etag = ?4, version = version + 1
             WHERE thread_id = ?5 AND id = ?6",
            params![
                content,
                metadata,
                fmt_ts(&Utc::now()),
                new_etag(),
                thread_id,
                message_id
            ],
        )
        .map_err(db_err)?;

        let mut stmt = conn
            .prepare("SELECT * FROM messages WHERE thread_id = ?1 AND id = ?2")
            .map_err(db_err)?;
        stmt.query_row(params![thread_id, message_id], row_to_message)
            .map(UpdateOutcome::Updated)
            .map_err(db_err)
    }

    async fn delete_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
    ) -> RepoResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE messages SET is_deleted = 1, last_modified_at = ?1, etag = ?2,
                        version = version + 1
                 WHERE thread_id = ?3 AND id = ?4 AND user_id = ?5",
                params![fmt_ts(&Utc::now()), new_etag(), thread_id, message_id, user_id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    async fn hard_delete_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
    ) -> RepoResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM messages WHERE thread_id = ?1 AND id = ?2 AND user_id = ?3",
                params![thread_id, message_id, user_id],
            )
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    async fn count_messages(&self, user_id: &str, thread_id: &str) -> RepoResult<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE thread_id = ?1 AND user_id = ?2 AND is_deleted = 0",
                params![thread_id, user_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }

    async fn get_last_message(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<MessageEntity>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM messages
                 WHERE thread_id = ?1 AND user_id = ?2 AND is_deleted = 0
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
            )
            .map_err(db_err)?;
        match stmt.query_row(params![thread_id, user_id], row_to_message) {
            Ok(message) => Ok(Some(message)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn bulk_upsert_messages(
        &self,
        messages: Vec<NewMessage>,
    ) -> RepoResult<Vec<MessageEntity>> {
        let mut stored = Vec::with_capacity(messages.len());
        for message in messages {
            stored.push(self.upsert_message(message).await?);
        }
        Ok(stored)
    }

    async fn bulk_delete_messages(&self, user_id: &str, thread_id: &str) -> RepoResult<usize> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE messages SET is_deleted = 1, last_modified_at = ?1, etag = ?2,
                        version = version + 1
                 WHERE thread_id = ?3 AND user_id = ?4 AND is_deleted = 0",
                params![fmt_ts(&Utc::now()), new_etag(), thread_id, user_id],
            )
            .map_err(db_err)?;
        Ok(changed)
    }

    async fn get_thread_version(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<i64>> {
        let conn = self.conn.lock().await;
        match conn.query_row(
            "SELECT version FROM threads WHERE id = ?1 AND user_id = ?2",
            params![thread_id, user_id],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(version) => Ok(Some(version)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn increment_thread_version(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<i64>> {
        let conn = self.conn.lock().await;
        Self::touch_thread(&conn, user_id, thread_id)?;
        match conn.query_row(
            "SELECT version FROM threads WHERE id = ?1 AND user_id = ?2",
            params![thread_id, user_id],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(version) => Ok(Some(version)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn is_healthy(&self) -> bool {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo_with_thread() -> SqliteRepository {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.create_thread(NewThread {
            id: Some("t1".to_string()),
            user_id: "u1".to_string(),
            ..NewThread::default()
        })
        .await
        .unwrap();
        repo
    }

    fn new_message(id: &str, content: &str) -> NewMessage {
        NewMessage {
            id: id.to_string(),
            thread_id: "t1".to_string(),
            user_id: "u1".to_string(),
            role: ChatRole::User,
            content: content.to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn upsert_replays_into_one_row() {
        let repo = repo_with_thread().await;
        let first = repo.upsert_message(new_message("m1", "a")).await.unwrap();
        let second = repo.upsert_message(new_message("m1", "b")).await.unwrap();
        assert_eq!(second.version, first.version + 1);
        assert_eq!(second.content, "b");
        assert_eq!(repo.count_messages("u1", "t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn message_upsert_touches_parent_thread() {
        let repo = repo_with_thread().await;
        let before = repo.get_thread("t1", false).await.unwrap().unwrap();
        repo.upsert_message(new_message("m1", "a")).await.unwrap();
        let after = repo.get_thread("t1", false).await.unwrap().unwrap();
        assert!(after.version > before.version);
        assert_ne!(after.etag, before.etag);
    }

    #[tokio::test]
    async fn etag_mismatch_is_a_conflict() {
        let repo = repo_with_thread().await;
        let outcome = repo
            .update_thread(
                "u1",
                "t1",
                ThreadUpdate {
                    title: Some("renamed".to_string()),
                    ..ThreadUpdate::default()
                },
                WriteOptions::if_match("bogus"),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Conflict));
    }

    #[tokio::test]
    async fn hard_delete_cascades_to_messages() {
        let repo = repo_with_thread().await;
        repo.upsert_message(new_message("m1", "a")).await.unwrap();
        assert!(repo.hard_delete_thread("u1", "t1").await.unwrap());
        assert!(repo.get_thread("t1", true).await.unwrap().is_none());
        assert_eq!(repo.count_messages("u1", "t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn message_pagination_pages_in_order() {
        let repo = repo_with_thread().await;
        for i in 0..7 {
            repo.upsert_message(new_message(&format!("m{:02}", i), "x"))
                .await
                .unwrap();
        }
        let mut options = ListMessagesOptions::default();
        options.limit = 3;
        let first = repo.get_messages("u1", "t1", options.clone()).await.unwrap();
        assert_eq!(first.items.len(), 3);
        assert!(first.has_more);

        options.continuation_token = first.continuation_token.clone();
        let second = repo.get_messages("u1", "t1", options).await.unwrap();
        assert_eq!(second.items.len(), 3);
        assert_ne!(first.items[0].id, second.items[0].id);
    }
}
