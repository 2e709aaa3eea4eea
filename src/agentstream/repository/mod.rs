//! Thread and message persistence.
//!
//! The [`ChatRepository`] trait is the contract; three backends implement
//! it: [`memory::MemoryRepository`] for tests and ephemeral deployments,
//! [`sqlite::SqliteRepository`] as the single-file embedded store, and
//! [`cosmos::CosmosRepository`] against a managed document store
//! partitioned by `user_id`.
//!
//! # Concurrency invariants
//!
//! - every successful write produces a fresh random `etag` and bumps
//!   `version` by exactly one;
//! - conditional writes (`if_match`) are checked atomically per row;
//!   mismatch reports [`UpdateOutcome::Conflict`], and
//!   `retry_on_conflict` grants one silent re-read/re-apply;
//! - soft delete hides rows from default reads but preserves them;
//!   hard delete removes them (thread hard delete cascades to messages);
//! - message upserts are idempotent in `id`: replaying a message replaces
//!   content and bumps the version of the one stored row;
//! - continuation tokens are opaque, versioned cursors that never expose
//!   raw storage offsets; backends with a native token surface it
//!   untouched.

pub mod cosmos;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use uuid::Uuid;

use crate::agentstream::event::ChatRole;

/// Hard cap and default for thread pages.
pub const THREAD_PAGE_MAX: usize = 50;
pub const THREAD_PAGE_DEFAULT: usize = 20;
/// Hard cap and default for message pages.
pub const MESSAGE_PAGE_MAX: usize = 100;
pub const MESSAGE_PAGE_DEFAULT: usize = 30;

/// A persistent conversation container owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub is_bookmarked: bool,
    pub is_deleted: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    /// Opaque concurrency token; changes on every write.
    pub etag: String,
    /// Strictly increasing write counter.
    pub version: i64,
}

/// A persisted message, co-partitioned with its thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntity {
    pub id: String,
    pub thread_id: String,
    pub user_id: String,
    pub role: ChatRole,
    pub content: String,
    pub is_deleted: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub etag: String,
    pub version: i64,
}

/// Input for [`ChatRepository::create_thread`]. A missing `id` gets a
/// fresh UUIDv7.
#[derive(Debug, Clone, Default)]
pub struct NewThread {
    pub id: Option<String>,
    pub user_id: String,
    pub title: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub trace_id: Option<String>,
}

/// Field updates for [`ChatRepository::update_thread`]. `None` leaves the
/// field untouched.
#[derive(Debug, Clone, Default)]
pub struct ThreadUpdate {
    pub title: Option<String>,
    pub is_bookmarked: Option<bool>,
    pub metadata: Option<serde_json::Value>,
}

/// Input for [`ChatRepository::upsert_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Client-supplied opaque id; replaying it replaces the stored row.
    pub id: String,
    pub thread_id: String,
    pub user_id: String,
    pub role: ChatRole,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

/// Field updates for [`ChatRepository::update_message`].
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub content: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Conditional-write options.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Require the stored etag to match before applying.
    pub if_match: Option<String>,
    /// On mismatch, silently re-read and re-apply once.
    pub retry_on_conflict: bool,
}

impl WriteOptions {
    pub fn if_match(etag: impl Into<String>) -> Self {
        Self {
            if_match: Some(etag.into()),
            retry_on_conflict: false,
        }
    }
}

/// Outcome of a conditional write.
#[derive(Debug, Clone)]
pub enum UpdateOutcome<T> {
    Updated(T),
    /// The `if_match` etag did not match the stored row.
    Conflict,
    NotFound,
}

impl<T> UpdateOutcome<T> {
    pub fn updated(self) -> Option<T> {
        match self {
            UpdateOutcome::Updated(item) => Some(item),
            _ => None,
        }
    }
}

/// Sort field for thread listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSortField {
    LastModifiedAt,
    CreatedAt,
    Title,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Options for [`ChatRepository::list_threads`].
#[derive(Debug, Clone)]
pub struct ListThreadsOptions {
    pub user_id: String,
    pub include_deleted: bool,
    /// `Some(flag)` filters on the bookmark state.
    pub is_bookmarked: Option<bool>,
    pub sort_by: ThreadSortField,
    pub sort_order: SortOrder,
    pub limit: usize,
    pub continuation_token: Option<String>,
}

impl ListThreadsOptions {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            include_deleted: false,
            is_bookmarked: None,
            sort_by: ThreadSortField::LastModifiedAt,
            sort_order: SortOrder::Descending,
            limit: THREAD_PAGE_DEFAULT,
            continuation_token: None,
        }
    }

    /// Page size after applying default and cap.
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            THREAD_PAGE_DEFAULT
        } else {
            self.limit.min(THREAD_PAGE_MAX)
        }
    }
}

/// Options for [`ChatRepository::get_messages`]. Messages always come
/// back sorted by `created_at` ascending, ties broken by id.
#[derive(Debug, Clone, Default)]
pub struct ListMessagesOptions {
    pub limit: usize,
    pub continuation_token: Option<String>,
    pub role: Option<ChatRole>,
    pub include_deleted: bool,
}

impl ListMessagesOptions {
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            MESSAGE_PAGE_DEFAULT
        } else {
            self.limit.min(MESSAGE_PAGE_MAX)
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    /// Opaque cursor for the next page, absent on the last one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
}

/// Storage failure.
#[derive(Debug, Clone)]
pub struct RepoError(pub String);

impl RepoError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repository error: {}", self.0)
    }
}

impl Error for RepoError {}

pub type RepoResult<T> = Result<T, RepoError>;

/// The persistence contract.
///
/// Implementations must be safe under concurrent calls on disjoint keys
/// and must check etags atomically per row.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    // ── Threads ──────────────────────────────────────────────────────

    async fn create_thread(&self, new: NewThread) -> RepoResult<Thread>;

    /// Point lookup by thread id; the caller enforces ownership.
    async fn get_thread(
        &self,
        thread_id: &str,
        include_deleted: bool,
    ) -> RepoResult<Option<Thread>>;

    async fn update_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        updates: ThreadUpdate,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<Thread>>;

    /// Soft delete.
    async fn delete_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<Thread>>;

    async fn restore_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<Thread>>;

    /// Remove the thread row and every message under it.
    async fn hard_delete_thread(&self, user_id: &str, thread_id: &str) -> RepoResult<bool>;

    async fn list_threads(
        &self,
        options: ListThreadsOptions,
    ) -> RepoResult<PaginatedResult<Thread>>;

    // ── Messages ─────────────────────────────────────────────────────

    /// Idempotent in `id`: replaying replaces content/metadata and bumps
    /// the stored row's version. Touches the parent thread's
    /// `last_modified_at`.
    async fn upsert_message(&self, new: NewMessage) -> RepoResult<MessageEntity>;

    async fn get_messages(
        &self,
        user_id: &str,
        thread_id: &str,
        options: ListMessagesOptions,
    ) -> RepoResult<PaginatedResult<MessageEntity>>;

    async fn update_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
        updates: MessageUpdate,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<MessageEntity>>;

    /// Soft delete one message.
    async fn delete_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
    ) -> RepoResult<bool>;

    async fn hard_delete_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
    ) -> RepoResult<bool>;

    /// Count of non-deleted messages in the thread.
    async fn count_messages(&self, user_id: &str, thread_id: &str) -> RepoResult<usize>;

    async fn get_last_message(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<MessageEntity>>;

    async fn bulk_upsert_messages(
        &self,
        messages: Vec<NewMessage>,
    ) -> RepoResult<Vec<MessageEntity>>;

    /// Soft delete every message in the thread; returns how many.
    async fn bulk_delete_messages(&self, user_id: &str, thread_id: &str) -> RepoResult<usize>;

    // ── Version counters ─────────────────────────────────────────────

    async fn get_thread_version(&self, user_id: &str, thread_id: &str)
        -> RepoResult<Option<i64>>;

    /// Bump the thread version (and etag) without other field changes.
    /// Used for cache invalidation.
    async fn increment_thread_version(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<i64>>;

    // ── Health ───────────────────────────────────────────────────────

    async fn is_healthy(&self) -> bool;
}

// ── Shared helpers ───────────────────────────────────────────────────

/// Fresh opaque etag. Random by design (not time-ordered) so clients
/// cannot reason about write ordering from etags.
pub(crate) fn new_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fresh UUIDv7 identifier for allocated thread ids.
pub(crate) fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Versioned keyset cursor used by the backends without a native
/// continuation token.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct Cursor {
    /// Format version tag so the encoding can evolve.
    pub v: u8,
    /// Last-seen sort value.
    pub k: String,
    /// Last-seen row id, the tie-breaker.
    pub id: String,
}

impl Cursor {
    pub fn new(k: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            v: 1,
            k: k.into(),
            id: id.into(),
        }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Option<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .ok()?;
        let cursor: Cursor = serde_json::from_slice(&bytes).ok()?;
        if cursor.v == 1 {
            Some(cursor)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor::new("2026-01-01T00:00:00Z", "t-42");
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn cursor_rejects_garbage_and_unknown_versions() {
        assert!(Cursor::decode("not base64 at all!!!").is_none());
        let future = Cursor {
            v: 9,
            k: "x".to_string(),
            id: "y".to_string(),
        };
        assert!(Cursor::decode(&future.encode()).is_none());
    }

    #[test]
    fn etags_are_random_not_ordered() {
        let a = new_etag();
        let b = new_etag();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn limits_apply_defaults_and_caps() {
        let mut options = ListThreadsOptions::for_user("u");
        options.limit = 0;
        assert_eq!(options.effective_limit(), THREAD_PAGE_DEFAULT);
        options.limit = 500;
        assert_eq!(options.effective_limit(), THREAD_PAGE_MAX);

        let mut msg_options = ListMessagesOptions::default();
        assert_eq!(msg_options.effective_limit(), MESSAGE_PAGE_DEFAULT);
        msg_options.limit = 1000;
        assert_eq!(msg_options.effective_limit(), MESSAGE_PAGE_MAX);
    }
}
