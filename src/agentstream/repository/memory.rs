//! In-memory repository backend.
//!
//! Reference implementation of the contract, used by tests and ephemeral
//! deployments. All state lives under one `RwLock`; taking the write lock
//! for every mutation is what makes the per-row etag checks atomic.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::agentstream::event::ChatRole;
use crate::agentstream::repository::{
    new_etag, new_id, ChatRepository, Cursor, ListMessagesOptions, ListThreadsOptions,
    MessageEntity, MessageUpdate, NewMessage, NewThread, PaginatedResult, RepoError, RepoResult,
    SortOrder, Thread, ThreadSortField, ThreadUpdate, UpdateOutcome, WriteOptions,
};

#[derive(Default)]
struct Store {
    threads: HashMap<String, Thread>,
    /// message id → entity, per thread.
    messages: HashMap<String, HashMap<String, MessageEntity>>,
}

/// Fixed-width timestamp rendering so lexical order equals chronological
/// order; used for sort keys and continuation cursors.
fn ts_key(ts: &chrono::DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn thread_sort_key(thread: &Thread, field: ThreadSortField) -> String {
    match field {
        ThreadSortField::LastModifiedAt => ts_key(&thread.last_modified_at),
        ThreadSortField::CreatedAt => ts_key(&thread.created_at),
        ThreadSortField::Title => thread.title.clone().unwrap_or_default(),
    }
}

pub struct MemoryRepository {
    store: RwLock<Store>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::default()),
        }
    }

    /// Apply `updates` to a stored thread, bumping etag/version.
    fn apply_thread_update(thread: &mut Thread, updates: &ThreadUpdate) {
        if let Some(title) = &updates.title {
            thread.title = Some(title.clone());
        }
        if let Some(bookmarked) = updates.is_bookmarked {
            thread.is_bookmarked = bookmarked;
        }
        if let Some(metadata) = &updates.metadata {
            thread.metadata = metadata.clone();
        }
        Self::touch(thread);
    }

    fn touch(thread: &mut Thread) {
        thread.last_modified_at = Utc::now();
        thread.etag = new_etag();
        thread.version += 1;
    }

    /// Conditional mutation shared by update/delete/restore. The closure
    /// runs under the write lock, so the etag check is atomic.
    async fn mutate_thread<F>(
        &self,
        user_id: &str,
        thread_id: &str,
        options: &WriteOptions,
        mutate: F,
    ) -> RepoResult<UpdateOutcome<Thread>>
    where
        F: Fn(&mut Thread),
    {
        let mut store = self.store.write().await;
        // One silent retry re-reads the fresh row; under this lock that
        // simply means ignoring the stale if_match.
        for attempt in 0..2 {
            let thread = match store.threads.get_mut(thread_id) {
                Some(thread) if thread.user_id == user_id => thread,
                _ => return Ok(UpdateOutcome::NotFound),
            };
            if attempt == 0 {
                if let Some(expected) = &options.if_match {
                    if &thread.etag != expected {
                        if options.retry_on_conflict {
                            continue;
                        }
                        return Ok(UpdateOutcome::Conflict);
                    }
                }
            }
            mutate(thread);
            return Ok(UpdateOutcome::Updated(thread.clone()));
        }
        Ok(UpdateOutcome::Conflict)
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatRepository for MemoryRepository {
    async fn create_thread(&self, new: NewThread) -> RepoResult<Thread> {
        let mut store = self.store.write().await;
        let id = new.id.unwrap_or_else(new_id);
        if let Some(existing) = store.threads.get(&id) {
            // Creation is idempotent per (user, thread) pair.
            if existing.user_id == new.user_id {
                return Ok(existing.clone());
            }
            return Err(RepoError::new(format!(
                "thread '{}' already exists under another user",
                id
            )));
        }
        let now = Utc::now();
        let thread = Thread {
            id: id.clone(),
            user_id: new.user_id,
            title: new.title,
            is_bookmarked: false,
            is_deleted: false,
            metadata: new.metadata.unwrap_or_else(|| serde_json::json!({})),
            trace_id: new.trace_id,
            created_at: now,
            last_modified_at: now,
            etag: new_etag(),
            version: 1,
        };
        store.threads.insert(id, thread.clone());
        Ok(thread)
    }

    async fn get_thread(
        &self,
        thread_id: &str,
        include_deleted: bool,
    ) -> RepoResult<Option<Thread>> {
        let store = self.store.read().await;
        Ok(store
            .threads
            .get(thread_id)
            .filter(|t| include_deleted || !t.is_deleted)
            .cloned())
    }

    async fn update_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        updates: ThreadUpdate,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<Thread>> {
        self.mutate_thread(user_id, thread_id, &options, move |thread| {
            Self::apply_thread_update(thread, &updates)
        })
        .await
    }

    async fn delete_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<Thread>> {
        self.mutate_thread(user_id, thread_id, &options, |thread| {
            thread.is_deleted = true;
            Self::touch(thread);
        })
        .await
    }

    async fn restore_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<Thread>> {
        self.mutate_thread(user_id, thread_id, &options, |thread| {
            thread.is_deleted = false;
            Self::touch(thread);
        })
        .await
    }

    async fn hard_delete_thread(&self, user_id: &str, thread_id: &str) -> RepoResult<bool> {
        let mut store = self.store.write().await;
        match store.threads.get(thread_id) {
            Some(thread) if thread.user_id == user_id => {
                store.threads.remove(thread_id);
                store.messages.remove(thread_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_threads(
        &self,
        options: ListThreadsOptions,
    ) -> RepoResult<PaginatedResult<Thread>> {
        let store = self.store.read().await;
        let mut threads: Vec<&Thread> = store
            .threads
            .values()
            .filter(|t| t.user_id == options.user_id)
            .filter(|t| options.include_deleted || !t.is_deleted)
            .filter(|t| {
                options
                    .is_bookmarked
                    .map_or(true, |flag| t.is_bookmarked == flag)
            })
            .collect();

        let field = options.sort_by;
        threads.sort_by(|a, b| {
            let ka = (thread_sort_key(a, field), a.id.as_str());
            let kb = (thread_sort_key(b, field), b.id.as_str());
            match options.sort_order {
                SortOrder::Ascending => ka.cmp(&kb),
                SortOrder::Descending => kb.cmp(&ka),
            }
        });

        // Keyset cursor: skip everything up to and including the cursor
        // position.
        let start = match options
            .continuation_token
            .as_deref()
            .and_then(Cursor::decode)
        {
            Some(cursor) => threads
                .iter()
                .position(|t| {
                    let key = (thread_sort_key(t, field), t.id.as_str());
                    let cur = (cursor.k.clone(), cursor.id.as_str());
                    match options.sort_order {
                        SortOrder::Ascending => key > cur,
                        SortOrder::Descending => key < cur,
                    }
                })
                .unwrap_or(threads.len()),
            None => 0,
        };

        let limit = options.effective_limit();
        let total_count = threads.len();
        let page: Vec<Thread> = threads[start..]
            .iter()
            .take(limit)
            .map(|t| (*t).clone())
            .collect();
        let has_more = start + page.len() < total_count;
        let continuation_token = if has_more {
            page.last()
                .map(|t| Cursor::new(thread_sort_key(t, field), t.id.clone()).encode())
        } else {
            None
        };

        Ok(PaginatedResult {
            items: page,
            continuation_token,
            has_more,
            total_count: Some(total_count),
        })
    }

    async fn upsert_message(&self, new: NewMessage) -> RepoResult<MessageEntity> {
        let mut store = self.store.write().await;
        let thread = store
            .threads
            .get_mut(&new.thread_id)
            .filter(|t| t.user_id == new.user_id)
            .ok_or_else(|| RepoError::new(format!("thread '{}' not found", new.thread_id)))?;
        Self::touch(thread);

        let now = Utc::now();
        let messages = store.messages.entry(new.thread_id.clone()).or_default();
        let entity = match messages.get(&new.id) {
            Some(existing) => MessageEntity {
                content: new.content,
                metadata: new.metadata.unwrap_or_else(|| serde_json::json!({})),
                role: new.role,
                last_modified_at: now,
                etag: new_etag(),
                version: existing.version + 1,
                ..existing.clone()
            },
            None => MessageEntity {
                id: new.id.clone(),
                thread_id: new.thread_id,
                user_id: new.user_id,
                role: new.role,
                content: new.content,
                is_deleted: false,
                metadata: new.metadata.unwrap_or_else(|| serde_json::json!({})),
                created_at: now,
                last_modified_at: now,
                etag: new_etag(),
                version: 1,
            },
        };
        messages.insert(new.id, entity.clone());
        Ok(entity)
    }

    async fn get_messages(
        &self,
        user_id: &str,
        thread_id: &str,
        options: ListMessagesOptions,
    ) -> RepoResult<PaginatedResult<MessageEntity>> {
        let store = self.store.read().await;
        let owned = store
            .threads
            .get(thread_id)
            .map_or(false, |t| t.user_id == user_id);
        if !owned {
            return Ok(PaginatedResult {
                items: Vec::new(),
                continuation_token: None,
                has_more: false,
                total_count: Some(0),
            });
        }

        let mut messages: Vec<&MessageEntity> = store
            .messages
            .get(thread_id)
            .map(|m| m.values().collect())
            .unwrap_or_default();
        messages.retain(|m| options.include_deleted || !m.is_deleted);
        if let Some(role) = options.role {
            messages.retain(|m| m.role == role);
        }
        // created_at ascending, ties broken by id.
        messages.sort_by(|a, b| {
            (ts_key(&a.created_at), a.id.as_str()).cmp(&(ts_key(&b.created_at), b.id.as_str()))
        });

        let start = match options
            .continuation_token
            .as_deref()
            .and_then(Cursor::decode)
        {
            Some(cursor) => messages
                .iter()
                .position(|m| {
                    (ts_key(&m.created_at), m.id.as_str())
                        > (cursor.k.clone(), cursor.id.as_str())
                })
                .unwrap_or(messages.len()),
            None => 0,
        };

        let limit = options.effective_limit();
        let total_count = messages.len();
        let page: Vec<MessageEntity> = messages[start..]
            .iter()
            .take(limit)
            .map(|m| (*m).clone())
            .collect();
        let has_more = start + page.len() < total_count;
        let continuation_token = if has_more {
            page.last()
                .map(|m| Cursor::new(ts_key(&m.created_at), m.id.clone()).encode())
        } else {
            None
        };

        Ok(PaginatedResult {
            items: page,
            continuation_token,
            has_more,
            total_count: Some(total_count),
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
        let mut store = self.store.write().await;
        let owned = store
            .threads
            .get(thread_id)
            .map_or(false, |t| t.user_id == user_id);
        if !owned {
            return Ok(UpdateOutcome::NotFound);
        }
        let message = match store
            .messages
            .get_mut(thread_id)
            .and_then(|m| m.get_mut(message_id))
        {
            Some(message) => message,
            None => return Ok(UpdateOutcome::NotFound),
        };
        if let Some(expected) = &options.if_match {
            if &message.etag != expected && !options.retry_on_conflict {
                return Ok(UpdateOutcome::Conflict);
            }
        }
        if let Some(content) = updates.content {
            message.content = content;
        }
        if let Some(metadata) = updates.metadata {
            message.metadata = metadata;
        }
        message.last_modified_at = Utc::now();
        message.etag = new_etag();
        message.version += 1;
        Ok(UpdateOutcome::Updated(message.clone()))
    }

    async fn delete_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
    ) -> RepoResult<bool> {
        let mut store = self.store.write().await;
        let owned = store
            .threads
            .get(thread_id)
            .map_or(false, |t| t.user_id == user_id);
        if !owned {
            return Ok(false);
        }
        match store
            .messages
            .get_mut(thread_id)
            .and_then(|m| m.get_mut(message_id))
        {
            Some(message) => {
                message.is_deleted = true;
                message.last_modified_at = Utc::now();
                message.etag = new_etag();
                message.version += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hard_delete_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
    ) -> RepoResult<bool> {
        let mut store = self.store.write().await;
        let owned = store
            .threads
            .get(thread_id)
            .map_or(false, |t| t.user_id == user_id);
        if !owned {
            return Ok(false);
        }
        Ok(store
            .messages
            .get_mut(thread_id)
            .and_then(|m| m.remove(message_id))
            .is_some())
    }

    async fn count_messages(&self, user_id: &str, thread_id: &str) -> RepoResult<usize> {
        let store = self.store.read().await;
        let owned = store
            .threads
            .get(thread_id)
            .map_or(false, |t| t.user_id == user_id);
        if !owned {
            return Ok(0);
        }
        Ok(store
            .messages
            .get(thread_id)
            .map(|m| m.values().filter(|m| !m.is_deleted).count())
            .unwrap_or(0))
    }

    async fn get_last_message(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<MessageEntity>> {
        let store = self.store.read().await;
        let owned = store
            .threads
            .get(thread_id)
            .map_or(false, |t| t.user_id == user_id);
        if !owned {
            return Ok(None);
        }
        Ok(store
            .messages
            .get(thread_id)
            .and_then(|messages| {
                messages
                    .values()
                    .filter(|m| !m.is_deleted && m.user_id == user_id)
                    .max_by(|a, b| {
                        (ts_key(&a.created_at), a.id.as_str())
                            .cmp(&(ts_key(&b.created_at), b.id.as_str()))
                    })
            })
            .cloned())
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
        let mut store = self.store.write().await;
        let owned = store
            .threads
            .get(thread_id)
            .map_or(false, |t| t.user_id == user_id);
        if !owned {
            return Ok(0);
        }
        let mut deleted = 0;
        if let Some(messages) = store.messages.get_mut(thread_id) {
            for message in messages.values_mut().filter(|m| !m.is_deleted) {
                message.is_deleted = true;
                message.last_modified_at = Utc::now();
                message.etag = new_etag();
                message.version += 1;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn get_thread_version(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<i64>> {
        let store = self.store.read().await;
        Ok(store
            .threads
            .get(thread_id)
            .filter(|t| t.user_id == user_id)
            .map(|t| t.version))
    }

    async fn increment_thread_version(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<i64>> {
        let outcome = self
            .mutate_thread(user_id, thread_id, &WriteOptions::default(), |thread| {
                Self::touch(thread)
            })
            .await?;
        Ok(outcome.updated().map(|t| t.version))
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(id: &str, thread: &str, content: &str) -> NewMessage {
        NewMessage {
            id: id.to_string(),
            thread_id: thread.to_string(),
            user_id: "u1".to_string(),
            role: ChatRole::User,
            content: content.to_string(),
            metadata: None,
        }
    }

    async fn repo_with_thread() -> MemoryRepository {
        let repo = MemoryRepository::new();
        repo.create_thread(NewThread {
            id: Some("t1".to_string()),
            user_id: "u1".to_string(),
            ..NewThread::default()
        })
        .await
        .unwrap();
        repo
    }

    #[tokio::test]
    async fn upsert_is_idempotent_in_id() {
        let repo = repo_with_thread().await;
        let first = repo
            .upsert_message(new_message("m1", "t1", "hello"))
            .await
            .unwrap();
        let second = repo
            .upsert_message(new_message("m1", "t1", "hello again"))
            .await
            .unwrap();
        assert_eq!(second.version, first.version + 1);
        assert_eq!(second.created_at, first.created_at);
        assert_ne!(second.etag, first.etag);
        assert_eq!(repo.count_messages("u1", "t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_etag_conflicts_and_retry_succeeds() {
        let repo = repo_with_thread().await;
        let thread = repo.get_thread("t1", false).await.unwrap().unwrap();
        let stale = thread.etag.clone();

        let mut updates = ThreadUpdate::default();
        updates.title = Some("first".to_string());
        let outcome = repo
            .update_thread("u1", "t1", updates.clone(), WriteOptions::if_match(&stale))
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Updated(_)));

        // Same stale etag again: conflict.
        let outcome = repo
            .update_thread("u1", "t1", updates.clone(), WriteOptions::if_match(&stale))
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Conflict));

        // With retry_on_conflict the write lands silently.
        let outcome = repo
            .update_thread(
                "u1",
                "t1",
                updates,
                WriteOptions {
                    if_match: Some(stale),
                    retry_on_conflict: true,
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Updated(_)));
    }

    #[tokio::test]
    async fn soft_delete_hides_and_restore_reveals() {
        let repo = repo_with_thread().await;
        repo.delete_thread("u1", "t1", WriteOptions::default())
            .await
            .unwrap();
        assert!(repo.get_thread("t1", false).await.unwrap().is_none());
        assert!(repo.get_thread("t1", true).await.unwrap().is_some());

        repo.restore_thread("u1", "t1", WriteOptions::default())
            .await
            .unwrap();
        assert!(repo.get_thread("t1", false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn versions_strictly_increase() {
        let repo = repo_with_thread().await;
        let v1 = repo.get_thread_version("u1", "t1").await.unwrap().unwrap();
        let v2 = repo
            .increment_thread_version("u1", "t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v2, v1 + 1);
    }
}
