//! Managed document-store backend.
//!
//! Talks to an Azure Cosmos DB SQL-API container over REST, with threads
//! and messages stored as typed documents in one container partitioned by
//! `userId`. Every operation on a thread or its messages runs under that
//! partition key; the only cross-partition read is the ownership lookup
//! by thread id, which the controller needs before it can decide between
//! 403 and 404.
//!
//! Requests are signed with the account master key (HMAC-SHA256 over the
//! canonical verb/resource/date string). The store's native `_etag` is
//! surfaced untouched, and its native continuation header becomes the
//! page token, also untouched.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;

use crate::agentstream::event::ChatRole;
use crate::agentstream::llm::http_pool::get_shared_http_client;
use crate::agentstream::repository::{
    new_etag, new_id, ChatRepository, ListMessagesOptions, ListThreadsOptions, MessageEntity,
    MessageUpdate, NewMessage, NewThread, PaginatedResult, RepoError, RepoResult, SortOrder,
    Thread, ThreadSortField, ThreadUpdate, UpdateOutcome, WriteOptions,
};

const API_VERSION: &str = "2018-12-31";

type HmacSha256 = Hmac<Sha256>;

/// Percent-encode the characters that appear in a base64 signature.
fn encode_auth_token(token: &str) -> String {
    let mut encoded = String::with_capacity(token.len() + 8);
    for c in token.chars() {
        match c {
            '+' => encoded.push_str("%2b"),
            '/' => encoded.push_str("%2f"),
            '=' => encoded.push_str("%3d"),
            '&' => encoded.push_str("%26"),
            _ => encoded.push(c),
        }
    }
    encoded
}

pub struct CosmosRepository {
    endpoint: String,
    key: Vec<u8>,
    database: String,
    container: String,
}

impl CosmosRepository {
    /// `key` is the account master key (base64).
    pub fn new(endpoint: &str, key: &str, database: &str, container: &str) -> RepoResult<Self> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(key)
            .map_err(|e| RepoError::new(format!("invalid master key: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key,
            database: database.to_string(),
            container: container.to_string(),
        })
    }

    fn docs_link(&self) -> String {
        format!("dbs/{}/colls/{}", self.database, self.container)
    }

    fn doc_link(&self, doc_id: &str) -> String {
        format!("{}/docs/{}", self.docs_link(), doc_id)
    }

    /// Canonical signature headers for one request.
    fn auth_headers(&self, verb: &str, resource_type: &str, resource_link: &str) -> HeaderMap {
        let date = Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string()
            .to_lowercase();
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}\n\n",
            verb.to_lowercase(),
            resource_type,
            resource_link,
            date
        );
        // HMAC-SHA256 accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(string_to_sign.as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        let token = format!("type=master&ver=1.0&sig={}", signature);

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&encode_auth_token(&token)) {
            headers.insert("authorization", value);
        }
        if let Ok(value) = HeaderValue::from_str(&date) {
            headers.insert("x-ms-date", value);
        }
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));
        headers
    }

    fn partition_header(user_id: &str) -> String {
        serde_json::json!([user_id]).to_string()
    }

    /// Point-read a document within a partition. `None` on 404.
    async fn read_doc(
        &self,
        doc_id: &str,
        user_id: &str,
    ) -> RepoResult<Option<serde_json::Value>> {
        let link = self.doc_link(doc_id);
        let url = format!("{}/{}", self.endpoint, link);
        let response = get_shared_http_client()
            .get(&url)
            .headers(self.auth_headers("GET", "docs", &link))
            .header("x-ms-documentdb-partitionkey", Self::partition_header(user_id))
            .send()
            .await
            .map_err(|e| RepoError::new(e.to_string()))?;
        match response.status().as_u16() {
            200 => response
                .json()
                .await
                .map(Some)
                .map_err(|e| RepoError::new(e.to_string())),
            404 => Ok(None),
            status => Err(RepoError::new(format!(
                "read {} failed with HTTP {}",
                doc_id, status
            ))),
        }
    }

    /// Upsert a document. Returns the stored body (with `_etag`).
    async fn upsert_doc(
        &self,
        user_id: &str,
        body: &serde_json::Value,
    ) -> RepoResult<serde_json::Value> {
        let link = self.docs_link();
        let url = format!("{}/{}/docs", self.endpoint, link);
        let response = get_shared_http_client()
            .post(&url)
            .headers(self.auth_headers("POST", "docs", &link))
            .header("x-ms-documentdb-partitionkey", Self::partition_header(user_id))
            .header("x-ms-documentdb-is-upsert", "true")
            .json(body)
            .send()
            .await
            .map_err(|e| RepoError::new(e.to_string()))?;
        let status = response.status().as_u16();
        if status == 200 || status == 201 {
            response
                .json()
                .await
                .map_err(|e| RepoError::new(e.to_string()))
        } else {
            Err(RepoError::new(format!("upsert failed with HTTP {}", status)))
        }
    }

    /// Replace a document, optionally conditioned on its native etag.
    /// `Ok(None)` signals a 412 precondition failure.
    async fn replace_doc(
        &self,
        doc_id: &str,
        user_id: &str,
        body: &serde_json::Value,
        if_match: Option<&str>,
    ) -> RepoResult<Option<serde_json::Value>> {
        let link = self.doc_link(doc_id);
        let url = format!("{}/{}", self.endpoint, link);
        let mut request = get_shared_http_client()
            .put(&url)
            .headers(self.auth_headers("PUT", "docs", &link))
            .header("x-ms-documentdb-partitionkey", Self::partition_header(user_id))
            .json(body);
        if let Some(etag) = if_match {
            request = request.header("If-Match", etag);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RepoError::new(e.to_string()))?;
        match response.status().as_u16() {
            200 => response
                .json()
                .await
                .map(Some)
                .map_err(|e| RepoError::new(e.to_string())),
            412 => Ok(None),
            404 => Err(RepoError::new(format!("document {} not found", doc_id))),
            status => Err(RepoError::new(format!(
                "replace failed with HTTP {}",
                status
            ))),
        }
    }

    async fn delete_doc(&self, doc_id: &str, user_id: &str) -> RepoResult<bool> {
        let link = self.doc_link(doc_id);
        let url = format!("{}/{}", self.endpoint, link);
        let response = get_shared_http_client()
            .delete(&url)
            .headers(self.auth_headers("DELETE", "docs", &link))
            .header("x-ms-documentdb-partitionkey", Self::partition_header(user_id))
            .send()
            .await
            .map_err(|e| RepoError::new(e.to_string()))?;
        match response.status().as_u16() {
            204 => Ok(true),
            404 => Ok(false),
            status => Err(RepoError::new(format!("delete failed with HTTP {}", status))),
        }
    }

    /// Run a SQL query. Partitioned when `user_id` is given, otherwise
    /// cross-partition (used only for the ownership lookup).
    async fn query_docs(
        &self,
        query: serde_json::Value,
        user_id: Option<&str>,
        max_items: usize,
        continuation: Option<&str>,
    ) -> RepoResult<(Vec<serde_json::Value>, Option<String>)> {
        let link = self.docs_link();
        let url = format!("{}/{}/docs", self.endpoint, link);
        let mut request = get_shared_http_client()
            .post(&url)
            .headers(self.auth_headers("POST", "docs", &link))
            .header("x-ms-documentdb-isquery", "True")
            .header("content-type", "application/query+json")
            .header("x-ms-max-item-count", max_items.to_string());
        match user_id {
            Some(user_id) => {
                request =
                    request.header("x-ms-documentdb-partitionkey", Self::partition_header(user_id));
            }
            None => {
                request = request.header("x-ms-documentdb-query-enablecrosspartition", "true");
            }
        }
        if let Some(token) = continuation {
            request = request.header("x-ms-continuation", token);
        }
        let response = request
            .json(&query)
            .send()
            .await
            .map_err(|e| RepoError::new(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RepoError::new(format!(
                "query failed with HTTP {}",
                response.status().as_u16()
            )));
        }
        let next = response
            .headers()
            .get("x-ms-continuation")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RepoError::new(e.to_string()))?;
        let docs = body
            .get("Documents")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();
        Ok((docs, next))
    }

    // ── Document mapping ─────────────────────────────────────────────

    fn thread_doc_id(thread_id: &str) -> String {
        format!("thread|{}", thread_id)
    }

    fn message_doc_id(thread_id: &str, message_id: &str) -> String {
        format!("message|{}|{}", thread_id, message_id)
    }

    fn thread_to_doc(thread: &Thread) -> serde_json::Value {
        serde_json::json!({
            "id": Self::thread_doc_id(&thread.id),
            "type": "thread",
            "threadId": thread.id,
            "userId": thread.user_id,
            "title": thread.title,
            "isBookmarked": thread.is_bookmarked,
            "isDeleted": thread.is_deleted,
            "metadata": thread.metadata,
            "traceId": thread.trace_id,
            "createdAt": thread.created_at.to_rfc3339(),
            "lastModifiedAt": thread.last_modified_at.to_rfc3339(),
            "version": thread.version,
        })
    }

    fn doc_to_thread(doc: &serde_json::Value) -> Thread {
        let text = |key: &str| {
            doc.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let parse_time = |key: &str| {
            text(key)
                .and_then(|raw| chrono::DateTime::parse_from_rfc3339(&raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now)
        };
        Thread {
            id: text("threadId").unwrap_or_default(),
            user_id: text("userId").unwrap_or_default(),
            title: text("title"),
            is_bookmarked: doc.get("isBookmarked").and_then(|v| v.as_bool()).unwrap_or(false),
            is_deleted: doc.get("isDeleted").and_then(|v| v.as_bool()).unwrap_or(false),
            metadata: doc.get("metadata").cloned().unwrap_or_else(|| serde_json::json!({})),
            trace_id: text("traceId"),
            created_at: parse_time("createdAt"),
            last_modified_at: parse_time("lastModifiedAt"),
            // Native etag, surfaced untouched.
            etag: text("_etag").unwrap_or_else(new_etag),
            version: doc.get("version").and_then(|v| v.as_i64()).unwrap_or(1),
        }
    }

    fn message_to_doc(message: &MessageEntity) -> serde_json::Value {
        serde_json::json!({
            "id": Self::message_doc_id(&message.thread_id, &message.id),
            "type": "message",
            "messageId": message.id,
            "threadId": message.thread_id,
            "userId": message.user_id,
            "role": message.role,
            "content": message.content,
            "isDeleted": message.is_deleted,
            "metadata": message.metadata,
            "createdAt": message.created_at.to_rfc3339(),
            "lastModifiedAt": message.last_modified_at.to_rfc3339(),
            "version": message.version,
        })
    }

    fn doc_to_message(doc: &serde_json::Value) -> MessageEntity {
        let text = |key: &str| {
            doc.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let parse_time = |key: &str| {
            text(key)
                .and_then(|raw| chrono::DateTime::parse_from_rfc3339(&raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now)
        };
        let role = doc
            .get("role")
            .and_then(|v| serde_json::from_value::<ChatRole>(v.clone()).ok())
            .unwrap_or(ChatRole::User);
        MessageEntity {
            id: text("messageId").unwrap_or_default(),
            thread_id: text("threadId").unwrap_or_default(),
            user_id: text("userId").unwrap_or_default(),
            role,
            content: text("content").unwrap_or_default(),
            is_deleted: doc.get("isDeleted").and_then(|v| v.as_bool()).unwrap_or(false),
            metadata: doc.get("metadata").cloned().unwrap_or_else(|| serde_json::json!({})),
            created_at: parse_time("createdAt"),
            last_modified_at: parse_time("lastModifiedAt"),
            etag: text("_etag").unwrap_or_else(new_etag),
            version: doc.get("version").and_then(|v| v.as_i64()).unwrap_or(1),
        }
    }

    async fn touch_thread(&self, user_id: &str, thread_id: &str) -> RepoResult<()> {
        if let Some(doc) = self.read_doc(&Self::thread_doc_id(thread_id), user_id).await? {
            let mut thread = Self::doc_to_thread(&doc);
            thread.last_modified_at = Utc::now();
            thread.version += 1;
            self.upsert_doc(user_id, &Self::thread_to_doc(&thread)).await?;
        }
        Ok(())
    }

    /// Shared conditional thread mutation with the single silent retry.
    async fn mutate_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        options: &WriteOptions,
        mutate: impl Fn(&mut Thread),
    ) -> RepoResult<UpdateOutcome<Thread>> {
        for attempt in 0..2 {
            let doc = match self.read_doc(&Self::thread_doc_id(thread_id), user_id).await? {
                Some(doc) => doc,
                None => return Ok(UpdateOutcome::NotFound),
            };
            let mut thread = Self::doc_to_thread(&doc);
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
            let native_etag = thread.etag.clone();
            mutate(&mut thread);
            thread.last_modified_at = Utc::now();
            thread.version += 1;
            match self
                .replace_doc(
                    &Self::thread_doc_id(thread_id),
                    user_id,
                    &Self::thread_to_doc(&thread),
                    Some(&native_etag),
                )
                .await?
            {
                Some(stored) => return Ok(UpdateOutcome::Updated(Self::doc_to_thread(&stored))),
                // Raced with a concurrent writer between read and replace.
                None if options.retry_on_conflict && attempt == 0 => continue,
                None => return Ok(UpdateOutcome::Conflict),
            }
        }
        Ok(UpdateOutcome::Conflict)
    }
}

#[async_trait]
impl ChatRepository for CosmosRepository {
    async fn create_thread(&self, new: NewThread) -> RepoResult<Thread> {
        let id = new.id.unwrap_or_else(new_id);
        if let Some(doc) = self.read_doc(&Self::thread_doc_id(&id), &new.user_id).await? {
            return Ok(Self::doc_to_thread(&doc));
        }
        let now = Utc::now();
        let thread = Thread {
            id: id.clone(),
            user_id: new.user_id.clone(),
            title: new.title,
            is_bookmarked: false,
            is_deleted: false,
            metadata: new.metadata.unwrap_or_else(|| serde_json::json!({})),
            trace_id: new.trace_id,
            created_at: now,
            last_modified_at: now,
            etag: String::new(),
            version: 1,
        };
        let stored = self
            .upsert_doc(&new.user_id, &Self::thread_to_doc(&thread))
            .await?;
        Ok(Self::doc_to_thread(&stored))
    }

    async fn get_thread(
        &self,
        thread_id: &str,
        include_deleted: bool,
    ) -> RepoResult<Option<Thread>> {
        // Ownership lookup: the one cross-partition read in the backend.
        let query = serde_json::json!({
            "query": "SELECT * FROM c WHERE c.type = 'thread' AND c.threadId = @id",
            "parameters": [{ "name": "@id", "value": thread_id }],
        });
        let (docs, _) = self.query_docs(query, None, 1, None).await?;
        Ok(docs
            .first()
            .map(Self::doc_to_thread)
            .filter(|t| include_deleted || !t.is_deleted))
    }

    async fn update_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        updates: ThreadUpdate,
        options: WriteOptions,
    ) -> RepoResult<UpdateOutcome<Thread>> {
        self.mutate_thread(user_id, thread_id, &options, move |thread| {
            if let Some(title) = &updates.title {
                thread.title = Some(title.clone());
            }
            if let Some(bookmarked) = updates.is_bookmarked {
                thread.is_bookmarked = bookmarked;
            }
            if let Some(metadata) = &updates.metadata {
                thread.metadata = metadata.clone();
            }
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
        })
        .await
    }

    async fn hard_delete_thread(&self, user_id: &str, thread_id: &str) -> RepoResult<bool> {
        let removed = self
            .delete_doc(&Self::thread_doc_id(thread_id), user_id)
            .await?;
        if removed {
            // Cascade: enumerate and delete the thread's message docs.
            let query = serde_json::json!({
                "query": "SELECT c.id FROM c WHERE c.type = 'message' AND c.threadId = @id",
                "parameters": [{ "name": "@id", "value": thread_id }],
            });
            let mut continuation: Option<String> = None;
            loop {
                let (docs, next) = self
                    .query_docs(query.clone(), Some(user_id), 100, continuation.as_deref())
                    .await?;
                for doc in &docs {
                    if let Some(doc_id) = doc.get("id").and_then(|v| v.as_str()) {
                        self.delete_doc(doc_id, user_id).await?;
                    }
                }
                match next {
                    Some(token) if !docs.is_empty() => continuation = Some(token),
                    _ => break,
                }
            }
        }
        Ok(removed)
    }

    async fn list_threads(
        &self,
        options: ListThreadsOptions,
    ) -> RepoResult<PaginatedResult<Thread>> {
        let order_field = match options.sort_by {
            ThreadSortField::LastModifiedAt => "c.lastModifiedAt",
            ThreadSortField::CreatedAt => "c.createdAt",
            ThreadSortField::Title => "c.title",
        };
        let order_dir = match options.sort_order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let mut clauses = vec!["c.type = 'thread'".to_string(), "c.userId = @user".to_string()];
        if !options.include_deleted {
            clauses.push("c.isDeleted = false".to_string());
        }
        if options.is_bookmarked.is_some() {
            clauses.push("c.isBookmarked = @bookmarked".to_string());
        }
        let sql = format!(
            "SELECT * FROM c WHERE {} ORDER BY {} {}",
            clauses.join(" AND "),
            order_field,
            order_dir
        );
        let mut parameters = vec![serde_json::json!({ "name": "@user", "value": options.user_id })];
        if let Some(flag) = options.is_bookmarked {
            parameters.push(serde_json::json!({ "name": "@bookmarked", "value": flag }));
        }
        let query = serde_json::json!({ "query": sql, "parameters": parameters });

        let limit = options.effective_limit();
        let (docs, native_token) = self
            .query_docs(
                query,
                Some(&options.user_id),
                limit,
                options.continuation_token.as_deref(),
            )
            .await?;
        let items: Vec<Thread> = docs.iter().map(Self::doc_to_thread).collect();
        let has_more = native_token.is_some();
        Ok(PaginatedResult {
            items,
            // The store's native continuation, surfaced untouched.
            continuation_token: native_token,
            has_more,
            total_count: None,
        })
    }

    async fn upsert_message(&self, new: NewMessage) -> RepoResult<MessageEntity> {
        let doc_id = Self::message_doc_id(&new.thread_id, &new.id);
        let existing = self.read_doc(&doc_id, &new.user_id).await?;
        let now = Utc::now();
        let message = match existing {
            Some(doc) => {
                let mut message = Self::doc_to_message(&doc);
                message.role = new.role;
                message.content = new.content;
                message.metadata = new.metadata.unwrap_or_else(|| serde_json::json!({}));
                message.last_modified_at = now;
                message.version += 1;
                message
            }
            None => MessageEntity {
                id: new.id,
                thread_id: new.thread_id.clone(),
                user_id: new.user_id.clone(),
                role: new.role,
                content: new.content,
                is_deleted: false,
                metadata: new.metadata.unwrap_or_else(|| serde_json::json!({})),
                created_at: now,
                last_modified_at: now,
                etag: String::new(),
                version: 1,
            },
        };
        let stored = self
            .upsert_doc(&new.user_id, &Self::message_to_doc(&message))
            .await?;
        self.touch_thread(&new.user_id, &new.thread_id).await?;
        Ok(Self::doc_to_message(&stored))
    }

    async fn get_messages(
        &self,
        user_id: &str,
        thread_id: &str,
        options: ListMessagesOptions,
    ) -> RepoResult<PaginatedResult<MessageEntity>> {
        let mut clauses = vec![
            "c.type = 'message'".to_string(),
            "c.userId = @user".to_string(),
            "c.threadId = @thread".to_string(),
        ];
        if !options.include_deleted {
            clauses.push("c.isDeleted = false".to_string());
        }
        if options.role.is_some() {
            clauses.push("c.role = @role".to_string());
        }
        let sql = format!(
            "SELECT * FROM c WHERE {} ORDER BY c.createdAt ASC",
            clauses.join(" AND ")
        );
        let mut parameters = vec![
            serde_json::json!({ "name": "@user", "value": user_id }),
            serde_json::json!({ "name": "@thread", "value": thread_id }),
        ];
        if let Some(role) = options.role {
            parameters.push(serde_json::json!({ "name": "@role", "value": role }));
        }
        let query = serde_json::json!({ "query": sql, "parameters": parameters });

        let limit = options.effective_limit();
        let (docs, native_token) = self
            .query_docs(
                query,
                Some(user_id),
                limit,
                options.continuation_token.as_deref(),
            )
            .await?;
        let items: Vec<MessageEntity> = docs.iter().map(Self::doc_to_message).collect();
        let has_more = native_token.is_some();
        Ok(PaginatedResult {
            items,
            continuation_token: native_token,
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
        let doc_id = Self::message_doc_id(thread_id, message_id);
        for attempt in 0..2 {
            let doc = match self.read_doc(&doc_id, user_id).await? {
                Some(doc) => doc,
                None => return Ok(UpdateOutcome::NotFound),
            };
            let mut message = Self::doc_to_message(&doc);
            if attempt == 0 {
                if let Some(expected) = &options.if_match {
                    if &message.etag != expected {
                        if options.retry_on_conflict {
                            continue;
                        }
                        return Ok(UpdateOutcome::Conflict);
                    }
                }
            }
            let native_etag = message.etag.clone();
            if let Some(content) = &updates.content {
                message.content = content.clone();
            }
            if let Some(metadata) = &updates.metadata {
                message.metadata = metadata.clone();
            }
            message.last_modified_at = Utc::now();
            message.version += 1;
            match self
                .replace_doc(&doc_id, user_id, &Self::message_to_doc(&message), Some(&native_etag))
                .await?
            {
                Some(stored) => return Ok(UpdateOutcome::Updated(Self::doc_to_message(&stored))),
                None if options.retry_on_conflict && attempt == 0 => continue,
                None => return Ok(UpdateOutcome::Conflict),
            }
        }
        Ok(UpdateOutcome::Conflict)
    }

    async fn delete_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
    ) -> RepoResult<bool> {
        let doc_id = Self::message_doc_id(thread_id, message_id);
        let doc = match self.read_doc(&doc_id, user_id).await? {
            Some(doc) => doc,
            None => return Ok(false),
        };
        let mut message = Self::doc_to_message(&doc);
        message.is_deleted = true;
        message.last_modified_at = Utc::now();
        message.version += 1;
        self.upsert_doc(user_id, &Self::message_to_doc(&message)).await?;
        Ok(true)
    }

    async fn hard_delete_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
    ) -> RepoResult<bool> {
        self.delete_doc(&Self::message_doc_id(thread_id, message_id), user_id)
            .await
    }

    async fn count_messages(&self, user_id: &str, thread_id: &str) -> RepoResult<usize> {
        let query = serde_json::json!({
            "query": "SELECT VALUE COUNT(1) FROM c WHERE c.type = 'message' \
                      AND c.userId = @user AND c.threadId = @thread AND c.isDeleted = false",
            "parameters": [
                { "name": "@user", "value": user_id },
                { "name": "@thread", "value": thread_id },
            ],
        });
        let (docs, _) = self.query_docs(query, Some(user_id), 1, None).await?;
        Ok(docs
            .first()
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize)
    }

    async fn get_last_message(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<MessageEntity>> {
        let query = serde_json::json!({
            "query": "SELECT * FROM c WHERE c.type = 'message' AND c.userId = @user \
                      AND c.threadId = @thread AND c.isDeleted = false \
                      ORDER BY c.createdAt DESC",
            "parameters": [
                { "name": "@user", "value": user_id },
                { "name": "@thread", "value": thread_id },
            ],
        });
        let (docs, _) = self.query_docs(query, Some(user_id), 1, None).await?;
        Ok(docs.first().map(Self::doc_to_message))
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
        let mut deleted = 0;
        let mut continuation: Option<String> = None;
        loop {
            let options = ListMessagesOptions {
                limit: 100,
                continuation_token: continuation.clone(),
                role: None,
                include_deleted: false,
            };
            let page = self.get_messages(user_id, thread_id, options).await?;
            for message in &page.items {
                if self.delete_message(user_id, thread_id, &message.id).await? {
                    deleted += 1;
                }
            }
            match page.continuation_token {
                Some(token) if !page.items.is_empty() => continuation = Some(token),
                _ => break,
            }
        }
        Ok(deleted)
    }

    async fn get_thread_version(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<i64>> {
        Ok(self
            .read_doc(&Self::thread_doc_id(thread_id), user_id)
            .await?
            .map(|doc| Self::doc_to_thread(&doc).version))
    }

    async fn increment_thread_version(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> RepoResult<Option<i64>> {
        let outcome = self
            .mutate_thread(user_id, thread_id, &WriteOptions::default(), |_| {})
            .await?;
        Ok(outcome.updated().map(|t| t.version))
    }

    async fn is_healthy(&self) -> bool {
        let link = self.docs_link();
        let url = format!("{}/{}", self.endpoint, link);
        match get_shared_http_client()
            .get(&url)
            .headers(self.auth_headers("GET", "colls", &link))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_token_encoding_escapes_base64_chars() {
        assert_eq!(
            encode_auth_token("type=master&ver=1.0&sig=a+b/c="),
            "type%3dmaster%26ver%3d1.0%26sig%3da%2bb%2fc%3d"
        );
    }

    #[test]
    fn doc_ids_namespace_by_type() {
        assert_eq!(CosmosRepository::thread_doc_id("t1"), "thread|t1");
        assert_eq!(CosmosRepository::message_doc_id("t1", "m1"), "message|t1|m1");
    }

    #[test]
    fn thread_doc_round_trips_fields() {
        let now = Utc::now();
        let thread = Thread {
            id: "t1".to_string(),
            user_id: "u1".to_string(),
            title: Some("hello".to_string()),
            is_bookmarked: true,
            is_deleted: false,
            metadata: serde_json::json!({ "k": "v" }),
            trace_id: None,
            created_at: now,
            last_modified_at: now,
            etag: "native".to_string(),
            version: 3,
        };
        let mut doc = CosmosRepository::thread_to_doc(&thread);
        doc["_etag"] = serde_json::json!("native");
        let back = CosmosRepository::doc_to_thread(&doc);
        assert_eq!(back.id, "t1");
        assert_eq!(back.user_id, "u1");
        assert!(back.is_bookmarked);
        assert_eq!(back.version, 3);
        assert_eq!(back.etag, "native");
    }
}
