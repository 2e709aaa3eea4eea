//! Contract tests run against both embedded backends: optimistic
//! concurrency, idempotent upserts, soft delete, and pagination.

use std::sync::Arc;

use agentstream::event::ChatRole;
use agentstream::repository::memory::MemoryRepository;
use agentstream::repository::sqlite::SqliteRepository;
use agentstream::repository::{
    ChatRepository, ListThreadsOptions, NewMessage, NewThread, ThreadUpdate, UpdateOutcome,
    WriteOptions,
};

fn backends() -> Vec<(&'static str, Arc<dyn ChatRepository>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir
        .path()
        .join("repo.db")
        .to_string_lossy()
        .to_string();
    vec![
        ("memory", Arc::new(MemoryRepository::new()), None),
        (
            "sqlite",
            Arc::new(SqliteRepository::open(&path).expect("open sqlite")),
            Some(dir),
        ),
    ]
}

async fn seed_thread(repo: &Arc<dyn ChatRepository>, id: &str, user: &str) {
    repo.create_thread(NewThread {
        id: Some(id.to_string()),
        user_id: user.to_string(),
        ..NewThread::default()
    })
    .await
    .expect("create thread");
}

#[tokio::test]
async fn successful_update_rotates_etag_and_bumps_version() {
    for (name, repo, _guard) in backends() {
        seed_thread(&repo, "t1", "u1").await;
        let before = repo.get_thread("t1", false).await.unwrap().unwrap();

        let outcome = repo
            .update_thread(
                "u1",
                "t1",
                ThreadUpdate {
                    title: Some("renamed".to_string()),
                    ..ThreadUpdate::default()
                },
                WriteOptions::default(),
            )
            .await
            .unwrap();
        let after = match outcome {
            UpdateOutcome::Updated(thread) => thread,
            other => panic!("[{}] expected update, got {:?}", name, other),
        };
        assert_ne!(after.etag, before.etag, "[{}] etag must rotate", name);
        assert_eq!(after.version, before.version + 1, "[{}] version", name);
    }
}

#[tokio::test]
async fn concurrent_updates_with_same_if_match_yield_one_conflict() {
    for (name, repo, _guard) in backends() {
        seed_thread(&repo, "t1", "u1").await;
        let etag = repo
            .get_thread("t1", false)
            .await
            .unwrap()
            .unwrap()
            .etag;

        let update = |title: &str| {
            let repo = repo.clone();
            let etag = etag.clone();
            let title = title.to_string();
            async move {
                repo.update_thread(
                    "u1",
                    "t1",
                    ThreadUpdate {
                        title: Some(title),
                        ..ThreadUpdate::default()
                    },
                    WriteOptions::if_match(etag),
                )
                .await
                .unwrap()
            }
        };

        let (a, b) = tokio::join!(update("first"), update("second"));
        let updated = [&a, &b]
            .iter()
            .filter(|o| matches!(o, UpdateOutcome::Updated(_)))
            .count();
        let conflicts = [&a, &b]
            .iter()
            .filter(|o| matches!(o, UpdateOutcome::Conflict))
            .count();
        assert_eq!(updated, 1, "[{}] exactly one winner", name);
        assert_eq!(conflicts, 1, "[{}] exactly one conflict", name);
    }
}

#[tokio::test]
async fn replayed_upsert_keeps_one_row_with_version_ge_two() {
    for (name, repo, _guard) in backends() {
        seed_thread(&repo, "t1", "u1").await;
        let message = NewMessage {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            user_id: "u1".to_string(),
            role: ChatRole::User,
            content: "hello".to_string(),
            metadata: None,
        };
        repo.upsert_message(message.clone()).await.unwrap();
        let second = repo.upsert_message(message).await.unwrap();

        assert!(second.version >= 2, "[{}] version after replay", name);
        assert_eq!(
            repo.count_messages("u1", "t1").await.unwrap(),
            1,
            "[{}] single row",
            name
        );
    }
}

#[tokio::test]
async fn fifty_five_threads_page_without_duplicates() {
    for (name, repo, _guard) in backends() {
        for i in 0..55 {
            seed_thread(&repo, &format!("t{:03}", i), "U3").await;
        }

        let mut seen = std::collections::HashSet::new();
        let mut token: Option<String> = None;
        let mut pages = 0;
        loop {
            let mut options = ListThreadsOptions::for_user("U3");
            options.limit = 20;
            options.continuation_token = token.clone();
            let page = repo.list_threads(options).await.unwrap();
            pages += 1;

            for thread in &page.items {
                assert!(
                    seen.insert(thread.id.clone()),
                    "[{}] duplicate thread {}",
                    name,
                    thread.id
                );
            }
            if page.has_more {
                assert_eq!(page.items.len(), 20, "[{}] full page", name);
                token = page.continuation_token.clone();
                assert!(token.is_some(), "[{}] token with has_more", name);
            } else {
                assert!(page.continuation_token.is_none(), "[{}] last page", name);
                break;
            }
        }
        assert_eq!(seen.len(), 55, "[{}] all threads seen", name);
        assert_eq!(pages, 3, "[{}] three pages", name);
    }
}

#[tokio::test]
async fn bookmark_filter_and_include_deleted() {
    for (name, repo, _guard) in backends() {
        seed_thread(&repo, "plain", "u1").await;
        seed_thread(&repo, "marked", "u1").await;
        seed_thread(&repo, "gone", "u1").await;

        repo.update_thread(
            "u1",
            "marked",
            ThreadUpdate {
                is_bookmarked: Some(true),
                ..ThreadUpdate::default()
            },
            WriteOptions::default(),
        )
        .await
        .unwrap();
        repo.delete_thread("u1", "gone", WriteOptions::default())
            .await
            .unwrap();

        let mut options = ListThreadsOptions::for_user("u1");
        options.is_bookmarked = Some(true);
        let marked = repo.list_threads(options).await.unwrap();
        assert_eq!(marked.items.len(), 1, "[{}] bookmark filter", name);
        assert_eq!(marked.items[0].id, "marked");

        let default = repo
            .list_threads(ListThreadsOptions::for_user("u1"))
            .await
            .unwrap();
        assert_eq!(default.items.len(), 2, "[{}] deleted hidden", name);

        let mut options = ListThreadsOptions::for_user("u1");
        options.include_deleted = true;
        let all = repo.list_threads(options).await.unwrap();
        assert_eq!(all.items.len(), 3, "[{}] include_deleted", name);
    }
}

#[tokio::test]
async fn bulk_message_operations() {
    for (name, repo, _guard) in backends() {
        seed_thread(&repo, "t1", "u1").await;
        let batch: Vec<NewMessage> = (0..4)
            .map(|i| NewMessage {
                id: format!("m{}", i),
                thread_id: "t1".to_string(),
                user_id: "u1".to_string(),
                role: if i % 2 == 0 {
                    ChatRole::User
                } else {
                    ChatRole::Assistant
                },
                content: format!("message {}", i),
                metadata: None,
            })
            .collect();

        let stored = repo.bulk_upsert_messages(batch).await.unwrap();
        assert_eq!(stored.len(), 4, "[{}] bulk upsert", name);

        let last = repo.get_last_message("u1", "t1").await.unwrap().unwrap();
        assert_eq!(last.id, "m3", "[{}] last message", name);

        let deleted = repo.bulk_delete_messages("u1", "t1").await.unwrap();
        assert_eq!(deleted, 4, "[{}] bulk delete", name);
        assert_eq!(
            repo.count_messages("u1", "t1").await.unwrap(),
            0,
            "[{}] count after bulk delete",
            name
        );
    }
}
