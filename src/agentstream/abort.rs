//! Per-turn cancellation registry with optional cross-instance abort.
//!
//! Every streaming turn registers a cancellation token keyed by
//! `thread_id`. Registering a key that is already present cancels the
//! previous token first — an in-flight duplicate request for the same
//! thread is aborted in favor of the newer one.
//!
//! `request_abort` cancels the local token and, when the redis transport
//! is configured, publishes on the channel `sse:abort:<thread_id>` so
//! sibling instances can cancel their own token for that thread. Each
//! instance keeps at most one subscriber per distinct `thread_id`,
//! subscribed lazily at registration and torn down on unregister. Without
//! a transport the fabric runs in local-only mode.
//!
//! Shutdown cancels every outstanding token; the stream producers observe
//! their token at each suspension point, so a stopped client sees no
//! further events within one iteration of the producer loop.
//!
//! # Example
//!
//! ```rust
//! use agentstream::abort::StreamAbortFabric;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let fabric = StreamAbortFabric::local_only();
//! let token = fabric.register("T1").await;
//! assert_eq!(fabric.active_count().await, 1);
//!
//! assert!(fabric.request_abort("T1").await);
//! assert!(token.is_cancelled());
//! # }
//! ```

use futures_util::StreamExt;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Channel prefix for cross-instance abort notifications.
const CHANNEL_PREFIX: &str = "sse:abort:";

/// Payload published on the abort channel. The content is irrelevant;
/// receipt is the signal.
const ABORT_PAYLOAD: &str = "abort";

fn channel_for(thread_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, thread_id)
}

/// Redis-backed transport for cross-instance abort notifications.
pub struct RedisAbortTransport {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
}

impl RedisAbortTransport {
    /// Connect to redis at `url` and prepare the shared publisher
    /// connection.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_connection_manager().await?;
        Ok(Self { client, publisher })
    }

    async fn publish(&self, thread_id: &str) -> bool {
        let mut conn = self.publisher.clone();
        let result: redis::RedisResult<()> =
            conn.publish(channel_for(thread_id), ABORT_PAYLOAD).await;
        match result {
            Ok(()) => true,
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("RedisAbortTransport: publish failed for {}: {}", thread_id, e);
                }
                false
            }
        }
    }

    /// Subscribe to the thread's channel and cancel `token` on the first
    /// message. Runs until `stop` fires.
    fn spawn_subscriber(
        &self,
        thread_id: String,
        token: CancellationToken,
        stop: CancellationToken,
    ) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    log::warn!(
                        "RedisAbortTransport: subscribe connection failed for {}: {}",
                        thread_id,
                        e
                    );
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(channel_for(&thread_id)).await {
                log::warn!(
                    "RedisAbortTransport: subscribe failed for {}: {}",
                    thread_id,
                    e
                );
                return;
            }
            let mut messages = pubsub.on_message();
            tokio::select! {
                _ = stop.cancelled() => {}
                msg = messages.next() => {
                    if msg.is_some() {
                        if log::log_enabled!(log::Level::Debug) {
                            log::debug!(
                                "RedisAbortTransport: remote abort for thread {}",
                                thread_id
                            );
                        }
                        token.cancel();
                    }
                }
            }
        });
    }
}

struct Registration {
    token: CancellationToken,
    /// Stops this registration's channel subscriber, when one exists.
    subscriber_stop: Option<CancellationToken>,
}

impl Registration {
    fn teardown(&self) {
        if let Some(stop) = &self.subscriber_stop {
            stop.cancel();
        }
    }
}

/// Process-wide registry of per-turn abort tokens.
pub struct StreamAbortFabric {
    registrations: Mutex<HashMap<String, Registration>>,
    transport: Option<RedisAbortTransport>,
}

impl StreamAbortFabric {
    /// Fabric with cross-instance propagation.
    pub fn new(transport: Option<RedisAbortTransport>) -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
            transport,
        }
    }

    /// Fabric without a cross-instance transport.
    pub fn local_only() -> Self {
        Self::new(None)
    }

    /// `true` when a cross-instance transport is configured.
    pub fn cross_instance(&self) -> bool {
        self.transport.is_some()
    }

    /// Register a fresh token for `thread_id`, cancelling and replacing
    /// any prior registration for the same key.
    pub async fn register(&self, thread_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let subscriber_stop = self.transport.as_ref().map(|transport| {
            let stop = CancellationToken::new();
            transport.spawn_subscriber(thread_id.to_string(), token.clone(), stop.clone());
            stop
        });

        let mut registrations = self.registrations.lock().await;
        if let Some(previous) = registrations.insert(
            thread_id.to_string(),
            Registration {
                token: token.clone(),
                subscriber_stop,
            },
        ) {
            // Duplicate in-flight request: the older stream loses.
            previous.token.cancel();
            previous.teardown();
        }
        token
    }

    /// Cancel the turn for `thread_id`.
    ///
    /// Returns `true` when a local token existed, or when the abort was
    /// published to sibling instances. In local-only mode this is exactly
    /// "a local token existed".
    pub async fn request_abort(&self, thread_id: &str) -> bool {
        let local = {
            let registrations = self.registrations.lock().await;
            match registrations.get(thread_id) {
                Some(registration) => {
                    registration.token.cancel();
                    true
                }
                None => false,
            }
        };

        let published = match &self.transport {
            Some(transport) => transport.publish(thread_id).await,
            None => false,
        };

        if log::log_enabled!(log::Level::Info) {
            log::info!(
                "StreamAbortFabric: abort requested for {} (local={}, published={})",
                thread_id,
                local,
                published
            );
        }
        local || published
    }

    /// Drop the registration for `thread_id` and tear down its
    /// subscriber. The token itself is left as-is: the stream has ended.
    pub async fn unregister(&self, thread_id: &str) {
        let mut registrations = self.registrations.lock().await;
        if let Some(registration) = registrations.remove(thread_id) {
            registration.teardown();
        }
    }

    /// Number of currently registered turns.
    pub async fn active_count(&self) -> usize {
        self.registrations.lock().await.len()
    }

    /// Cancel every registered token and tear everything down. Called on
    /// process shutdown.
    pub async fn shutdown(&self) {
        let mut registrations = self.registrations.lock().await;
        for (_, registration) in registrations.drain() {
            registration.token.cancel();
            registration.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reregistering_cancels_previous_token() {
        let fabric = StreamAbortFabric::local_only();
        let first = fabric.register("T1").await;
        let second = fabric.register("T1").await;
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(fabric.active_count().await, 1);
    }

    #[tokio::test]
    async fn abort_without_registration_is_false_locally() {
        let fabric = StreamAbortFabric::local_only();
        assert!(!fabric.request_abort("missing").await);
    }

    #[tokio::test]
    async fn unregister_leaves_token_untouched() {
        let fabric = StreamAbortFabric::local_only();
        let token = fabric.register("T1").await;
        fabric.unregister("T1").await;
        assert!(!token.is_cancelled());
        assert_eq!(fabric.active_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let fabric = StreamAbortFabric::local_only();
        let a = fabric.register("T1").await;
        let b = fabric.register("T2").await;
        fabric.shutdown().await;
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert_eq!(fabric.active_count().await, 0);
    }
}
