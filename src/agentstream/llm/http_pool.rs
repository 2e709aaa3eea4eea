//! Shared HTTP client with persistent connection pooling.
//!
//! Both remote providers issue their requests through one lazily
//! initialised [`reqwest::Client`]. The single instance keeps TLS sessions
//! and DNS lookups warm, which matters when many concurrent turns hit the
//! same upstream host.

use lazy_static::lazy_static;
use std::time::Duration;

lazy_static! {
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
///
/// Per-call deadlines are applied by the providers themselves, so the
/// shared client carries no overall request timeout.
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}
