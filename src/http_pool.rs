//! HTTP client pool for maintaining persistent connections per base URL.
//!
//! Each base URL gets its own configured `reqwest::Client` with connection
//! pooling enabled, avoiding DNS/TLS churn across the many small requests
//! the stream adapters make to the same provider endpoint.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

static CLIENT_POOL: Lazy<Mutex<HashMap<String, reqwest::Client>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Creates or retrieves a shared HTTP client for the given base URL.
pub fn get_or_create_client(base_url: &str) -> reqwest::Client {
    let mut pool = CLIENT_POOL.lock().expect("http client pool mutex poisoned");
    pool.entry(base_url.to_string())
        .or_insert_with(create_pooled_client)
        .clone()
}

fn create_pooled_client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build HTTP client")
}
