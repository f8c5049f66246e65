pub mod anthropic;
pub mod base;
pub mod gemini;
pub mod openai;
pub mod plant_id;
pub mod retry;
pub mod sse;

use reqwest::Client;
use std::time::Duration;

/// Connect timeout shared by all vendor HTTP clients (seconds).
pub(crate) const VENDOR_CONNECT_TIMEOUT_SECS: u64 = 10;

pub(crate) const USER_AGENT: &str = concat!("leafwise/", env!("CARGO_PKG_VERSION"));

/// Build a `reqwest::Client` with the given per-request timeout.
///
/// Clients are cheap handles; no sockets are opened until the first call,
/// so gateways can be constructed eagerly at startup.
pub(crate) fn vendor_http_client(request_timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(VENDOR_CONNECT_TIMEOUT_SECS))
        .timeout(request_timeout)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| Client::new())
}
