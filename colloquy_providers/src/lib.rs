#![deny(
    clippy::all,
    clippy::nursery,
    clippy::pedantic,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::correctness,
    clippy::suspicious,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::similar_names,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! HTTP transport for a remote chat completion service.
//!
//! Every outbound call goes through a rolling-window [`RateLimiter`] and the
//! [`retry_with_backoff`] policy. Streaming responses are parsed by [`sse`]
//! under a stall watchdog.

mod http;
pub mod rate_limit;
pub mod retry;
pub mod sse;

pub use http::{HttpTransport, TransportConfig, TransportStats};
pub use rate_limit::RateLimiter;
pub use retry::{Retried, RetryPolicy, retry_with_backoff};
