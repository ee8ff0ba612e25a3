#![warn(
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

//! Multi-conversation state on top of a completion backend.
//!
//! Each conversation has a bounded message history and an observable
//! generation status. The engine serializes generations per conversation,
//! evicts idle conversations, and fans every status change out to
//! subscribers.
//!
//! # Key Features
//! - Single-flight generation per conversation id
//! - System messages pinned through history pruning
//! - Streaming progress broadcast through status subscriptions
//! - Background expiry of idle conversations

mod context;
mod engine;
mod history;
mod status;

pub use context::ConversationContext;
pub use engine::{
    CANCELLED_MESSAGE, ConversationEngine, ConversationSnapshot, EngineConfig, EngineError,
    GenerationOutcome, SendOutcome,
};
pub use history::{HistoryConfig, HistoryStats};
pub use status::{
    GenerationStatus, StatusBus, StatusEvent, StatusHandler, StatusStream, SubscriptionToken,
};
