//! Static strategy pattern for CLI commands.
//!
//! Each command is a separate strategy type with its own input type.

use colloquy_config::Config;
use colloquy_conversation::{ConversationEngine, EngineConfig, HistoryConfig};
use colloquy_core::CompletionBackend;
use colloquy_providers::{HttpTransport, RetryPolicy, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod chat;
mod info;
mod init;
mod version;

pub use chat::{ChatInput, ChatStrategy};
pub use info::InfoStrategy;
pub use init::InitStrategy;
pub use version::VersionStrategy;

/// Contract shared by every command strategy.
///
/// Strategies are stateless unit structs; everything a run needs arrives
/// through the associated `Input` type.
pub trait CommandStrategy: Send + Sync + 'static {
    type Input;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()>;
}

/// Components shared by commands that talk to the completion API.
pub struct Runtime {
    pub config: Config,
    pub transport: Arc<HttpTransport>,
    pub engine: Arc<ConversationEngine>,
}

pub fn init_runtime() -> anyhow::Result<Runtime> {
    let config = Config::load()?;
    let transport = Arc::new(HttpTransport::new(transport_config(&config))?);
    let backend: Arc<dyn CompletionBackend> = transport.clone();
    let engine = Arc::new(ConversationEngine::new(backend, engine_config(&config)));
    info!(
        "Using model {} at {}",
        config.provider.model, config.provider.base_url
    );
    Ok(Runtime {
        config,
        transport,
        engine,
    })
}

pub fn transport_config(config: &Config) -> TransportConfig {
    let provider = &config.provider;
    let transport = &config.transport;
    TransportConfig {
        base_url: provider.base_url.clone(),
        api_key: provider.api_key.clone(),
        model: Some(provider.model.clone()).filter(|m| !m.is_empty()),
        max_tokens: Some(provider.max_tokens),
        temperature: Some(provider.temperature),
        request_timeout: Duration::from_secs(transport.request_timeout_secs),
        stream_connect_timeout: Duration::from_secs(transport.stream_connect_timeout_secs),
        stall_timeout: Duration::from_secs(transport.stall_timeout_secs),
        rate_limit_per_second: transport.rate_limit_per_second,
        retry: RetryPolicy {
            max_retries: transport.max_retries,
            base_delay: Duration::from_millis(transport.retry_base_delay_ms),
            jitter: transport.retry_jitter,
        },
    }
}

pub fn engine_config(config: &Config) -> EngineConfig {
    let expiry = Duration::from_secs(config.conversation.context_expiry_secs);
    EngineConfig::default()
        .with_history(
            HistoryConfig::default().with_max_messages(config.conversation.max_context_size),
        )
        .with_context_expiry(expiry)
        .with_sweep_interval(expiry)
}

/// Show the first and last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if secret.is_empty() {
        "(not set)".to_string()
    } else if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "***".to_string()
    }
}
