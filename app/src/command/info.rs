use colloquy_config::Config;

use super::mask_secret;

/// Prints the effective configuration (file plus environment overrides).
#[derive(Debug, Clone, Copy)]
pub struct InfoStrategy;

impl super::CommandStrategy for InfoStrategy {
    type Input = ();

    async fn execute(&self, _input: Self::Input) -> anyhow::Result<()> {
        let config = Config::load()?;
        let path = Config::config_path()?;

        println!("=== colloquy Configuration ===\n");
        if path.exists() {
            println!("File: {}", path.display());
        } else {
            println!("File: {} (not found, using defaults)", path.display());
        }
        println!();

        let provider = &config.provider;
        println!("Provider:");
        println!("  Endpoint: {}", provider.base_url);
        println!("  API Key: {}", mask_secret(&provider.api_key));
        println!("  Model: {}", provider.model);
        println!("  Max Tokens: {}", provider.max_tokens);
        println!("  Temperature: {}", provider.temperature);
        println!();

        let transport = &config.transport;
        println!("Transport:");
        println!("  Request Timeout: {}s", transport.request_timeout_secs);
        println!(
            "  Stream Connect Timeout: {}s",
            transport.stream_connect_timeout_secs
        );
        println!("  Stall Timeout: {}s", transport.stall_timeout_secs);
        println!("  Rate Limit: {}/s", transport.rate_limit_per_second);
        println!(
            "  Retries: {} (base delay {}ms, jitter {})",
            transport.max_retries, transport.retry_base_delay_ms, transport.retry_jitter
        );
        println!();

        let conversation = &config.conversation;
        println!("Conversation:");
        println!("  Max Context Size: {}", conversation.max_context_size);
        println!("  Context Expiry: {}s", conversation.context_expiry_secs);
        if let Some(ref prompt) = conversation.system_prompt {
            println!("  System Prompt: {}", truncate(prompt, 60));
        }

        Ok(())
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
