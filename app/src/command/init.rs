use colloquy_config::Config;

/// Creates the default configuration file at `~/colloquy/config.json`.
#[derive(Debug, Clone, Copy)]
pub struct InitStrategy;

impl super::CommandStrategy for InitStrategy {
    type Input = ();

    async fn execute(&self, _input: Self::Input) -> anyhow::Result<()> {
        let path = Config::create_config()?;

        println!("Created config file at: {}", path.display());
        println!();
        println!("Next steps:");
        println!("   1. Set provider.base_url and provider.api_key");
        println!("   2. Run 'colloquy chat' to start a conversation");
        println!();
        println!("Environment overrides:");
        println!("   LLM_API_ENDPOINT, LLM_API_KEY, LLM_MODEL_NAME, LLM_MAX_TOKENS, LLM_TEMPERATURE");
        Ok(())
    }
}
