use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

const CONFIG_DIR: &str = "colloquy";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub conversation: ConversationSettings,
}

/// Where completions come from and how they are sampled.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProviderConfig {
    #[serde(default = "ProviderConfig::default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "ProviderConfig::default_model")]
    pub model: String,
    #[serde(default = "ProviderConfig::default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "ProviderConfig::default_temperature")]
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            api_key: String::new(),
            model: Self::default_model(),
            max_tokens: Self::default_max_tokens(),
            temperature: Self::default_temperature(),
        }
    }
}

impl ProviderConfig {
    fn default_base_url() -> String {
        "http://localhost:8000".to_string()
    }

    fn default_model() -> String {
        "gpt-3.5-turbo".to_string()
    }

    const fn default_max_tokens() -> u32 {
        2000
    }

    const fn default_temperature() -> f32 {
        0.7
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    #[serde(default = "TransportSettings::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "TransportSettings::default_stream_connect_timeout_secs")]
    pub stream_connect_timeout_secs: u64,
    #[serde(default = "TransportSettings::default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "TransportSettings::default_rate_limit_per_second")]
    pub rate_limit_per_second: usize,
    #[serde(default = "TransportSettings::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "TransportSettings::default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "TransportSettings::default_retry_jitter")]
    pub retry_jitter: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: Self::default_request_timeout_secs(),
            stream_connect_timeout_secs: Self::default_stream_connect_timeout_secs(),
            stall_timeout_secs: Self::default_stall_timeout_secs(),
            rate_limit_per_second: Self::default_rate_limit_per_second(),
            max_retries: Self::default_max_retries(),
            retry_base_delay_ms: Self::default_retry_base_delay_ms(),
            retry_jitter: Self::default_retry_jitter(),
        }
    }
}

impl TransportSettings {
    const fn default_request_timeout_secs() -> u64 {
        30
    }

    const fn default_stream_connect_timeout_secs() -> u64 {
        60
    }

    const fn default_stall_timeout_secs() -> u64 {
        30
    }

    const fn default_rate_limit_per_second() -> usize {
        10
    }

    const fn default_max_retries() -> u32 {
        3
    }

    const fn default_retry_base_delay_ms() -> u64 {
        100
    }

    const fn default_retry_jitter() -> bool {
        true
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ConversationSettings {
    #[serde(default = "ConversationSettings::default_max_context_size")]
    pub max_context_size: usize,
    #[serde(default = "ConversationSettings::default_context_expiry_secs")]
    pub context_expiry_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_context_size: Self::default_max_context_size(),
            context_expiry_secs: Self::default_context_expiry_secs(),
            system_prompt: None,
        }
    }
}

impl ConversationSettings {
    const fn default_max_context_size() -> usize {
        20
    }

    const fn default_context_expiry_secs() -> u64 {
        30 * 60
    }
}

pub const CONFIG_TEMPLATE: &str = r#"{
  "provider": {
    "base_url": "http://localhost:8000",
    "api_key": "your-api-key-here",
    "model": "gpt-3.5-turbo",
    "max_tokens": 2000,
    "temperature": 0.7
  },
  "transport": {
    "request_timeout_secs": 30,
    "stream_connect_timeout_secs": 60,
    "stall_timeout_secs": 30,
    "rate_limit_per_second": 10,
    "max_retries": 3,
    "retry_base_delay_ms": 100,
    "retry_jitter": true
  },
  "conversation": {
    "max_context_size": 20,
    "context_expiry_secs": 1800,
    "system_prompt": "You are a helpful AI assistant. Provide clear, concise responses."
  }
}
"#;

impl Config {
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?
            .join(CONFIG_DIR))
    }

    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Load `~/colloquy/config.json`, then apply `LLM_*` environment
    /// overrides. A missing file is not an error.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Override provider settings from `LLM_API_ENDPOINT`, `LLM_API_KEY`,
    /// `LLM_MODEL_NAME`, `LLM_MAX_TOKENS` and `LLM_TEMPERATURE`.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = &mut self.provider;
        if let Some(endpoint) = lookup("LLM_API_ENDPOINT") {
            provider.base_url = endpoint;
        }
        if let Some(key) = lookup("LLM_API_KEY") {
            provider.api_key = key;
        }
        if let Some(model) = lookup("LLM_MODEL_NAME") {
            provider.model = model;
        }
        if let Some(max_tokens) = parse_var(&lookup, "LLM_MAX_TOKENS")? {
            provider.max_tokens = max_tokens;
        }
        if let Some(temperature) = parse_var(&lookup, "LLM_TEMPERATURE")? {
            provider.temperature = temperature;
        }
        Ok(())
    }

    pub fn ensure_config_dir() -> anyhow::Result<PathBuf> {
        let config_dir = Self::config_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }

    /// Write the template to `~/colloquy/config.json`.
    pub fn create_config() -> anyhow::Result<PathBuf> {
        let config_path = Self::ensure_config_dir()?.join(CONFIG_FILE);
        Self::write_template(&config_path)?;
        Ok(config_path)
    }

    /// Refuses to overwrite an existing file.
    pub fn write_template(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            anyhow::bail!(
                "Config file already exists at: {}. Please edit it directly.",
                path.display()
            );
        }
        std::fs::write(path, CONFIG_TEMPLATE)?;
        info!("Wrote config template to {}", path.display());
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("{key} has an invalid value: {raw:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("colloquy-{name}-{}.json", std::process::id()))
    }

    #[test]
    fn test_template_parses_to_defaults() {
        let config: Config = serde_json::from_str(CONFIG_TEMPLATE)
            .unwrap_or_else(|e| panic!("template is invalid: {e}"));

        assert_eq!(config.transport, TransportSettings::default());
        assert_eq!(config.conversation.max_context_size, 20);
        assert_eq!(config.conversation.context_expiry_secs, 1800);
        assert_eq!(config.provider.model, "gpt-3.5-turbo");
        assert!(config.conversation.system_prompt.is_some());
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"provider": {"api_key": "k"}}"#)
            .unwrap_or_else(|e| panic!("parse failed: {e}"));

        assert_eq!(config.provider.api_key, "k");
        assert_eq!(config.provider.base_url, "http://localhost:8000");
        assert_eq!(config.provider.max_tokens, 2000);
        assert_eq!(config.transport.rate_limit_per_second, 10);
        assert_eq!(config.conversation, ConversationSettings::default());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from(&temp_path("absent"))
            .unwrap_or_else(|e| panic!("load failed: {e}"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_write_template_refuses_overwrite() {
        let path = temp_path("template");
        let _ = std::fs::remove_file(&path);

        assert!(Config::write_template(&path).is_ok());
        assert!(Config::write_template(&path).is_err());
        let loaded = Config::load_from(&path).unwrap_or_else(|e| panic!("load failed: {e}"));
        assert_eq!(loaded.provider.api_key, "your-api-key-here");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_env_overrides_replace_file_values() {
        let mut config = Config::default();
        let lookup = env(&[
            ("LLM_API_ENDPOINT", "https://llm.example.com"),
            ("LLM_API_KEY", "secret"),
            ("LLM_MODEL_NAME", "local-model"),
            ("LLM_MAX_TOKENS", "512"),
            ("LLM_TEMPERATURE", "0.2"),
        ]);

        assert!(config.apply_env_overrides_from(lookup).is_ok());
        assert_eq!(config.provider.base_url, "https://llm.example.com");
        assert_eq!(config.provider.api_key, "secret");
        assert_eq!(config.provider.model, "local-model");
        assert_eq!(config.provider.max_tokens, 512);
        assert!((config.provider.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_invalid_numeric_override_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_env_overrides_from(env(&[("LLM_MAX_TOKENS", "lots")]));

        let message = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("LLM_MAX_TOKENS"), "got {message}");
        assert_eq!(config.provider.max_tokens, 2000);
    }
}
