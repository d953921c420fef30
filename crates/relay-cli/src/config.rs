//! Configuration file support

use relay_ai::{
    CharRatioTokenizer, CostEstimator, Currency, ModelFamily, ModelPrice, PriceTable, Tokenizer,
    default_tokenizer,
};
use relay_chat::{
    ChannelSettings, ClearContextSettings, InvalidLanguage, Language, Localizer, ServerSettings,
    Settings,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Environment variables checked for the OpenAI key, in order
pub const API_KEY_ENV_VARS: [&str; 2] = ["RELAY_OPENAI_TOKEN", "OPENAI_API_KEY"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Server {server}: {source}")]
    Language {
        server: String,
        #[source]
        source: InvalidLanguage,
    },
}

/// Configuration for relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub openai: OpenAIConfig,
    pub tokenizer: TokenizerConfig,
    pub history: HistoryConfig,
    pub servers: Vec<ServerConfig>,
    /// `key -> language code -> text`
    pub locales: HashMap<String, HashMap<String, String>>,
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAIConfig {
    /// API key (alternative to environment variables)
    pub token: Option<String>,
    pub model_id: String,
    /// Compatible endpoint to use instead of api.openai.com
    pub base_url: Option<String>,
    pub streaming: bool,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            token: None,
            model_id: "gpt-3.5-turbo-0301".to_string(),
            base_url: None,
            streaming: true,
        }
    }
}

/// How prompt tokens are counted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    /// The model's BPE vocabulary
    #[default]
    Bpe,
    /// `chars_per_token` approximation
    CharRatio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub kind: TokenizerKind,
    /// Used by the `char_ratio` kind only
    pub chars_per_token: f64,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            kind: TokenizerKind::Bpe,
            chars_per_token: 4.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Trim stored history to this many tokens per user after each turn
    pub token_limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub chat_channels: Vec<ChatChannelConfig>,
    #[serde(default)]
    pub commands: CommandsConfig,
}

fn default_language() -> String {
    "enUS".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChannelConfig {
    pub id: String,
    /// Milliseconds between edits of a streaming response
    #[serde(default = "default_edit_interval")]
    pub message_edit_interval: u64,
    #[serde(default = "default_prompt_token_limit")]
    pub prompt_token_limit: i64,
    #[serde(default = "default_completion_token_limit")]
    pub completion_token_limit: u32,
}

fn default_edit_interval() -> u64 {
    5000
}

fn default_prompt_token_limit() -> i64 {
    500
}

fn default_completion_token_limit() -> u32 {
    500
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub clear_context: ClearContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearContextConfig {
    pub enable: bool,
    pub aliases: Vec<String>,
}

impl Default for ClearContextConfig {
    fn default() -> Self {
        Self {
            enable: true,
            aliases: vec!["clear".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// USD per 1K tokens, by model family name
    pub models: HashMap<String, PriceConfig>,
    /// Display currencies; the built-in set when empty
    pub currencies: Vec<Currency>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceConfig {
    pub prompt: f64,
    pub completion: f64,
}

/// Get the config directory
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relay")
}

/// Get the config file path: the explicit path, then `RELAY_CONFIG_PATH`,
/// then the default location
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("RELAY_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    config_dir().join("config.toml")
}

/// Write the example config if nothing exists at `path`
pub fn init(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(write_err)?;
    }
    fs::write(path, example_config()).map_err(write_err)?;
    Ok(path.to_path_buf())
}

impl Config {
    /// Load config from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// API key from the config, then from the environment
    pub fn api_key(&self) -> relay_ai::Result<String> {
        relay_ai::providers::get_api_key(self.openai.token.as_deref(), &API_KEY_ENV_VARS)
    }

    /// The immutable settings snapshot the orchestrator runs on
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let mut servers = HashMap::new();
        for server in &self.servers {
            let language: Language =
                server
                    .language
                    .parse()
                    .map_err(|source| ConfigError::Language {
                        server: server.id.clone(),
                        source,
                    })?;

            let chat_channels = server
                .chat_channels
                .iter()
                .map(|channel| {
                    let settings = ChannelSettings {
                        message_edit_interval: Duration::from_millis(channel.message_edit_interval),
                        prompt_token_limit: channel.prompt_token_limit,
                        completion_token_limit: channel.completion_token_limit,
                    };
                    (channel.id.clone(), settings)
                })
                .collect();

            let clear = &server.commands.clear_context;
            servers.insert(
                server.id.clone(),
                ServerSettings {
                    language,
                    chat_channels,
                    clear_context: ClearContextSettings {
                        enable: clear.enable,
                        aliases: clear.aliases.clone(),
                    },
                },
            );
        }

        Ok(Settings {
            model_id: self.openai.model_id.clone(),
            streaming: self.openai.streaming,
            history_token_limit: self.history.token_limit,
            servers,
        })
    }

    /// Built-in strings overlaid with the `[locales]` table
    pub fn localizer(&self) -> Localizer {
        let mut localizer = Localizer::with_defaults();
        for (key, entries) in &self.locales {
            for (code, text) in entries {
                match code.parse::<Language>() {
                    Ok(lang) => localizer.update(key, lang, text.clone()),
                    Err(e) => tracing::warn!(key = %key, error = %e, "skipping locale entry"),
                }
            }
        }
        localizer
    }

    /// Default prices and currencies overlaid with `[pricing]`
    pub fn cost_estimator(&self) -> CostEstimator {
        let mut prices = PriceTable::default();
        for (name, price) in &self.pricing.models {
            match ModelFamily::from_model_id(name) {
                ModelFamily::Unknown => {
                    tracing::warn!(model = %name, "skipping price for unknown model family")
                }
                family => prices.insert(family, ModelPrice::per_1k(price.prompt, price.completion)),
            }
        }

        let currencies = if self.pricing.currencies.is_empty() {
            Currency::defaults()
        } else {
            self.pricing.currencies.clone()
        };
        CostEstimator::new(prices, currencies)
    }

    /// Token counter for the configured model, built once and shared
    pub fn tokenizer(&self) -> Arc<dyn Tokenizer> {
        match self.tokenizer.kind {
            TokenizerKind::Bpe => default_tokenizer(&self.openai.model_id),
            TokenizerKind::CharRatio => {
                Arc::new(CharRatioTokenizer::new(self.tokenizer.chars_per_token))
            }
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# relay configuration file
# Place at ~/.config/relay/config.toml (Linux) or set RELAY_CONFIG_PATH

[openai]
# API key (optional - RELAY_OPENAI_TOKEN or OPENAI_API_KEY also work)
# token = "sk-..."
model_id = "gpt-3.5-turbo-0301"
# base_url = "https://api.openai.com/v1"

# Edit one message as the answer streams in, instead of waiting for it
streaming = true

[tokenizer]
# "bpe" counts with the model's vocabulary; "char_ratio" approximates
kind = "bpe"
# Characters per token for the char_ratio kind
# chars_per_token = 4.0

# Trim each user's stored history after every turn (optional)
# [history]
# token_limit = 2000

[[servers]]
id = "console"
# en, zh, ja or ko (loose codes such as enUS or zh-CN are fine)
language = "enUS"

[[servers.chat_channels]]
id = "console"
# Milliseconds between edits of a streaming response
message_edit_interval = 5000
prompt_token_limit = 500
completion_token_limit = 500

[servers.commands.clear_context]
enable = true
aliases = ["clear", "reset"]

# Override or translate user-facing strings
# [locales.wait_for_response]
# ja = "⌛ 回答を生成しています..."

# Prices in USD per 1K tokens
# [pricing.models."gpt-4"]
# prompt = 0.03
# completion = 0.06

# [[pricing.currencies]]
# code = "EUR"
# symbol = "€"
# flag = "🇪🇺"
# rate = 0.93
"#
}
