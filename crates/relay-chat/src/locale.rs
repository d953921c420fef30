//! Localized user-facing strings

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Keys of the strings the bot shows
pub mod keys {
    pub const WAIT_FOR_RESPONSE: &str = "wait_for_response";
    pub const ERROR: &str = "error";
    pub const ERROR_RESPONSE: &str = "error_response";
    pub const TOKEN_LIMIT_REACHED: &str = "token_limit_reached";
    pub const CLEARED: &str = "cleared";
    pub const CLEAR_CONTEXT: &str = "clear_context";
    pub const CANCELLED: &str = "cancelled";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[default]
    English,
    SimplifiedChinese,
    Japanese,
    Korean,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid language code: {0}")]
pub struct InvalidLanguage(pub String);

impl FromStr for Language {
    type Err = InvalidLanguage;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code.to_lowercase().as_str() {
            "en" | "enus" | "en-us" | "en_us" => Ok(Language::English),
            "zh" | "cn" | "zhcn" | "zh-cn" | "zh_cn" => Ok(Language::SimplifiedChinese),
            "ja" | "jp" | "jajp" | "ja-jp" | "ja_jp" => Ok(Language::Japanese),
            "ko" | "kr" | "kokr" | "ko-kr" | "ko_kr" => Ok(Language::Korean),
            _ => Err(InvalidLanguage(code.to_string())),
        }
    }
}

/// Lookup table of `key → language → text`
#[derive(Debug, Clone, Default)]
pub struct Localizer {
    entries: HashMap<String, HashMap<Language, String>>,
}

impl Localizer {
    /// An empty localizer
    pub fn new() -> Self {
        Self::default()
    }

    /// A localizer preloaded with the English defaults
    pub fn with_defaults() -> Self {
        let mut localizer = Self::new();
        for (key, text) in [
            (keys::WAIT_FOR_RESPONSE, "⌛ Generating a response..."),
            (keys::ERROR, "Error"),
            (
                keys::ERROR_RESPONSE,
                "Something went wrong while generating a response. Please try again later.",
            ),
            (
                keys::TOKEN_LIMIT_REACHED,
                "Your message is too long for this channel's token limit.",
            ),
            (keys::CLEARED, "Cleared"),
            (keys::CLEAR_CONTEXT, "Your conversation context has been cleared."),
            (keys::CANCELLED, "⏹️ Response cancelled."),
        ] {
            localizer.update(key, Language::English, text);
        }
        localizer
    }

    /// Set the text of `key` in `lang`
    pub fn update(&mut self, key: &str, lang: Language, value: impl Into<String>) {
        self.entries
            .entry(key.to_string())
            .or_default()
            .insert(lang, value.into());
    }

    /// Text of `key` in `lang`, falling back to English and then to the key
    pub fn fetch(&self, key: &str, lang: Language) -> String {
        self.entries
            .get(key)
            .and_then(|entry| entry.get(&lang).or_else(|| entry.get(&Language::English)))
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }
}
