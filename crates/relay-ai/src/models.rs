//! Canonical model families and identifier normalization.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Dated snapshot suffixes such as `-0301`, `-0613` or `-2024-05-13`.
static DATED_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(?:\d{4}-\d{2}-\d{2}|\d{4})$").expect("valid regex"));

/// A canonical model family. Dated variants of a model map onto one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
    #[serde(rename = "gpt-4")]
    Gpt4,
    #[serde(rename = "gpt-4-32k")]
    Gpt4_32k,
    /// Anything we have no tables for
    Unknown,
}

impl ModelFamily {
    /// All families with known tables
    pub const KNOWN: [ModelFamily; 3] = [
        ModelFamily::Gpt35Turbo,
        ModelFamily::Gpt4,
        ModelFamily::Gpt4_32k,
    ];

    /// Normalize a raw model identifier to its family.
    pub fn from_model_id(model_id: &str) -> Self {
        let id = model_id.trim().to_ascii_lowercase();
        match DATED_SUFFIX.replace(&id, "").as_ref() {
            "gpt-3.5-turbo" => ModelFamily::Gpt35Turbo,
            "gpt-4" => ModelFamily::Gpt4,
            "gpt-4-32k" => ModelFamily::Gpt4_32k,
            _ => ModelFamily::Unknown,
        }
    }

    /// Canonical family name
    pub fn name(&self) -> &'static str {
        match self {
            ModelFamily::Gpt35Turbo => "gpt-3.5-turbo",
            ModelFamily::Gpt4 => "gpt-4",
            ModelFamily::Gpt4_32k => "gpt-4-32k",
            ModelFamily::Unknown => "unknown",
        }
    }

    /// Fixed tokens charged for every message in a prompt
    pub fn tokens_per_message(&self) -> i64 {
        match self {
            ModelFamily::Gpt35Turbo => 4,
            ModelFamily::Gpt4 | ModelFamily::Gpt4_32k => 3,
            ModelFamily::Unknown => 0,
        }
    }

    /// Adjustment applied when a message carries a participant name
    pub fn tokens_per_name(&self) -> i64 {
        match self {
            ModelFamily::Gpt35Turbo => -1,
            ModelFamily::Gpt4 | ModelFamily::Gpt4_32k => 1,
            ModelFamily::Unknown => 0,
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
