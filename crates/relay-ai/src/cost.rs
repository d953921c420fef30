//! Cost accounting for prompts and completions.
//!
//! Prices are keyed by [`ModelFamily`] and expressed per token in the base
//! currency (USD). Conversion into other currencies uses fixed multipliers
//! supplied with the configuration; they are not refreshed at runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::ModelFamily;

/// Price per token for one family
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub prompt: f64,
    pub completion: f64,
}

impl ModelPrice {
    /// Build from the usual "dollars per 1K tokens" quote
    pub fn per_1k(prompt: f64, completion: f64) -> Self {
        Self {
            prompt: prompt / 1000.0,
            completion: completion / 1000.0,
        }
    }
}

/// Which side of the exchange is being priced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostKind {
    Prompt,
    Completion,
}

/// Family → price lookup
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    prices: HashMap<ModelFamily, ModelPrice>,
}

impl PriceTable {
    /// An empty table; every lookup costs nothing
    pub fn empty() -> Self {
        Self {
            prices: HashMap::new(),
        }
    }

    /// Set or replace the price of a family
    pub fn insert(&mut self, family: ModelFamily, price: ModelPrice) {
        if family != ModelFamily::Unknown {
            self.prices.insert(family, price);
        }
    }

    pub fn get(&self, family: ModelFamily) -> Option<ModelPrice> {
        self.prices.get(&family).copied()
    }

    /// Price per token of `kind` for `family`; zero when unpriced
    pub fn per_token(&self, family: ModelFamily, kind: CostKind) -> f64 {
        match (self.get(family), kind) {
            (Some(price), CostKind::Prompt) => price.prompt,
            (Some(price), CostKind::Completion) => price.completion,
            (None, _) => 0.0,
        }
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.insert(ModelFamily::Gpt35Turbo, ModelPrice::per_1k(0.002, 0.002));
        table.insert(ModelFamily::Gpt4, ModelPrice::per_1k(0.03, 0.06));
        table.insert(ModelFamily::Gpt4_32k, ModelPrice::per_1k(0.06, 0.12));
        table
    }
}

/// A display currency with its fixed multiplier against USD
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Currency {
    pub code: String,
    pub symbol: String,
    #[serde(default)]
    pub flag: String,
    /// Units of this currency per USD
    pub rate: f64,
}

impl Currency {
    pub fn new(
        code: impl Into<String>,
        symbol: impl Into<String>,
        flag: impl Into<String>,
        rate: f64,
    ) -> Self {
        Self {
            code: code.into(),
            symbol: symbol.into(),
            flag: flag.into(),
            rate,
        }
    }

    /// Default display currencies: USD, JPY and CNY
    pub fn defaults() -> Vec<Currency> {
        vec![
            Currency::new("USD", "$", "🇺🇸", 1.0),
            Currency::new("JPY", "￥", "🇯🇵", 132.45),
            Currency::new("CNY", "￥", "🇨🇳", 6.88),
        ]
    }
}

/// Converts token counts to money and formats cost lines
#[derive(Debug, Clone)]
pub struct CostEstimator {
    prices: PriceTable,
    currencies: Vec<Currency>,
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self::new(PriceTable::default(), Currency::defaults())
    }
}

impl CostEstimator {
    pub fn new(prices: PriceTable, currencies: Vec<Currency>) -> Self {
        Self { prices, currencies }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    pub fn currencies(&self) -> &[Currency] {
        &self.currencies
    }

    /// Cost of `tokens` of `kind` for a raw model identifier
    pub fn cost(&self, tokens: usize, model_id: &str, kind: CostKind) -> f64 {
        let family = ModelFamily::from_model_id(model_id);
        tokens as f64 * self.prices.per_token(family, kind)
    }

    /// Cost of `tokens` prompt tokens
    pub fn prompt_cost(&self, tokens: usize, model_id: &str) -> f64 {
        self.cost(tokens, model_id, CostKind::Prompt)
    }

    /// Cost of `tokens` generated tokens
    pub fn completion_cost(&self, tokens: usize, model_id: &str) -> f64 {
        self.cost(tokens, model_id, CostKind::Completion)
    }

    /// Convert a USD amount into every configured currency
    pub fn convert(&self, usd: f64) -> Vec<(&Currency, f64)> {
        self.currencies.iter().map(|c| (c, usd * c.rate)).collect()
    }

    /// Format the cost footer, e.g. `💠 1000  →  🇺🇸 $0.002 / 🇯🇵 ￥0.265`
    pub fn format_summary(&self, tokens: usize, usd: f64) -> String {
        let amounts = self
            .convert(usd)
            .into_iter()
            .map(|(currency, amount)| {
                if currency.flag.is_empty() {
                    format!("{}{:.3}", currency.symbol, amount)
                } else {
                    format!("{} {}{:.3}", currency.flag, currency.symbol, amount)
                }
            })
            .collect::<Vec<_>>()
            .join(" / ");

        format!("💠 {}  →  {}", tokens, amounts)
    }
}
