//! Per-model token pricing and cost calculation.
//!
//! Prices are quoted per 1000 tokens and held as [`Decimal`] so that costs
//! summed across calls, groups and models are exact. Rounding happens only when
//! a value is rendered.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

const TOKENS_PER_PRICE_UNIT: u64 = 1000;

/// Price of one model's input and output tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub model: String,
    pub input_cost_per_1k_tokens: Decimal,
    pub output_cost_per_1k_tokens: Decimal,
}

impl PricingEntry {
    pub fn new(model: impl Into<String>, input_cost_per_1k_tokens: Decimal, output_cost_per_1k_tokens: Decimal) -> Self {
        Self {
            model: model.into(),
            input_cost_per_1k_tokens,
            output_cost_per_1k_tokens,
        }
    }

    /// Cost of a call, in full precision.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> Decimal {
        let unit = Decimal::from(TOKENS_PER_PRICE_UNIT);
        Decimal::from(input_tokens) * self.input_cost_per_1k_tokens / unit
            + Decimal::from(output_tokens) * self.output_cost_per_1k_tokens / unit
    }
}

/// Read-only pricing reference data, keyed by model name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PricingTable {
    entries: HashMap<String, PricingEntry>,
}

impl PricingTable {
    /// Build a table, rejecting duplicate model names.
    pub fn from_entries(entries: impl IntoIterator<Item = PricingEntry>) -> Result<Self> {
        let mut table = HashMap::new();
        for entry in entries {
            if entry.input_cost_per_1k_tokens.is_sign_negative() || entry.output_cost_per_1k_tokens.is_sign_negative() {
                return Err(Error::configuration(format!("pricing for model '{}' is negative", entry.model)));
            }
            if table.contains_key(&entry.model) {
                return Err(Error::configuration(format!("duplicate pricing entry for model '{}'", entry.model)));
            }
            table.insert(entry.model.clone(), entry);
        }
        Ok(Self { entries: table })
    }

    pub fn get(&self, model: &str) -> Option<&PricingEntry> {
        self.entries.get(model)
    }

    /// Like [`get`](Self::get), but a missing entry is a [`Error::PricingLookup`].
    pub fn require(&self, model: &str) -> Result<&PricingEntry> {
        self.get(model).ok_or_else(|| Error::PricingLookup { model: model.to_string() })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Computes call costs against a [`PricingTable`].
#[derive(Debug, Clone, Copy)]
pub struct CostCalculator<'a> {
    pricing: &'a PricingTable,
}

impl<'a> CostCalculator<'a> {
    pub fn new(pricing: &'a PricingTable) -> Self {
        Self { pricing }
    }

    /// `input/1000 * input_price + output/1000 * output_price`.
    ///
    /// Never defaults to zero: an unknown model is a [`Error::PricingLookup`].
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Result<Decimal> {
        Ok(self.pricing.require(model)?.cost(input_tokens, output_tokens))
    }
}
